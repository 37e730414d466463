mod event;
mod focus;
mod issue;
mod parse;
mod partial;
mod types;
mod worktree;

pub use event::*;
pub use focus::*;
pub use issue::*;
pub use parse::*;
pub use partial::*;
pub use types::*;
pub use worktree::*;
