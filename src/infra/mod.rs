mod bus;
mod cache;
mod clock;
mod config;
mod config_watch;
mod git;
mod logging;
mod migrate;
pub mod paths;
mod state;
mod td;
mod watch;

pub use bus::*;
pub use cache::*;
pub use clock::*;
pub use config::*;
pub use config_watch::*;
pub use git::*;
pub use logging::*;
pub use migrate::{
    CURRENT_CONFIG_VERSION, MIGRATIONS, MigrateError, Migration, MigrationOutcome, backup_path,
    detect_version, migrate_document, migrate_file,
};
pub use state::*;
pub use td::*;
pub use watch::*;
