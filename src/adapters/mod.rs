mod amp;
mod claude;
mod codex;
mod common;
mod cursor;
mod gemini;
mod kiro;
mod opencode;
mod search;
mod warp;

pub use amp::AmpAdapter;
pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use cursor::CursorAdapter;
pub use gemini::GeminiAdapter;
pub use kiro::KiroAdapter;
pub use opencode::OpenCodeAdapter;
pub use search::{LineMatch, MessageMatch, SearchOptions, search_messages_in};
pub use warp::WarpAdapter;

use crate::domain::{Loaded, Message, Session, UsageStats, usage_from_messages};
use crate::infra::{FsWatcher, WatchError};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("home directory not found")]
    HomeDirNotFound,

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sqlite error in {path}: {source}")]
    Sqlite {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("invalid search pattern: {0}")]
    InvalidQuery(#[from] regex::Error),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

impl AdapterError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn sqlite(path: &Path, source: rusqlite::Error) -> Self {
        Self::Sqlite {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Capability {
    Sessions,
    Messages,
    Usage,
    Watch,
}

pub const ALL_CAPABILITIES: &[Capability] = &[
    Capability::Sessions,
    Capability::Messages,
    Capability::Usage,
    Capability::Watch,
];

/// One assistant tool's on-disk session store, normalized into sessions and messages.
pub trait Adapter: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn icon(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability] {
        ALL_CAPABILITIES
    }

    /// Cheap existence check. A missing store is `Ok(false)`.
    fn detect(&self, project_root: &Path) -> Result<bool, AdapterError>;

    /// Sorted by `updated_at`, newest first.
    fn sessions(&self, project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError>;

    /// Chronological; the returned vector is the caller's to mutate.
    fn messages(&self, session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError>;

    fn usage(&self, session_id: &str) -> Result<UsageStats, AdapterError> {
        let loaded = self.messages(session_id)?;
        Ok(usage_from_messages(&loaded.data))
    }

    /// Dropping the watcher stops it.
    fn watch(&self, project_root: &Path) -> Result<FsWatcher, AdapterError>;

    fn as_searcher(&self) -> Option<&dyn MessageSearcher> {
        None
    }
}

/// Optional capability: grep one session's messages.
pub trait MessageSearcher: Send + Sync {
    fn search_messages(
        &self,
        session_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<MessageMatch>, AdapterError>;
}

pub type AdapterFactory = Box<dyn Fn() -> Box<dyn Adapter> + Send + Sync>;

/// Constructors for every known adapter, in display order.
pub struct AdapterRegistry {
    factories: Vec<AdapterFactory>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(|| Box::new(ClaudeAdapter::from_env()));
        registry.register(|| Box::new(CodexAdapter::from_env()));
        registry.register(|| Box::new(GeminiAdapter::from_env()));
        registry.register(|| Box::new(AmpAdapter::from_env()));
        registry.register(|| Box::new(OpenCodeAdapter::from_env()));
        registry.register(|| Box::new(CursorAdapter::from_env()));
        registry.register(|| Box::new(KiroAdapter::from_env()));
        registry.register(|| Box::new(WarpAdapter::from_env()));
        registry
    }
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    pub fn register(&mut self, factory: impl Fn() -> Box<dyn Adapter> + Send + Sync + 'static) {
        self.factories.push(Box::new(factory));
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Builds a fresh instance of every adapter and runs all `detect` calls in parallel.
    /// Adapters that fail to detect are left out.
    pub fn detect_adapters(&self, project_root: &Path) -> BTreeMap<String, Arc<dyn Adapter>> {
        let mut slots: Vec<Option<Box<dyn Adapter>>> = Vec::with_capacity(self.factories.len());
        slots.resize_with(self.factories.len(), || None);

        std::thread::scope(|scope| {
            for (factory, slot) in self.factories.iter().zip(slots.iter_mut()) {
                scope.spawn(move || {
                    let adapter = factory();
                    match adapter.detect(project_root) {
                        Ok(true) => *slot = Some(adapter),
                        Ok(false) => {}
                        Err(error) => {
                            debug!(adapter = adapter.id(), %error, "adapter detect failed");
                        }
                    }
                });
            }
        });

        slots
            .into_iter()
            .flatten()
            .map(|adapter| (adapter.id().to_string(), Arc::from(adapter)))
            .collect()
    }
}
