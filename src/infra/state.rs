use super::migrate::write_atomic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state: {0}")]
    Read(#[source] io::Error),

    #[error("failed to parse state: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to write state: {0}")]
    Write(#[source] io::Error),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
    #[default]
    Unified,
    Split,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    #[serde(default)]
    pub git_diff_mode: DiffMode,
    #[serde(default)]
    pub active_plugin_by_project: BTreeMap<String, String>,
    #[serde(default)]
    pub last_worktree_by_repo: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_browser_tree_width: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-project UI preferences, written back on every change.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<UiState>,
}

pub fn state_path(config_dir: &Path) -> PathBuf {
    config_dir.join("state.json")
}

fn key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

impl StateStore {
    /// A missing or unreadable file starts from defaults; the store stays usable either way.
    pub fn open(path: &Path) -> Self {
        let state = match Self::read(path) {
            Ok(state) => state,
            Err(error) => {
                warn!(path = %path.display(), %error, "ignoring unreadable state file");
                UiState::default()
            }
        };
        Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        }
    }

    fn read(path: &Path) -> Result<UiState, StateError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(UiState::default());
            }
            Err(error) => return Err(StateError::Read(error)),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn snapshot(&self) -> UiState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn active_plugin(&self, project_root: &Path) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active_plugin_by_project
            .get(&key(project_root))
            .cloned()
    }

    pub fn set_active_plugin(&self, project_root: &Path, plugin_id: &str) -> Result<(), StateError> {
        self.mutate(|state| {
            state
                .active_plugin_by_project
                .insert(key(project_root), plugin_id.to_string());
        })
    }

    pub fn last_worktree(&self, repo_root: &Path) -> Option<PathBuf> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_worktree_by_repo
            .get(&key(repo_root))
            .map(PathBuf::from)
    }

    pub fn set_last_worktree(&self, repo_root: &Path, worktree: &Path) -> Result<(), StateError> {
        self.mutate(|state| {
            state
                .last_worktree_by_repo
                .insert(key(repo_root), key(worktree));
        })
    }

    pub fn diff_mode(&self) -> DiffMode {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .git_diff_mode
    }

    pub fn set_diff_mode(&self, mode: DiffMode) -> Result<(), StateError> {
        self.mutate(|state| state.git_diff_mode = mode)
    }

    pub fn last_seen_version(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_seen_version
            .clone()
    }

    pub fn set_last_seen_version(&self, version: &str) -> Result<(), StateError> {
        self.mutate(|state| state.last_seen_version = Some(version.to_string()))
    }

    fn mutate(&self, change: impl FnOnce(&mut UiState)) -> Result<(), StateError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        change(&mut state);
        let mut text = serde_json::to_string_pretty(&*state)?;
        text.push('\n');
        write_atomic(&self.path, text.as_bytes()).map_err(StateError::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persists_each_mutation_and_reloads() {
        let dir = tempdir().expect("tempdir");
        let path = state_path(dir.path());
        let store = StateStore::open(&path);
        assert_eq!(store.active_plugin(Path::new("/p")), None);

        store
            .set_active_plugin(Path::new("/p"), "conversations")
            .expect("save");
        store
            .set_last_worktree(Path::new("/repo"), Path::new("/repo-feature"))
            .expect("save");
        store.set_diff_mode(DiffMode::Split).expect("save");
        store.set_last_seen_version("0.2.0").expect("save");

        let reopened = StateStore::open(&path);
        assert_eq!(
            reopened.active_plugin(Path::new("/p")).as_deref(),
            Some("conversations")
        );
        assert_eq!(
            reopened.last_worktree(Path::new("/repo")),
            Some(PathBuf::from("/repo-feature"))
        );
        assert_eq!(reopened.diff_mode(), DiffMode::Split);
        assert_eq!(reopened.last_seen_version().as_deref(), Some("0.2.0"));
    }

    #[test]
    fn keeps_unknown_fields_and_survives_garbage() {
        let dir = tempdir().expect("tempdir");
        let path = state_path(dir.path());
        fs::write(&path, r#"{"gitDiffMode":"split","fileBrowserTreeWidth":40,"pinned":["a"]}"#)
            .expect("write");
        let store = StateStore::open(&path);
        assert_eq!(store.snapshot().file_browser_tree_width, Some(40));
        store.set_active_plugin(Path::new("/x"), "git").expect("save");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"pinned\""));

        fs::write(&path, "not json").expect("write");
        let store = StateStore::open(&path);
        assert_eq!(store.snapshot(), UiState::default());
    }
}
