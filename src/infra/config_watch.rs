use super::config::{Config, load_config};
use super::watch::{FsWatcher, WatchError, WatchSignal, watch_paths};
use notify::RecursiveMode;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub const CONFIG_DEBOUNCE: Duration = Duration::from_millis(300);

pub type ReloadCallback = Box<dyn FnMut(Arc<Config>) + Send>;
pub type ReloadErrorCallback = Box<dyn FnMut(String) + Send>;

/// Reloads the config file after it has been quiet for the debounce window.
///
/// The parent directory is watched rather than the file, so editors that save through a
/// temp file and rename still trigger a reload.
pub struct ConfigWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    pub fn start(path: &Path, on_reload: ReloadCallback) -> Result<Self, WatchError> {
        Self::start_with_debounce(path, CONFIG_DEBOUNCE, on_reload)
    }

    /// Like [`ConfigWatcher::start`], and reports a settled file that fails to load.
    pub fn start_reporting(
        path: &Path,
        on_reload: ReloadCallback,
        on_error: ReloadErrorCallback,
    ) -> Result<Self, WatchError> {
        Self::spawn(path, CONFIG_DEBOUNCE, on_reload, Some(on_error))
    }

    pub fn start_with_debounce(
        path: &Path,
        debounce: Duration,
        on_reload: ReloadCallback,
    ) -> Result<Self, WatchError> {
        Self::spawn(path, debounce, on_reload, None)
    }

    fn spawn(
        path: &Path,
        debounce: Duration,
        on_reload: ReloadCallback,
        on_error: Option<ReloadErrorCallback>,
    ) -> Result<Self, WatchError> {
        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let filter_name = path.file_name().map(|name| name.to_os_string());
        let watcher = watch_paths(
            &[(dir, RecursiveMode::NonRecursive)],
            Arc::new(move |candidate: &Path| {
                filter_name.is_some() && candidate.file_name() == filter_name.as_deref()
            }),
        )?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let path = path.to_path_buf();
        let handle = thread::Builder::new()
            .name("config-watch".to_string())
            .spawn(move || {
                debounce_loop(path, watcher, debounce, thread_stop, on_reload, on_error)
            })
            .map_err(WatchError::Spawn)?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn debounce_loop(
    path: PathBuf,
    watcher: FsWatcher,
    debounce: Duration,
    stop: Arc<AtomicBool>,
    mut on_reload: ReloadCallback,
    mut on_error: Option<ReloadErrorCallback>,
) {
    let poll = Duration::from_millis(50);
    let mut pending = false;
    let mut last_delivered: Option<Arc<Config>> = None;
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let wait = if pending { debounce } else { poll };
        match watcher.recv_timeout(wait) {
            Ok(WatchSignal::Changed(_)) => pending = true,
            Ok(WatchSignal::Error(message)) => {
                warn!(path = %path.display(), error = %message, "config watch error");
            }
            Err(RecvTimeoutError::Timeout) if pending => {
                pending = false;
                if stop.load(Ordering::Acquire) {
                    return;
                }
                let config = match reload(&path) {
                    Ok(Some(config)) => config,
                    Ok(None) => continue,
                    Err(message) => {
                        if let Some(on_error) = on_error.as_mut() {
                            on_error(message);
                        }
                        continue;
                    }
                };
                // A migration rewrite echoes back as a second change with the same contents.
                if last_delivered.as_deref() == Some(config.as_ref()) {
                    continue;
                }
                last_delivered = Some(config.clone());
                on_reload(config);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// `Ok(None)` when the file is momentarily unreadable.
fn reload(path: &Path) -> Result<Option<Arc<Config>>, String> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(error) => {
            debug!(path = %path.display(), %error, "config not readable yet");
            return Ok(None);
        }
    };
    if let Err(error) = serde_json::from_slice::<serde_json::Value>(&raw) {
        debug!(path = %path.display(), "config is not valid json; keeping previous");
        return Err(format!("invalid json: {error}"));
    }
    match load_config(path) {
        Ok(config) => Ok(Some(config)),
        Err(error) => {
            warn!(path = %path.display(), %error, "config reload failed; keeping previous");
            Err(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{Receiver, channel};
    use std::time::Instant;
    use tempfile::tempdir;

    fn start(path: &Path) -> (ConfigWatcher, Receiver<Arc<Config>>) {
        let (tx, rx) = channel();
        let watcher = ConfigWatcher::start(
            path,
            Box::new(move |config| {
                let _ = tx.send(config);
            }),
        )
        .expect("start watcher");
        (watcher, rx)
    }

    fn settle() {
        thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn reloads_after_overwrite() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"ui":{"showClock":true}}"#).expect("write");
        let (mut watcher, rx) = start(&path);
        settle();

        let started = Instant::now();
        fs::write(&path, r#"{"ui":{"showClock":false}}"#).expect("overwrite");
        let config = rx.recv_timeout(Duration::from_secs(2)).expect("reload");
        assert!(!config.ui.show_clock);
        assert!(started.elapsed() < Duration::from_millis(1500));
        watcher.stop();
        watcher.stop();
    }

    #[test]
    fn reloads_after_rename_over_the_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"ui":{"showClock":true}}"#).expect("write");
        let (_watcher, rx) = start(&path);
        settle();

        let tmp = dir.path().join("config.json.tmp");
        fs::write(&tmp, r#"{"ui":{"showClock":false}}"#).expect("write tmp");
        fs::rename(&tmp, &path).expect("rename");

        let config = rx.recv_timeout(Duration::from_secs(2)).expect("reload");
        assert!(!config.ui.show_clock);
    }

    #[test]
    fn burst_of_writes_reloads_once_with_final_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"version":2}"#).expect("write");
        let (_watcher, rx) = start(&path);
        settle();

        for n in 0..5 {
            let show = n % 2 == 1;
            fs::write(&path, format!(r#"{{"version":2,"ui":{{"showClock":{show}}}}}"#))
                .expect("write");
            thread::sleep(Duration::from_millis(20));
        }

        let config = rx.recv_timeout(Duration::from_secs(2)).expect("reload");
        assert!(!config.ui.show_clock);
        assert!(rx.recv_timeout(Duration::from_millis(800)).is_err());
    }

    #[test]
    fn invalid_json_does_not_reload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"version":2}"#).expect("write");
        let (_watcher, rx) = start(&path);
        settle();

        fs::write(&path, r#"{"ui": {"showClock": fal"#).expect("write");
        assert!(rx.recv_timeout(Duration::from_millis(1000)).is_err());
    }

    #[test]
    fn invalid_json_is_reported_and_previous_kept() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"version":2}"#).expect("write");
        let (tx, rx) = channel();
        let (err_tx, err_rx) = channel();
        let _watcher = ConfigWatcher::start_reporting(
            &path,
            Box::new(move |config| {
                let _ = tx.send(config);
            }),
            Box::new(move |message| {
                let _ = err_tx.send(message);
            }),
        )
        .expect("start watcher");
        settle();

        fs::write(&path, "{ not json").expect("write");
        let message = err_rx.recv_timeout(Duration::from_secs(2)).expect("error");
        assert!(message.contains("invalid json"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn other_files_in_the_directory_are_ignored() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"version":2}"#).expect("write");
        let (_watcher, rx) = start(&path);
        settle();

        fs::write(dir.path().join("state.json"), "{}").expect("write");
        assert!(rx.recv_timeout(Duration::from_millis(800)).is_err());
    }
}
