use crate::domain::{Event, EventData, Topic};
use crate::infra::Dispatcher;
use notify::event::EventKind;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Bursts of file events closer together than this are coalesced into one `adapter.watch` event.
pub const ADAPTER_WATCH_COALESCE: Duration = Duration::from_millis(250);

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchSignal {
    Changed(Vec<PathBuf>),
    Error(String),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("nothing to watch")]
    NoTargets,

    #[error("failed to start watch thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// A filesystem watch. Dropping it stops delivery.
#[derive(Debug)]
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<WatchSignal>,
}

impl FsWatcher {
    pub fn try_recv(&self) -> Option<WatchSignal> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<WatchSignal, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Watches each target and reports changes to paths accepted by `filter`.
pub fn watch_paths(
    targets: &[(PathBuf, RecursiveMode)],
    filter: PathFilter,
) -> Result<FsWatcher, WatchError> {
    let (tx, rx) = channel::<WatchSignal>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if let Some(paths) = relevant_paths(&event, filter.as_ref()) {
                    let _ = tx.send(WatchSignal::Changed(paths));
                }
            }
            Err(error) => {
                let _ = tx.send(WatchSignal::Error(error.to_string()));
            }
        },
        Config::default(),
    )?;

    let mut watched = 0;
    for (path, mode) in targets {
        if !path.exists() {
            continue;
        }
        watcher.watch(path, *mode)?;
        watched += 1;
    }
    if watched == 0 {
        return Err(WatchError::NoTargets);
    }

    Ok(FsWatcher {
        _watcher: watcher,
        rx,
    })
}

pub fn extension_filter(extensions: &'static [&'static str]) -> PathFilter {
    Arc::new(move |path: &Path| {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.contains(&ext))
    })
}

/// Matches a SQLite database and its `-wal`/`-shm`/`-journal` siblings.
pub fn sqlite_family_filter(db_path: &Path) -> PathFilter {
    let db_name = db_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    Arc::new(move |path: &Path| {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        name == db_name
            || name
                .strip_prefix(db_name.as_str())
                .is_some_and(|suffix| matches!(suffix, "-wal" | "-shm" | "-journal"))
    })
}

fn relevant_paths(
    event: &notify::Event,
    filter: &(dyn Fn(&Path) -> bool + Send + Sync),
) -> Option<Vec<PathBuf>> {
    if matches!(event.kind, EventKind::Access(_)) {
        return None;
    }
    if event.paths.is_empty() {
        return Some(Vec::new());
    }
    let paths = event
        .paths
        .iter()
        .filter(|path| filter(path.as_path()))
        .cloned()
        .collect::<Vec<_>>();
    (!paths.is_empty()).then_some(paths)
}

/// Forwards a watcher's changes onto the bus as `adapter.watch` events until stopped.
pub struct WatchBridge {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WatchBridge {
    pub fn spawn(
        adapter_id: &'static str,
        watcher: FsWatcher,
        bus: Weak<Dispatcher>,
    ) -> Result<Self, WatchError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("watch-{adapter_id}"))
            .spawn(move || bridge_loop(adapter_id, watcher, bus, thread_stop))
            .map_err(WatchError::Spawn)?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bridge_loop(
    adapter_id: &'static str,
    watcher: FsWatcher,
    bus: Weak<Dispatcher>,
    stop: Arc<AtomicBool>,
) {
    let poll = Duration::from_millis(100);
    while !stop.load(Ordering::Acquire) {
        let first = match watcher.recv_timeout(poll) {
            Ok(signal) => signal,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let mut changed = matches!(first, WatchSignal::Changed(_));
        if let WatchSignal::Error(message) = first {
            warn!(adapter = adapter_id, error = %message, "adapter watch error");
        }
        // Coalesce the rest of the burst.
        while let Ok(signal) = watcher.recv_timeout(ADAPTER_WATCH_COALESCE) {
            match signal {
                WatchSignal::Changed(_) => changed = true,
                WatchSignal::Error(message) => {
                    warn!(adapter = adapter_id, error = %message, "adapter watch error");
                }
            }
            if stop.load(Ordering::Acquire) {
                return;
            }
        }
        if !changed {
            continue;
        }
        let Some(bus) = bus.upgrade() else {
            return;
        };
        debug!(adapter = adapter_id, "adapter store changed");
        bus.publish(
            Topic::AdapterWatch,
            Event::new(
                Topic::AdapterWatch,
                "changed",
                EventData::AdapterChanged {
                    adapter_id: adapter_id.to_string(),
                    session_id: None,
                },
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::fs;
    use tempfile::tempdir;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn ignores_access_and_unrelated_files() {
        let filter = extension_filter(&["jsonl"]);
        assert_eq!(
            relevant_paths(&event(EventKind::Access(AccessKind::Any), &["/a.jsonl"]), filter.as_ref()),
            None
        );
        assert_eq!(
            relevant_paths(&event(EventKind::Create(CreateKind::File), &["/a.txt"]), filter.as_ref()),
            None
        );
        assert_eq!(
            relevant_paths(
                &event(EventKind::Modify(ModifyKind::Any), &["/a.txt", "/b.jsonl"]),
                filter.as_ref()
            ),
            Some(vec![PathBuf::from("/b.jsonl")])
        );
    }

    #[test]
    fn sqlite_filter_matches_wal_siblings_only() {
        let filter = sqlite_family_filter(Path::new("/data/store.db"));
        assert!(filter(Path::new("/data/store.db")));
        assert!(filter(Path::new("/data/store.db-wal")));
        assert!(filter(Path::new("/data/store.db-shm")));
        assert!(!filter(Path::new("/data/store.db.bak")));
        assert!(!filter(Path::new("/data/other.db")));
    }

    #[test]
    fn missing_targets_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let result = watch_paths(
            &[(dir.path().join("absent"), RecursiveMode::Recursive)],
            extension_filter(&["json"]),
        );
        assert!(matches!(result, Err(WatchError::NoTargets)));
    }

    #[test]
    fn bridge_publishes_adapter_watch_events() {
        let dir = tempdir().expect("tempdir");
        let watcher = watch_paths(
            &[(dir.path().to_path_buf(), RecursiveMode::Recursive)],
            extension_filter(&["jsonl"]),
        )
        .expect("watch");
        let bus = Arc::new(Dispatcher::new());
        let sub = bus.subscribe(Topic::AdapterWatch);
        let mut bridge = WatchBridge::spawn("claude-code", watcher, Arc::downgrade(&bus)).expect("spawn");

        fs::write(dir.path().join("s.jsonl"), "{}\n").expect("write");
        let event = sub.recv_timeout(Duration::from_secs(5)).expect("event");
        assert_eq!(
            event.data,
            EventData::AdapterChanged {
                adapter_id: "claude-code".to_string(),
                session_id: None
            }
        );
        bridge.stop();
        bridge.stop();
    }
}
