use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
    fn instant(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(OffsetDateTime, Instant)>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            state: Mutex::new((start, Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.0 += by;
        state.1 += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    fn instant(&self) -> Instant {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).1
    }
}

/// The parts of a file's metadata that identify a version of its contents.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FileStamp {
    pub modified: SystemTime,
    pub size: u64,
}

impl FileStamp {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: metadata.len(),
        })
    }

    pub fn modified_at(&self) -> OffsetDateTime {
        OffsetDateTime::from(self.modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use time::macros::datetime;

    #[test]
    fn manual_clock_advances_on_request() {
        let clock = ManualClock::new(datetime!(2026-02-19 00:00 UTC));
        let before = clock.instant();
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), datetime!(2026-02-19 00:01:30 UTC));
        assert_eq!(clock.instant() - before, Duration::from_secs(90));
    }

    #[test]
    fn file_stamp_tracks_size() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a.jsonl");
        fs::write(&path, "abc").expect("write");
        let first = FileStamp::of(&path).expect("stamp");
        assert_eq!(first.size, 3);
        fs::write(&path, "abcdef").expect("write");
        let second = FileStamp::of(&path).expect("stamp");
        assert_ne!(first, second);
        assert!(FileStamp::of(&dir.path().join("missing")).is_err());
    }
}
