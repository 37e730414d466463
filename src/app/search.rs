use super::plugin::AdapterMap;
use crate::adapters::{MessageMatch, SearchOptions};
use crate::domain::Session;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

pub const SEARCH_WORKERS: usize = 4;
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_SEARCH_MATCHES: usize = 500;
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug)]
pub struct SearchLimits {
    pub workers: usize,
    pub timeout: Duration,
    /// Counted in matched lines across every session.
    pub max_matches: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            workers: SEARCH_WORKERS,
            timeout: SEARCH_TIMEOUT,
            max_matches: MAX_SEARCH_MATCHES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionSearchResult {
    pub session: Session,
    pub messages: Vec<MessageMatch>,
    pub collapsed: bool,
}

impl SessionSearchResult {
    pub fn match_count(&self) -> usize {
        count_lines(&self.messages)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SearchOutcome {
    /// Newest session first.
    pub results: Vec<SessionSearchResult>,
    pub total_matches: usize,
    /// Stopped early because the match cap was reached.
    pub truncated: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub searched: usize,
    /// Sessions whose adapter cannot search.
    pub skipped: usize,
    pub failed: usize,
}

impl SearchOutcome {
    pub fn stopped_early(&self) -> bool {
        self.truncated || self.timed_out || self.cancelled
    }
}

fn count_lines(messages: &[MessageMatch]) -> usize {
    messages.iter().map(|message| message.matches.len()).sum()
}

/// Drops trailing line matches so that at most `budget` remain.
fn trim_to(messages: &mut Vec<MessageMatch>, budget: usize) {
    let mut left = budget;
    messages.retain_mut(|message| {
        if left == 0 {
            return false;
        }
        message.matches.truncate(left);
        left -= message.matches.len();
        true
    });
}

#[derive(Default)]
struct Collected {
    results: Vec<SessionSearchResult>,
    total: usize,
    truncated: bool,
    searched: usize,
    skipped: usize,
    failed: usize,
}

pub fn search_all_sessions(
    sessions: &[Session],
    adapters: &AdapterMap,
    query: &str,
    options: &SearchOptions,
) -> SearchOutcome {
    search_all_sessions_with(sessions, adapters, query, options, SearchLimits::default(), None)
}

/// Greps sessions on a small worker pool. Workers stop taking sessions once the deadline
/// passes, the cap is reached, or `cancel` is set.
pub fn search_all_sessions_with(
    sessions: &[Session],
    adapters: &AdapterMap,
    query: &str,
    options: &SearchOptions,
    limits: SearchLimits,
    cancel: Option<&AtomicBool>,
) -> SearchOutcome {
    if query.is_empty() || sessions.is_empty() {
        return SearchOutcome::default();
    }
    let deadline = Instant::now() + limits.timeout;
    let next = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let timed_out = AtomicBool::new(false);
    let collected = Mutex::new(Collected::default());
    let workers = limits.workers.clamp(1, sessions.len());

    let should_stop = || {
        if stop.load(Ordering::Acquire) || cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            return true;
        }
        if Instant::now() >= deadline {
            timed_out.store(true, Ordering::Release);
            return true;
        }
        false
    };

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if should_stop() {
                        return;
                    }
                    let idx = next.fetch_add(1, Ordering::AcqRel);
                    let Some(session) = sessions.get(idx) else {
                        return;
                    };
                    let searcher = adapters
                        .get(session.adapter_id)
                        .and_then(|adapter| adapter.as_searcher());
                    let Some(searcher) = searcher else {
                        collected.lock().unwrap_or_else(|e| e.into_inner()).skipped += 1;
                        continue;
                    };
                    let found = searcher.search_messages(&session.id, query, options);

                    let mut guard = collected.lock().unwrap_or_else(|e| e.into_inner());
                    guard.searched += 1;
                    let mut messages = match found {
                        Ok(messages) => messages,
                        Err(error) => {
                            debug!(adapter = session.adapter_id, session = %session.id, %error, "session search failed");
                            guard.failed += 1;
                            continue;
                        }
                    };
                    if guard.truncated {
                        continue;
                    }
                    let budget = limits.max_matches - guard.total;
                    if count_lines(&messages) >= budget {
                        trim_to(&mut messages, budget);
                        guard.truncated = true;
                        stop.store(true, Ordering::Release);
                    }
                    let found_lines = count_lines(&messages);
                    if found_lines == 0 {
                        continue;
                    }
                    guard.total += found_lines;
                    guard.results.push(SessionSearchResult {
                        session: session.clone(),
                        messages,
                        collapsed: false,
                    });
                }
            });
        }
    });

    let collected = collected.into_inner().unwrap_or_else(|e| e.into_inner());
    let mut results = collected.results;
    results.sort_by(|a, b| b.session.updated_at.cmp(&a.session.updated_at));
    SearchOutcome {
        results,
        total_matches: collected.total,
        truncated: collected.truncated,
        timed_out: timed_out.load(Ordering::Acquire),
        cancelled: cancel.is_some_and(|flag| flag.load(Ordering::Acquire)),
        searched: collected.searched,
        skipped: collected.skipped,
        failed: collected.failed,
    }
}

/// Debounces query edits. Every edit bumps the version; a result is applied only while its
/// version is still the newest.
#[derive(Clone, Debug, Default)]
pub struct SearchScheduler {
    version: u64,
    query: String,
}

impl SearchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new query and returns the version a debounce timer should carry.
    pub fn schedule(&mut self, query: &str) -> u64 {
        self.version += 1;
        self.query = query.to_string();
        self.version
    }

    /// Invalidates anything in flight.
    pub fn cancel(&mut self) {
        self.version += 1;
        self.query.clear();
    }

    pub fn is_current(&self, version: u64) -> bool {
        version == self.version
    }

    /// The query to run once the timer for `version` fires, if it is still current.
    pub fn due(&self, version: u64) -> Option<&str> {
        (self.is_current(version) && !self.query.is_empty()).then_some(self.query.as_str())
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Adapter, AdapterError, LineMatch, MessageSearcher};
    use crate::domain::{Loaded, Message, Role};
    use crate::infra::FsWatcher;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use time::OffsetDateTime;
    use time::macros::datetime;

    /// Every session yields `per_session` single-line matches.
    struct Grep {
        id: &'static str,
        per_session: usize,
        delay: Duration,
    }

    impl Adapter for Grep {
        fn id(&self) -> &'static str {
            self.id
        }
        fn name(&self) -> &'static str {
            "Grep"
        }
        fn icon(&self) -> &'static str {
            "g"
        }
        fn detect(&self, _project_root: &Path) -> Result<bool, AdapterError> {
            Ok(true)
        }
        fn sessions(&self, _project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
            Ok(Loaded::complete(Vec::new()))
        }
        fn messages(&self, _session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError> {
            Ok(Loaded::complete(Vec::new()))
        }
        fn watch(&self, project_root: &Path) -> Result<FsWatcher, AdapterError> {
            Err(AdapterError::UnknownSession(project_root.display().to_string()))
        }
        fn as_searcher(&self) -> Option<&dyn MessageSearcher> {
            (self.per_session > 0).then_some(self as &dyn MessageSearcher)
        }
    }

    impl MessageSearcher for Grep {
        fn search_messages(
            &self,
            session_id: &str,
            query: &str,
            _options: &SearchOptions,
        ) -> Result<Vec<MessageMatch>, AdapterError> {
            thread::sleep(self.delay);
            Ok((0..self.per_session)
                .map(|idx| MessageMatch {
                    message_id: format!("{session_id}-{idx}"),
                    message_idx: idx,
                    role: Role::Assistant,
                    timestamp: OffsetDateTime::UNIX_EPOCH,
                    matches: vec![LineMatch {
                        line_no: 1,
                        line_text: query.to_string(),
                        col_start: 0,
                        col_end: query.len(),
                    }],
                })
                .collect())
        }
    }

    fn session(adapter_id: &'static str, n: i64) -> Session {
        let at = datetime!(2026-01-01 00:00 UTC) + time::Duration::minutes(n);
        Session {
            id: format!("s{n}"),
            name: format!("session {n}"),
            slug: format!("s{n}"),
            adapter_id,
            adapter_name: "Grep",
            adapter_icon: "g",
            created_at: at,
            updated_at: at,
            duration: Duration::ZERO,
            total_tokens: 0,
            est_cost: 0.0,
            message_count: 0,
            is_sub_agent: false,
            source_path: PathBuf::new(),
            source_size_bytes: 0,
        }
    }

    fn adapters(list: Vec<Grep>) -> AdapterMap {
        list.into_iter()
            .map(|adapter| (adapter.id.to_string(), Arc::new(adapter) as Arc<dyn Adapter>))
            .collect()
    }

    #[test]
    fn cap_stops_search_at_exactly_the_limit() {
        let adapters = adapters(vec![Grep {
            id: "grep",
            per_session: 30,
            delay: Duration::from_millis(5),
        }]);
        let sessions: Vec<Session> = (0..20).map(|n| session("grep", n)).collect();

        let started = Instant::now();
        let outcome = search_all_sessions(&sessions, &adapters, "needle", &SearchOptions::default());

        assert!(started.elapsed() < SEARCH_TIMEOUT);
        assert_eq!(outcome.total_matches, 500);
        assert_eq!(
            outcome.results.iter().map(SessionSearchResult::match_count).sum::<usize>(),
            500
        );
        assert!(outcome.truncated);
        assert!(outcome.stopped_early());
    }

    #[test]
    fn results_are_newest_first_and_unsearchable_sessions_are_skipped() {
        let adapters = adapters(vec![
            Grep {
                id: "grep",
                per_session: 2,
                delay: Duration::ZERO,
            },
            Grep {
                id: "sqlite",
                per_session: 0,
                delay: Duration::ZERO,
            },
        ]);
        let sessions = vec![
            session("grep", 1),
            session("sqlite", 2),
            session("grep", 5),
            session("grep", 3),
        ];
        let outcome = search_all_sessions(&sessions, &adapters, "x", &SearchOptions::default());

        let order: Vec<&str> = outcome
            .results
            .iter()
            .map(|result| result.session.id.as_str())
            .collect();
        assert_eq!(order, vec!["s5", "s3", "s1"]);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.total_matches, 6);
        assert!(!outcome.stopped_early());
    }

    #[test]
    fn deadline_stops_taking_new_sessions() {
        let adapters = adapters(vec![Grep {
            id: "grep",
            per_session: 1,
            delay: Duration::from_millis(50),
        }]);
        let sessions: Vec<Session> = (0..40).map(|n| session("grep", n)).collect();
        let limits = SearchLimits {
            workers: 2,
            timeout: Duration::from_millis(120),
            max_matches: MAX_SEARCH_MATCHES,
        };
        let outcome =
            search_all_sessions_with(&sessions, &adapters, "x", &SearchOptions::default(), limits, None);
        assert!(outcome.timed_out);
        assert!(outcome.searched < 40);
    }

    #[test]
    fn cancel_flag_is_honored() {
        let adapters = adapters(vec![Grep {
            id: "grep",
            per_session: 1,
            delay: Duration::ZERO,
        }]);
        let sessions: Vec<Session> = (0..10).map(|n| session("grep", n)).collect();
        let cancel = AtomicBool::new(true);
        let outcome = search_all_sessions_with(
            &sessions,
            &adapters,
            "x",
            &SearchOptions::default(),
            SearchLimits::default(),
            Some(&cancel),
        );
        assert!(outcome.cancelled);
        assert_eq!(outcome.searched, 0);
    }

    #[test]
    fn stale_versions_are_dropped() {
        let mut scheduler = SearchScheduler::new();
        let first = scheduler.schedule("fo");
        let second = scheduler.schedule("foo");
        assert_eq!(scheduler.due(first), None);
        assert_eq!(scheduler.due(second), Some("foo"));
        scheduler.cancel();
        assert!(!scheduler.is_current(second));
    }
}
