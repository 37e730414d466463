use super::keymap::{Binding, Command};
use super::line_editor::{EditOutcome, LineEditor};
use super::modal::step;
use super::plugin::{
    AdapterMap, Notice, Plugin, PluginContext, PluginError, PluginMsg, Task,
};
use super::search::{
    SEARCH_DEBOUNCE, SearchOutcome, SearchScheduler, search_all_sessions,
};
use crate::adapters::SearchOptions;
use crate::domain::{FocusContext, Loaded, Message, Session, Topic, sort_sessions};
use crate::infra::{Overflow, SubscribeOptions, Subscription};
use crate::ui::theme::Styles;
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::Frame;
use ratatui::layout::Rect;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, warn};

pub const PLUGIN_ID: &str = "conversations";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pane {
    Sidebar,
    Main,
}

#[derive(Debug)]
struct SessionsLoaded {
    generation: u64,
    sessions: Vec<Session>,
    partial: Vec<(String, usize)>,
    failed: Vec<String>,
}

#[derive(Debug)]
struct MessagesLoaded {
    key: (String, String),
    result: Result<Loaded<Vec<Message>>, String>,
}

#[derive(Debug)]
struct SearchDue {
    version: u64,
}

#[derive(Debug)]
struct SearchDone {
    version: u64,
    outcome: SearchOutcome,
}

#[derive(Debug)]
pub struct OpenSession {
    pub session: Session,
    pub messages: Vec<Message>,
    pub loading: bool,
    pub partial: Option<String>,
    pub error: Option<String>,
    pub scroll: usize,
    /// Message to bring into view once loaded.
    pub jump_to: Option<usize>,
}

impl OpenSession {
    fn key(&self) -> (String, String) {
        self.session.key()
    }
}

#[derive(Debug, Default)]
pub struct SearchState {
    pub input: LineEditor,
    /// Typing goes to `input` while true.
    pub editing: bool,
    pub running: bool,
    pub outcome: Option<SearchOutcome>,
    pub selected: usize,
}

/// Session browser over every detected adapter, with cross-session search.
pub struct ConversationsPlugin {
    ctx: Option<PluginContext>,
    watch: Option<Subscription>,
    generation: u64,
    scheduler: SearchScheduler,
    notices: Vec<Notice>,
    pub(crate) focused: bool,
    pub(crate) pane: Pane,
    pub(crate) sessions: Vec<Session>,
    pub(crate) loading: bool,
    pub(crate) selected: usize,
    pub(crate) open: Option<OpenSession>,
    pub(crate) search: Option<SearchState>,
    pub(crate) show_thinking: bool,
    pub(crate) size: (u16, u16),
}

impl Default for ConversationsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationsPlugin {
    pub fn new() -> Self {
        Self {
            ctx: None,
            watch: None,
            generation: 0,
            scheduler: SearchScheduler::new(),
            notices: Vec::new(),
            focused: false,
            pane: Pane::Sidebar,
            sessions: Vec::new(),
            loading: false,
            selected: 0,
            open: None,
            search: None,
            show_thinking: false,
            size: (0, 0),
        }
    }

    pub(crate) fn workdir(&self) -> Option<&PathBuf> {
        self.ctx.as_ref().map(|ctx| &ctx.workdir)
    }

    pub(crate) fn adapter_count(&self) -> usize {
        self.ctx.as_ref().map_or(0, |ctx| ctx.adapters.len())
    }

    fn load_sessions(&mut self) -> Vec<Task> {
        let Some(ctx) = self.ctx.as_ref() else {
            return Vec::new();
        };
        self.generation += 1;
        self.loading = true;
        let generation = self.generation;
        let adapters = ctx.adapters.clone();
        let workdir = ctx.workdir.clone();
        vec![Task::for_plugin(PLUGIN_ID, "load sessions", move || {
            collect_sessions(generation, &adapters, &workdir)
        })]
    }

    fn open_selected(&mut self, jump_to: Option<usize>) -> Vec<Task> {
        let Some(session) = self.sessions.get(self.selected).cloned() else {
            return Vec::new();
        };
        self.open_session(session, jump_to)
    }

    fn open_session(&mut self, session: Session, jump_to: Option<usize>) -> Vec<Task> {
        let Some(adapter) = self
            .ctx
            .as_ref()
            .and_then(|ctx| ctx.adapters.get(session.adapter_id).cloned())
        else {
            self.notices
                .push(Notice::error(format!("{} is no longer available", session.adapter_name)));
            return Vec::new();
        };
        let key = session.key();
        self.open = Some(OpenSession {
            session,
            messages: Vec::new(),
            loading: true,
            partial: None,
            error: None,
            scroll: 0,
            jump_to,
        });
        vec![Task::for_plugin(PLUGIN_ID, "load messages", move || {
            let result = adapter
                .messages(&key.1)
                .map_err(|error| error.to_string());
            MessagesLoaded { key, result }
        })]
    }

    fn on_sessions(&mut self, loaded: SessionsLoaded) {
        if loaded.generation != self.generation {
            return;
        }
        self.loading = false;
        let keep = self
            .sessions
            .get(self.selected)
            .map(Session::key);
        self.sessions = loaded.sessions;
        self.selected = keep
            .and_then(|key| self.sessions.iter().position(|session| session.key() == key))
            .unwrap_or(0)
            .min(self.sessions.len().saturating_sub(1));

        let recovered: usize = loaded.partial.iter().map(|(_, count)| *count).sum();
        if !loaded.partial.is_empty() {
            self.notices
                .push(Notice::warning(format!("{recovered} items recovered")));
        }
        for adapter in loaded.failed {
            self.notices
                .push(Notice::error(format!("{adapter}: sessions unavailable")));
        }
    }

    fn on_messages(&mut self, loaded: MessagesLoaded) {
        let Some(open) = self.open.as_mut().filter(|open| open.key() == loaded.key) else {
            return;
        };
        open.loading = false;
        match loaded.result {
            Ok(messages) => {
                if let Some(partial) = &messages.partial {
                    open.partial = Some(partial.to_string());
                    self.notices.push(Notice::warning(format!(
                        "{} items recovered",
                        partial.parsed_count
                    )));
                }
                open.messages = messages.data;
            }
            Err(error) => {
                warn!(session = %loaded.key.1, %error, "failed to load messages");
                open.error = Some(error);
            }
        }
        if let Some(target) = open.jump_to.take() {
            open.scroll = crate::ui::conversations::message_offset(
                &open.messages,
                target,
                self.show_thinking,
            );
        }
    }

    fn start_search(&mut self) {
        self.search = Some(SearchState {
            editing: true,
            ..SearchState::default()
        });
        self.pane = Pane::Sidebar;
    }

    fn close_search(&mut self) {
        self.search = None;
        self.scheduler.cancel();
    }

    fn on_search_edit(&mut self) -> Vec<Task> {
        let Some(search) = self.search.as_mut() else {
            return Vec::new();
        };
        let version = self.scheduler.schedule(&search.input.text);
        if search.input.is_empty() {
            search.outcome = None;
            search.running = false;
            return Vec::new();
        }
        vec![Task::for_plugin(PLUGIN_ID, "search debounce", move || {
            thread::sleep(SEARCH_DEBOUNCE);
            SearchDue { version }
        })]
    }

    fn on_search_due(&mut self, version: u64) -> Vec<Task> {
        let (Some(query), Some(ctx)) = (self.scheduler.due(version), self.ctx.as_ref()) else {
            return Vec::new();
        };
        let query = query.to_string();
        let sessions = self.sessions.clone();
        let adapters = ctx.adapters.clone();
        if let Some(search) = self.search.as_mut() {
            search.running = true;
        }
        vec![Task::for_plugin(PLUGIN_ID, "search sessions", move || {
            let outcome = search_all_sessions(&sessions, &adapters, &query, &SearchOptions::default());
            SearchDone { version, outcome }
        })]
    }

    fn on_search_done(&mut self, done: SearchDone) {
        if !self.scheduler.is_current(done.version) {
            debug!(version = done.version, "dropping stale search result");
            return;
        }
        let Some(search) = self.search.as_mut() else {
            return;
        };
        search.running = false;
        search.selected = 0;
        if done.outcome.timed_out {
            self.notices.push(Notice::warning("search timed out"));
        } else if done.outcome.truncated {
            self.notices.push(Notice::info(format!(
                "showing the first {} matches",
                done.outcome.total_matches
            )));
        }
        search.outcome = Some(done.outcome);
    }

    fn open_search_result(&mut self) -> Vec<Task> {
        let Some(result) = self
            .search
            .as_ref()
            .and_then(|search| search.outcome.as_ref().zip(Some(search.selected)))
            .and_then(|(outcome, selected)| outcome.results.get(selected))
        else {
            return Vec::new();
        };
        let session = result.session.clone();
        let jump = result.messages.first().map(|message| message.message_idx);
        if let Some(idx) = self
            .sessions
            .iter()
            .position(|candidate| candidate.key() == session.key())
        {
            self.selected = idx;
        }
        if let Some(search) = self.search.as_mut() {
            search.editing = false;
        }
        self.pane = Pane::Main;
        self.open_session(session, jump)
    }

    fn search_result_count(&self) -> usize {
        self.search
            .as_ref()
            .and_then(|search| search.outcome.as_ref())
            .map_or(0, |outcome| outcome.results.len())
    }

    fn on_search_key(&mut self, key: &KeyEvent) -> Vec<Task> {
        let Some(search) = self.search.as_mut() else {
            return Vec::new();
        };
        match key.code {
            KeyCode::Esc => {
                self.close_search();
                Vec::new()
            }
            KeyCode::Enter => self.open_search_result(),
            KeyCode::Up | KeyCode::Down => {
                let delta = if key.code == KeyCode::Up { -1 } else { 1 };
                let len = self.search_result_count();
                if let Some(search) = self.search.as_mut() {
                    search.selected = step(search.selected, delta, len);
                }
                Vec::new()
            }
            KeyCode::Tab => {
                let selected = search.selected;
                if let Some(result) = search
                    .outcome
                    .as_mut()
                    .and_then(|outcome| outcome.results.get_mut(selected))
                {
                    result.collapsed = !result.collapsed;
                }
                Vec::new()
            }
            _ => match search.input.handle_key(key) {
                EditOutcome::Changed => self.on_search_edit(),
                EditOutcome::Moved | EditOutcome::Ignored => Vec::new(),
            },
        }
    }

    fn page(&self) -> usize {
        usize::from(self.size.1.saturating_sub(4)).max(1)
    }

    fn on_command(&mut self, id: &str) -> Vec<Task> {
        let len = self.sessions.len();
        match (self.pane, id) {
            (Pane::Sidebar, "cursor-down") => self.move_selection(1, len),
            (Pane::Sidebar, "cursor-up") => self.move_selection(-1, len),
            (Pane::Sidebar, "cursor-top") => self.move_selection(isize::MIN / 2, len),
            (Pane::Sidebar, "cursor-bottom") => self.move_selection(isize::MAX / 2, len),
            (Pane::Sidebar, "open-session") => {
                self.pane = Pane::Main;
                return self.open_selected(None);
            }
            (Pane::Main, "scroll-down") => self.scroll_by(1),
            (Pane::Main, "scroll-up") => self.scroll_by(-1),
            (Pane::Main, "page-down") => self.scroll_by(self.page() as isize),
            (Pane::Main, "page-up") => self.scroll_by(-(self.page() as isize)),
            (Pane::Main, "back") => self.pane = Pane::Sidebar,
            (_, "switch-pane") => {
                self.pane = match self.pane {
                    Pane::Sidebar if self.open.is_some() => Pane::Main,
                    _ => Pane::Sidebar,
                };
            }
            (_, "search") => self.start_search(),
            (_, "toggle-thinking") => self.show_thinking = !self.show_thinking,
            (_, "reload") => return self.load_sessions(),
            (pane, other) => debug!(?pane, command = other, "unhandled conversations command"),
        }
        Vec::new()
    }

    fn move_selection(&mut self, delta: isize, len: usize) {
        self.selected = step(self.selected, delta, len);
    }

    fn scroll_by(&mut self, delta: isize) {
        if let Some(open) = self.open.as_mut() {
            open.scroll = open.scroll.saturating_add_signed(delta);
        }
    }

    fn on_data(&mut self, data: Box<dyn Any + Send>) -> Result<Vec<Task>, PluginError> {
        let data = match data.downcast::<SessionsLoaded>() {
            Ok(loaded) => {
                self.on_sessions(*loaded);
                return Ok(Vec::new());
            }
            Err(other) => other,
        };
        let data = match data.downcast::<MessagesLoaded>() {
            Ok(loaded) => {
                self.on_messages(*loaded);
                return Ok(Vec::new());
            }
            Err(other) => other,
        };
        let data = match data.downcast::<SearchDue>() {
            Ok(due) => return Ok(self.on_search_due(due.version)),
            Err(other) => other,
        };
        match data.downcast::<SearchDone>() {
            Ok(done) => {
                self.on_search_done(*done);
                Ok(Vec::new())
            }
            Err(_) => Err(PluginError::InvalidState {
                plugin: PLUGIN_ID,
                message: "unexpected task result".to_string(),
            }),
        }
    }

    /// Reloads once per burst of adapter writes.
    fn drain_watch(&mut self) -> Vec<Task> {
        let changed = self
            .watch
            .as_ref()
            .map_or(0, |subscription| subscription.drain().len());
        if changed == 0 || self.loading {
            return Vec::new();
        }
        debug!(changed, "adapter stores changed; reloading sessions");
        self.load_sessions()
    }
}

fn collect_sessions(generation: u64, adapters: &AdapterMap, workdir: &Path) -> SessionsLoaded {
    let mut sessions = Vec::new();
    let mut partial = Vec::new();
    let mut failed = Vec::new();
    for (id, adapter) in adapters.iter() {
        match adapter.sessions(workdir) {
            Ok(loaded) => {
                if let Some(result) = &loaded.partial {
                    warn!(adapter = %id, reason = %result.reason, "partial session listing");
                    partial.push((id.clone(), result.parsed_count));
                }
                sessions.extend(loaded.data);
            }
            Err(error) => {
                warn!(adapter = %id, %error, "failed to list sessions");
                failed.push(adapter.name().to_string());
            }
        }
    }
    sort_sessions(&mut sessions);
    SessionsLoaded {
        generation,
        sessions,
        partial,
        failed,
    }
}

impl Plugin for ConversationsPlugin {
    fn id(&self) -> &'static str {
        PLUGIN_ID
    }

    fn name(&self) -> &'static str {
        "Conversations"
    }

    fn icon(&self) -> &'static str {
        "◆"
    }

    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.watch = Some(ctx.bus.subscribe_with(
            Topic::AdapterWatch,
            SubscribeOptions::default()
                .buffer(16)
                .overflow(Overflow::DropOldest),
        ));
        self.ctx = Some(ctx.clone());
        self.sessions.clear();
        self.selected = 0;
        self.open = None;
        self.pane = Pane::Sidebar;
        self.close_search();
        Ok(())
    }

    fn start(&mut self) -> Vec<Task> {
        self.load_sessions()
    }

    fn stop(&mut self) {
        self.watch = None;
        self.scheduler.cancel();
        self.generation += 1;
        self.loading = false;
    }

    fn set_focused(&mut self, focused: bool) {
        self.focused = focused;
    }

    fn focus_context(&self) -> FocusContext {
        if self.search.as_ref().is_some_and(|search| search.editing) {
            return FocusContext::ConversationsSearch;
        }
        match self.pane {
            Pane::Sidebar => FocusContext::ConversationsSidebar,
            Pane::Main => FocusContext::ConversationsMain,
        }
    }

    fn update(&mut self, msg: PluginMsg) -> Result<Vec<Task>, PluginError> {
        let tasks = match msg {
            PluginMsg::Key(key) if self.consumes_text_input() => self.on_search_key(&key),
            PluginMsg::Key(key) => match key.code {
                KeyCode::Esc if self.search.is_some() => {
                    self.close_search();
                    Vec::new()
                }
                _ => Vec::new(),
            },
            PluginMsg::Paste(text) => {
                match self.search.as_mut().filter(|search| search.editing) {
                    Some(search) => {
                        search.input.insert_str(&text);
                        self.on_search_edit()
                    }
                    None => Vec::new(),
                }
            }
            PluginMsg::Mouse(_) => Vec::new(),
            PluginMsg::Resize { width, height } => {
                self.size = (width, height);
                Vec::new()
            }
            PluginMsg::Command(id) => self.on_command(&id),
            PluginMsg::ConfigReloaded(config) => {
                if let Some(ctx) = self.ctx.as_mut() {
                    ctx.config = config;
                }
                Vec::new()
            }
            PluginMsg::Refresh => self.load_sessions(),
            PluginMsg::Tick(_) => self.drain_watch(),
            PluginMsg::Data(data) => self.on_data(data)?,
        };
        Ok(tasks)
    }

    fn view(&self, frame: &mut Frame, area: Rect, styles: &Styles) {
        crate::ui::conversations::render(frame, area, self, styles);
    }

    fn commands(&self) -> Vec<Command> {
        let sidebar = FocusContext::ConversationsSidebar;
        let main = FocusContext::ConversationsMain;
        vec![
            Command::new("open-session", "Open session", sidebar.clone(), 9)
                .describe("Show the selected session's messages"),
            Command::new("search", "Search", sidebar.clone(), 8)
                .describe("Search message content across sessions"),
            Command::new("reload", "Reload sessions", sidebar.clone(), 5),
            Command::new("cursor-down", "Next session", sidebar.clone(), 1),
            Command::new("cursor-up", "Previous session", sidebar.clone(), 1),
            Command::new("cursor-top", "First session", sidebar.clone(), 1),
            Command::new("cursor-bottom", "Last session", sidebar.clone(), 1),
            Command::new("switch-pane", "Switch pane", sidebar, 3),
            Command::new("back", "Back to sessions", main.clone(), 7),
            Command::new("toggle-thinking", "Toggle thinking", main.clone(), 6)
                .describe("Show or hide thinking blocks"),
            Command::new("search", "Search", main.clone(), 8),
            Command::new("page-down", "Page down", main.clone(), 2),
            Command::new("page-up", "Page up", main.clone(), 2),
            Command::new("scroll-down", "Scroll down", main.clone(), 1),
            Command::new("scroll-up", "Scroll up", main.clone(), 1),
            Command::new("switch-pane", "Switch pane", main, 3),
        ]
    }

    fn default_bindings(&self) -> Vec<Binding> {
        let sidebar = FocusContext::ConversationsSidebar;
        let main = FocusContext::ConversationsMain;
        let table: [(&str, &str, &FocusContext); 22] = [
            ("j", "cursor-down", &sidebar),
            ("down", "cursor-down", &sidebar),
            ("k", "cursor-up", &sidebar),
            ("up", "cursor-up", &sidebar),
            ("g", "cursor-top", &sidebar),
            ("G", "cursor-bottom", &sidebar),
            ("enter", "open-session", &sidebar),
            ("l", "open-session", &sidebar),
            ("/", "search", &sidebar),
            ("R", "reload", &sidebar),
            ("tab", "switch-pane", &sidebar),
            ("j", "scroll-down", &main),
            ("down", "scroll-down", &main),
            ("k", "scroll-up", &main),
            ("up", "scroll-up", &main),
            ("pgdown", "page-down", &main),
            ("pgup", "page-up", &main),
            ("esc", "back", &main),
            ("h", "back", &main),
            ("t", "toggle-thinking", &main),
            ("/", "search", &main),
            ("tab", "switch-pane", &main),
        ];
        table
            .into_iter()
            .map(|(key, command, context)| Binding {
                key: key.to_string(),
                command: command.to_string(),
                context: context.clone(),
            })
            .collect()
    }

    fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn consumes_text_input(&self) -> bool {
        self.search.as_ref().is_some_and(|search| search.editing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Adapter, AdapterError, MessageMatch, MessageSearcher};
    use crate::app::AppMsg;
    use crate::app::plugin::tests::context;
    use crate::domain::{Event, EventData, PartialResult, Role};
    use crate::infra::FsWatcher;
    use crossterm::event::{KeyEventKind, KeyEventState, KeyModifiers};
    use std::sync::Arc;
    use std::time::Duration;
    use time::macros::datetime;

    struct Store;

    fn session(id: &str, minute: u8) -> Session {
        let at = datetime!(2026-03-01 12:00 UTC) + time::Duration::minutes(i64::from(minute));
        Session {
            id: id.to_string(),
            name: format!("chat {id}"),
            slug: id.to_string(),
            adapter_id: "store",
            adapter_name: "Store",
            adapter_icon: "s",
            created_at: at,
            updated_at: at,
            duration: Duration::ZERO,
            total_tokens: 0,
            est_cost: 0.0,
            message_count: 2,
            is_sub_agent: false,
            source_path: PathBuf::new(),
            source_size_bytes: 0,
        }
    }

    impl Adapter for Store {
        fn id(&self) -> &'static str {
            "store"
        }
        fn name(&self) -> &'static str {
            "Store"
        }
        fn icon(&self) -> &'static str {
            "s"
        }
        fn detect(&self, _project_root: &Path) -> Result<bool, AdapterError> {
            Ok(true)
        }
        fn sessions(&self, _project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
            Ok(Loaded::partial(
                vec![session("old", 1), session("new", 9)],
                PartialResult::new(2, "bad row"),
            ))
        }
        fn messages(&self, session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError> {
            let mut first = Message::new("m1", Role::User, datetime!(2026-03-01 12:00 UTC));
            first.content = format!("hello from {session_id}");
            let mut second = Message::new("m2", Role::Assistant, datetime!(2026-03-01 12:01 UTC));
            second.content = "hi".to_string();
            Ok(Loaded::complete(vec![first, second]))
        }
        fn watch(&self, project_root: &Path) -> Result<FsWatcher, AdapterError> {
            Err(AdapterError::UnknownSession(project_root.display().to_string()))
        }
        fn as_searcher(&self) -> Option<&dyn MessageSearcher> {
            Some(self)
        }
    }

    impl MessageSearcher for Store {
        fn search_messages(
            &self,
            session_id: &str,
            query: &str,
            options: &SearchOptions,
        ) -> Result<Vec<MessageMatch>, AdapterError> {
            let loaded = self.messages(session_id)?;
            crate::adapters::search_messages_in(&loaded.data, query, options)
        }
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    fn plugin() -> (ConversationsPlugin, PluginContext) {
        let mut ctx = context("/work");
        let mut adapters = AdapterMap::new();
        adapters.insert("store".to_string(), Arc::new(Store) as Arc<dyn Adapter>);
        ctx.adapters = Arc::new(adapters);
        let mut plugin = ConversationsPlugin::new();
        plugin.init(&ctx).expect("init");
        (plugin, ctx)
    }

    /// Runs tasks inline and feeds their results back, like the main loop does.
    fn settle(plugin: &mut ConversationsPlugin, tasks: Vec<Task>) {
        let mut queue = tasks;
        while let Some(task) = queue.pop() {
            match task.run() {
                AppMsg::Plugin { msg, .. } => queue.extend(plugin.update(msg).expect("update")),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[test]
    fn start_lists_newest_first_and_reports_recovery() {
        let (mut plugin, _ctx) = plugin();
        let tasks = plugin.start();
        settle(&mut plugin, tasks);

        let ids: Vec<&str> = plugin.sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(plugin.take_notices(), vec![Notice::warning("2 items recovered")]);
    }

    #[test]
    fn opening_a_session_loads_messages_in_the_main_pane() {
        let (mut plugin, _ctx) = plugin();
        let tasks = plugin.start();
        settle(&mut plugin, tasks);

        let tasks = plugin
            .update(PluginMsg::Command("open-session".to_string()))
            .expect("open");
        settle(&mut plugin, tasks);
        assert_eq!(plugin.focus_context(), FocusContext::ConversationsMain);
        let open = plugin.open.as_ref().expect("open session");
        assert_eq!(open.messages.len(), 2);
        assert_eq!(open.messages[0].content, "hello from new");
    }

    #[test]
    fn search_mode_captures_text_and_finds_matches() {
        let (mut plugin, _ctx) = plugin();
        let tasks = plugin.start();
        settle(&mut plugin, tasks);

        plugin
            .update(PluginMsg::Command("search".to_string()))
            .expect("search");
        assert!(plugin.consumes_text_input());
        assert_eq!(plugin.focus_context(), FocusContext::ConversationsSearch);

        let mut tasks = Vec::new();
        for ch in "old".chars() {
            tasks = plugin.update(PluginMsg::Key(key(KeyCode::Char(ch)))).expect("type");
        }
        settle(&mut plugin, tasks);

        let search = plugin.search.as_ref().expect("search state");
        let outcome = search.outcome.as_ref().expect("outcome");
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].session.id, "old");

        plugin.update(PluginMsg::Key(key(KeyCode::Esc))).expect("esc");
        assert!(plugin.search.is_none());
        assert!(!plugin.consumes_text_input());
    }

    #[test]
    fn stale_search_results_are_ignored() {
        let (mut plugin, _ctx) = plugin();
        plugin
            .update(PluginMsg::Command("search".to_string()))
            .expect("search");
        let stale = plugin.update(PluginMsg::Key(key(KeyCode::Char('a')))).expect("type");
        plugin.update(PluginMsg::Key(key(KeyCode::Char('b')))).expect("type");

        settle(&mut plugin, stale);
        let search = plugin.search.as_ref().expect("search state");
        assert!(search.outcome.is_none());
    }

    #[test]
    fn adapter_watch_events_trigger_a_reload_on_tick() {
        let (mut plugin, ctx) = plugin();
        let tasks = plugin.start();
        settle(&mut plugin, tasks);

        let now = datetime!(2026-03-01 12:30 UTC);
        assert!(plugin.update(PluginMsg::Tick(now)).expect("tick").is_empty());

        ctx.bus.publish(
            Topic::AdapterWatch,
            Event::new(
                Topic::AdapterWatch,
                "changed",
                EventData::AdapterChanged {
                    adapter_id: "store".to_string(),
                    session_id: None,
                },
            ),
        );
        let tasks = plugin.update(PluginMsg::Tick(now)).expect("tick");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].label(), "load sessions");
    }

    #[test]
    fn unknown_task_result_is_an_invalid_state() {
        let (mut plugin, _ctx) = plugin();
        let result = plugin.update(PluginMsg::Data(Box::new(42_u8)));
        assert!(matches!(result, Err(PluginError::InvalidState { .. })));
    }
}
