mod conversations;
mod keymap;
mod line_editor;
mod modal;
mod mouse;
mod plugin;
mod search;

use crate::adapters::AdapterRegistry;
use crate::domain::{Event, EventData, FocusContext, Issue, Topic, Worktree};
use crate::infra::{
    Clock, Config, Dispatcher, StateStore, ThemeConfig, list_worktrees, main_worktree_path,
    save_theme, show_issue, worktree_exists,
};
use crate::ui::theme::{DEFAULT_THEME, Styles, is_community, theme_names};
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseEvent};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub use conversations::{ConversationsPlugin, OpenSession, PLUGIN_ID as CONVERSATIONS_ID, Pane};
pub use keymap::{Binding, Command, Keymap, KeymapError, key_string};
pub use line_editor::{EditOutcome, LineEditor};
pub use modal::{
    FilteredList, IssueInputModal, IssuePreviewModal, Modal, ModalKind, ModalStack,
    PaletteModal, ProjectSwitcherModal, ThemeScope, ThemeSwitcherModal, UpdateModal,
    WorktreeSwitcherModal,
};
pub use plugin::{
    AdapterMap, Notice, NoticeLevel, Plugin, PluginContext, PluginError, PluginInfo, PluginMsg,
    PluginRegistry, PluginStatus, Task,
};
pub use search::{SearchOutcome, SessionSearchResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HEADER_HEIGHT: u16 = 1;
pub const FOOTER_HEIGHT: u16 = 1;
pub const INTRO_FRAMES: u16 = 24;
pub const INTRO_TICK: std::time::Duration = std::time::Duration::from_millis(16);
pub const CLOCK_TICK: std::time::Duration = std::time::Duration::from_secs(1);
pub const WORKTREE_TICK: std::time::Duration = std::time::Duration::from_secs(10);
const TOAST_TTL: time::Duration = time::Duration::seconds(4);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("terminal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::infra::ConfigError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SwitchKind {
    Startup,
    Project,
    Worktree,
}

/// Where a project or worktree switch landed, resolved off the dispatch thread.
pub struct ProjectTarget {
    pub workdir: PathBuf,
    pub project_root: PathBuf,
    pub adapters: Arc<AdapterMap>,
    pub kind: SwitchKind,
    /// Set when a project switch was redirected to the remembered worktree.
    pub restored: bool,
}

impl fmt::Debug for ProjectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectTarget")
            .field("workdir", &self.workdir)
            .field("project_root", &self.project_root)
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .field("kind", &self.kind)
            .field("restored", &self.restored)
            .finish()
    }
}

#[derive(Debug)]
pub enum AppMsg {
    Key(KeyEvent),
    Paste(String),
    Mouse(MouseEvent),
    Resize { width: u16, height: u16 },
    Tick(OffsetDateTime),
    IntroFrame,
    WorktreeTick,
    WorktreeStatus { workdir: PathBuf, exists: bool },
    ConfigReloaded(Arc<Config>),
    ConfigInvalid(String),
    Plugin { id: &'static str, msg: PluginMsg },
    ProjectReady(Box<ProjectTarget>),
    WorktreesLoaded(Result<Vec<Worktree>, String>),
    IssueLoaded { id: String, result: Result<Issue, String> },
    ThemeSaved(Result<String, String>),
    EditorExited(Result<(), String>),
}

pub enum AppCommand {
    None,
    Quit,
    Run(Vec<Task>),
    OpenEditor(PathBuf),
    /// Replace the adapter watchers after a switch.
    Rewatch {
        workdir: PathBuf,
        adapters: Arc<AdapterMap>,
        tasks: Vec<Task>,
    },
}

impl fmt::Debug for AppCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Quit => f.write_str("Quit"),
            Self::Run(tasks) => f.debug_tuple("Run").field(tasks).finish(),
            Self::OpenEditor(path) => f.debug_tuple("OpenEditor").field(path).finish(),
            Self::Rewatch { workdir, tasks, .. } => f
                .debug_struct("Rewatch")
                .field("workdir", workdir)
                .field("tasks", tasks)
                .finish_non_exhaustive(),
        }
    }
}

impl AppCommand {
    fn run(tasks: Vec<Task>) -> Self {
        if tasks.is_empty() {
            Self::None
        } else {
            Self::Run(tasks)
        }
    }
}

#[derive(Clone, Debug)]
pub struct Toast {
    pub level: NoticeLevel,
    pub text: String,
    pub expires_at: OffsetDateTime,
}

const SHELL_COMMANDS: &[(&str, &str, &str)] = &[
    ("quit", "Quit", "q"),
    ("palette", "Command palette", "?"),
    ("help", "Help", "f1"),
    ("diagnostics", "Diagnostics", "!"),
    ("project-switcher", "Switch project", "@"),
    ("worktree-switcher", "Switch worktree", "W"),
    ("theme-switcher", "Switch theme", "#"),
    ("issue-input", "Open issue", "i"),
    ("refresh", "Refresh", "r"),
    ("next-plugin", "Next plugin", "`"),
    ("prev-plugin", "Previous plugin", "~"),
    ("edit-config", "Edit config", "ctrl+e"),
];

fn is_shell_command(id: &str) -> bool {
    SHELL_COMMANDS.iter().any(|(candidate, _, _)| *candidate == id)
}

/// Services the shell is built from; `main` wires the real ones, tests wire temp dirs.
pub struct AppServices {
    pub config_path: PathBuf,
    pub config: Arc<Config>,
    pub state: Arc<StateStore>,
    pub bus: Arc<Dispatcher>,
    pub registry: Arc<AdapterRegistry>,
    pub clock: Arc<dyn Clock>,
}

pub struct AppModel {
    pub config_path: PathBuf,
    pub config: Arc<Config>,
    /// Last reload failure; the previous config stays active.
    pub config_error: Option<String>,
    pub keymap_errors: Vec<String>,
    pub styles: Arc<Styles>,
    pub keymap: Keymap,
    pub plugins: PluginRegistry,
    pub modals: ModalStack,
    pub bus: Arc<Dispatcher>,
    pub registry: Arc<AdapterRegistry>,
    pub adapters: Arc<AdapterMap>,
    pub state: Arc<StateStore>,
    pub clock: Arc<dyn Clock>,
    pub workdir: PathBuf,
    pub project_root: PathBuf,
    pub size: (u16, u16),
    pub now: OffsetDateTime,
    pub toast: Option<Toast>,
    pub intro_frame: u16,
    pub editor_busy: bool,
    started: bool,
    switching: bool,
}

impl AppModel {
    pub fn new(services: AppServices, plugins: Vec<Box<dyn Plugin>>, workdir: PathBuf) -> Self {
        let mut registry = PluginRegistry::new();
        for plugin in plugins {
            registry.register(plugin);
        }
        let now = services.clock.now();
        let styles = Styles::for_theme(services.config.theme_for(Some(&workdir)));
        let mut model = Self {
            config_path: services.config_path,
            config: services.config,
            config_error: None,
            keymap_errors: Vec::new(),
            styles,
            keymap: Keymap::new(),
            plugins: registry,
            modals: ModalStack::new(),
            bus: services.bus,
            registry: services.registry,
            adapters: Arc::new(AdapterMap::new()),
            state: services.state,
            clock: services.clock,
            project_root: workdir.clone(),
            workdir,
            size: (0, 0),
            now,
            toast: None,
            intro_frame: 0,
            editor_busy: false,
            started: false,
            switching: false,
        };
        model.build_keymap();
        model.check_version();
        model
    }

    /// The first project load. Runs through the same path as a switch.
    pub fn boot(&mut self) -> AppCommand {
        self.switching = true;
        AppCommand::run(vec![self.switch_task(self.workdir.clone(), SwitchKind::Startup)])
    }

    pub fn intro_running(&self) -> bool {
        self.intro_frame < INTRO_FRAMES
    }

    /// The scope keys are resolved in: the top modal, else the focused plugin.
    pub fn focus_context(&self) -> FocusContext {
        match self.modals.top_kind() {
            Some(kind) => kind.focus_context(),
            None => self.plugins.focused_context(),
        }
    }

    pub fn plugin_area(&self) -> (u16, u16) {
        (
            self.size.0,
            self.size.1.saturating_sub(HEADER_HEIGHT + FOOTER_HEIGHT),
        )
    }

    pub fn palette_entries(&self) -> Vec<&Command> {
        let Some(Modal::Palette(palette)) = self.modals.get(ModalKind::Palette) else {
            return Vec::new();
        };
        let needle = palette.list.filter.text.to_lowercase();
        self.keymap
            .commands(&palette.context)
            .into_iter()
            .filter(|command| {
                needle.is_empty()
                    || command.name.to_lowercase().contains(&needle)
                    || command.id.contains(&needle)
            })
            .collect()
    }

    pub fn project_entries(&self) -> Vec<&crate::infra::ProjectConfig> {
        let Some(Modal::ProjectSwitcher(switcher)) = self.modals.get(ModalKind::ProjectSwitcher)
        else {
            return Vec::new();
        };
        switcher
            .list
            .visible(&self.config.projects.list, |project| &project.name)
            .into_iter()
            .map(|(_, project)| project)
            .collect()
    }

    fn build_keymap(&mut self) {
        let mut keymap = Keymap::new();
        for (id, name, key) in SHELL_COMMANDS {
            keymap.register_command(Command::new(*id, *name, FocusContext::Global, 10));
            keymap.bind(key, id, FocusContext::Global);
        }
        let (commands, bindings) = self.plugins.keymap_entries();
        for command in commands {
            keymap.register_command(command);
        }
        for binding in bindings {
            keymap.bind(&binding.key, &binding.command, binding.context);
        }
        self.keymap_errors = keymap
            .apply_config(&self.config.keymap)
            .into_iter()
            .map(|error| error.to_string())
            .collect();
        self.keymap = keymap;
    }

    fn check_version(&mut self) {
        match self.state.last_seen_version() {
            Some(previous) if previous == VERSION => {}
            Some(previous) => self.modals.open(Modal::Update(UpdateModal {
                version: VERSION.to_string(),
                previous: Some(previous),
            })),
            None => self.remember_version(),
        }
    }

    fn remember_version(&self) {
        if let Err(error) = self.state.set_last_seen_version(VERSION) {
            warn!(%error, "failed to record version");
        }
    }

    fn show_toast(&mut self, level: NoticeLevel, text: impl Into<String>) {
        self.toast = Some(Toast {
            level,
            text: text.into(),
            expires_at: self.now + TOAST_TTL,
        });
    }

    fn drain_notices(&mut self) {
        for notice in self.plugins.take_notices() {
            self.show_toast(notice.level, notice.text);
        }
    }

    fn after_plugin(&mut self, tasks: Vec<Task>) -> AppCommand {
        self.drain_notices();
        AppCommand::run(tasks)
    }

    fn plugin_context(&self) -> PluginContext {
        PluginContext {
            workdir: self.workdir.clone(),
            project_root: self.project_root.clone(),
            config: self.config.clone(),
            bus: self.bus.clone(),
            adapters: self.adapters.clone(),
            clock: self.clock.clone(),
        }
    }

    fn resize_plugins(&mut self) -> Vec<Task> {
        let (width, height) = self.plugin_area();
        if width == 0 && height == 0 {
            return Vec::new();
        }
        self.plugins
            .broadcast(|| PluginMsg::Resize { width, height })
    }

    fn apply_theme(&mut self) {
        self.styles = Styles::for_theme(self.config.theme_for(Some(&self.project_root)));
    }

    fn remember_active_plugin(&self) {
        let Some(id) = self.plugins.focused_id() else {
            return;
        };
        if let Err(error) = self.state.set_active_plugin(&self.workdir, id) {
            warn!(%error, "failed to save active plugin");
        }
    }

    fn begin_switch(&mut self, target: PathBuf, kind: SwitchKind) -> AppCommand {
        if self.switching {
            self.show_toast(NoticeLevel::Warning, "a switch is already in progress");
            return AppCommand::None;
        }
        self.remember_active_plugin();
        self.switching = true;
        AppCommand::run(vec![self.switch_task(target, kind)])
    }

    fn switch_task(&self, target: PathBuf, kind: SwitchKind) -> Task {
        let registry = self.registry.clone();
        let state = self.state.clone();
        let from = self.started.then(|| self.workdir.clone());
        Task::new("switch project", move || {
            let project_root = main_worktree_path(&target).unwrap_or_else(|error| {
                debug!(%error, path = %target.display(), "not a git worktree");
                target.clone()
            });
            let mut workdir = target;
            let mut restored = false;
            if kind == SwitchKind::Project {
                if let Some(saved) = state.last_worktree(&project_root) {
                    let usable = saved != workdir
                        && from.as_deref() != Some(saved.as_path())
                        && saved.is_dir()
                        && worktree_exists(&saved);
                    if usable {
                        workdir = saved;
                        restored = true;
                    }
                }
            }
            let adapters = registry.detect_adapters(&workdir);
            AppMsg::ProjectReady(Box::new(ProjectTarget {
                workdir,
                project_root,
                adapters: Arc::new(adapters),
                kind,
                restored,
            }))
        })
    }

    fn on_project_ready(&mut self, target: ProjectTarget) -> AppCommand {
        let previous = self.started.then(|| self.workdir.clone());
        self.switching = false;
        self.workdir = target.workdir;
        self.project_root = target.project_root;
        self.adapters = target.adapters;
        if let Err(error) = self.state.set_last_worktree(&self.project_root, &self.workdir) {
            warn!(%error, "failed to save last worktree");
        }
        if target.kind != SwitchKind::Worktree {
            self.apply_theme();
        }

        let ctx = self.plugin_context();
        let mut tasks = self.plugins.reinit(&ctx);
        self.started = true;
        tasks.extend(self.resize_plugins());
        if let Some(id) = self.state.active_plugin(&self.workdir) {
            self.plugins.focus_id(&id);
        }
        info!(
            workdir = %self.workdir.display(),
            adapters = self.adapters.len(),
            "project loaded"
        );
        if target.restored {
            self.show_toast(
                NoticeLevel::Info,
                format!("restored worktree {}", self.workdir.display()),
            );
        }
        self.bus.publish(
            Topic::ProjectSwitch,
            Event::new(
                Topic::ProjectSwitch,
                "switched",
                EventData::ProjectSwitched {
                    from: previous,
                    to: self.workdir.clone(),
                },
            ),
        );
        self.drain_notices();
        AppCommand::Rewatch {
            workdir: self.workdir.clone(),
            adapters: self.adapters.clone(),
            tasks,
        }
    }

    fn quit(&mut self) -> AppCommand {
        self.remember_active_plugin();
        self.plugins.stop_all();
        AppCommand::Quit
    }

    fn run_command(&mut self, id: &str, key: Option<KeyEvent>) -> AppCommand {
        if !is_shell_command(id) {
            let tasks = self.plugins.send_focused(PluginMsg::Command(id.to_string()));
            return self.after_plugin(tasks);
        }
        if id == "quit" && !self.plugins.focused_context().is_root() {
            return match key {
                Some(key) => self.forward_key(key),
                None => AppCommand::None,
            };
        }
        self.run_shell_command(id)
    }

    fn run_shell_command(&mut self, id: &str) -> AppCommand {
        match id {
            "quit" => self.modals.open(Modal::QuitConfirm),
            "palette" => self.modals.toggle(Modal::Palette(PaletteModal {
                list: FilteredList::default(),
                context: self.plugins.focused_context(),
            })),
            "help" => self.modals.toggle(Modal::Help { scroll: 0 }),
            "diagnostics" => self.modals.toggle(Modal::Diagnostics { scroll: 0 }),
            "project-switcher" => self
                .modals
                .open(Modal::ProjectSwitcher(ProjectSwitcherModal::default())),
            "worktree-switcher" => return self.open_worktree_switcher(),
            "theme-switcher" => self.open_theme_switcher(),
            "issue-input" => self
                .modals
                .open(Modal::IssueInput(IssueInputModal::default())),
            "refresh" => {
                let tasks = self.plugins.broadcast(|| PluginMsg::Refresh);
                return self.after_plugin(tasks);
            }
            "next-plugin" => self.plugins.cycle(1),
            "prev-plugin" => self.plugins.cycle(-1),
            "edit-config" => return self.open_editor(),
            other => debug!(command = other, "unknown shell command"),
        }
        AppCommand::None
    }

    fn open_editor(&mut self) -> AppCommand {
        if self.editor_busy {
            self.show_toast(NoticeLevel::Warning, "an editor is already open");
            return AppCommand::None;
        }
        self.editor_busy = true;
        AppCommand::OpenEditor(self.config_path.clone())
    }

    fn open_worktree_switcher(&mut self) -> AppCommand {
        self.modals
            .open(Modal::WorktreeSwitcher(WorktreeSwitcherModal {
                loading: true,
                ..WorktreeSwitcherModal::default()
            }));
        let root = self.project_root.clone();
        AppCommand::run(vec![Task::new("list worktrees", move || {
            AppMsg::WorktreesLoaded(list_worktrees(&root).map_err(|error| error.to_string()))
        })])
    }

    fn open_theme_switcher(&mut self) {
        let project = self.config.project_for(&self.project_root);
        let scope = match project.and_then(|project| project.theme.as_ref()) {
            Some(_) => ThemeScope::Project,
            None => ThemeScope::Global,
        };
        let original = self.config.theme_for(Some(&self.project_root)).clone();
        let names = theme_names();
        let selected = names
            .iter()
            .position(|name| name == original.display_name())
            .unwrap_or(0);
        self.modals
            .open(Modal::ThemeSwitcher(ThemeSwitcherModal {
                names,
                selected,
                original,
                scope,
                project_root: project.map(|_| self.project_root.clone()),
                error: None,
            }));
    }

    fn forward_key(&mut self, key: KeyEvent) -> AppCommand {
        let tasks = self.plugins.send_focused(PluginMsg::Key(key));
        self.after_plugin(tasks)
    }
}

/// A theme selection as written to config. Community palettes ride on the default base.
pub fn theme_from_name(name: &str, base: &ThemeConfig) -> ThemeConfig {
    let mut theme = ThemeConfig {
        overrides: base.overrides.clone(),
        ..ThemeConfig::default()
    };
    if is_community(name) {
        theme.name = DEFAULT_THEME.to_string();
        theme.community = Some(name.to_string());
    } else {
        theme.name = name.to_string();
    }
    theme
}

pub fn update(model: AppModel, msg: AppMsg) -> (AppModel, AppCommand) {
    match msg {
        AppMsg::Key(key) => update_on_key(model, key),
        AppMsg::Paste(text) => update_on_paste(model, text),
        AppMsg::Mouse(mouse) => mouse::update_on_mouse(model, mouse),
        other => update_on_msg(model, other),
    }
}

fn update_on_msg(model: AppModel, msg: AppMsg) -> (AppModel, AppCommand) {
    let mut model = model;
    let command = match msg {
        AppMsg::Resize { width, height } => {
            model.size = (width, height);
            let tasks = model.resize_plugins();
            model.after_plugin(tasks)
        }
        AppMsg::Tick(now) => {
            model.now = now;
            if model.toast.as_ref().is_some_and(|toast| toast.expires_at <= now) {
                model.toast = None;
            }
            let tasks = model.plugins.broadcast(|| PluginMsg::Tick(now));
            model.after_plugin(tasks)
        }
        AppMsg::IntroFrame => {
            model.intro_frame = model.intro_frame.saturating_add(1).min(INTRO_FRAMES);
            AppCommand::None
        }
        AppMsg::WorktreeTick => check_worktree(&mut model),
        AppMsg::WorktreeStatus { workdir, exists } => {
            if exists || workdir != model.workdir || model.switching {
                AppCommand::None
            } else {
                model.show_toast(
                    NoticeLevel::Warning,
                    format!("worktree {} is gone; switched to main", workdir.display()),
                );
                let main = model.project_root.clone();
                model.begin_switch(main, SwitchKind::Worktree)
            }
        }
        AppMsg::ConfigReloaded(config) => apply_config(&mut model, config),
        AppMsg::ConfigInvalid(reason) => {
            warn!(%reason, "config reload rejected");
            model.show_toast(
                NoticeLevel::Warning,
                format!("config not reloaded: {reason}"),
            );
            model.config_error = Some(reason);
            AppCommand::None
        }
        AppMsg::Plugin { id, msg } => {
            let tasks = model.plugins.send_to(id, msg);
            model.after_plugin(tasks)
        }
        AppMsg::ProjectReady(target) => model.on_project_ready(*target),
        AppMsg::WorktreesLoaded(result) => {
            let current = model.workdir.clone();
            if let Some(Modal::WorktreeSwitcher(switcher)) =
                model.modals.get_mut(ModalKind::WorktreeSwitcher)
            {
                switcher.loading = false;
                match result {
                    Ok(worktrees) => {
                        switcher.selected = worktrees
                            .iter()
                            .position(|worktree| worktree.path == current)
                            .unwrap_or(0);
                        switcher.worktrees = worktrees;
                        switcher.error = None;
                    }
                    Err(error) => switcher.error = Some(error),
                }
            }
            AppCommand::None
        }
        AppMsg::IssueLoaded { id, result } => {
            let pending = matches!(
                model.modals.get(ModalKind::IssueInput),
                Some(Modal::IssueInput(input)) if input.pending
            );
            if !pending {
                debug!(issue = %id, "issue lookup finished after the prompt closed");
                return (model, AppCommand::None);
            }
            match result {
                Ok(issue) => {
                    model.modals.close(ModalKind::IssueInput);
                    model
                        .modals
                        .open(Modal::IssuePreview(IssuePreviewModal { issue, scroll: 0 }));
                }
                Err(error) => {
                    if let Some(Modal::IssueInput(input)) =
                        model.modals.get_mut(ModalKind::IssueInput)
                    {
                        input.pending = false;
                        input.error = Some(error);
                    }
                }
            }
            AppCommand::None
        }
        AppMsg::ThemeSaved(result) => {
            match result {
                Ok(name) => model.show_toast(NoticeLevel::Info, format!("theme {name} saved")),
                Err(error) => {
                    model.show_toast(NoticeLevel::Error, format!("theme not saved: {error}"))
                }
            }
            AppCommand::None
        }
        AppMsg::EditorExited(result) => {
            model.editor_busy = false;
            if let Err(error) = result {
                model.show_toast(NoticeLevel::Error, format!("editor failed: {error}"));
            }
            AppCommand::None
        }
        AppMsg::Key(_) | AppMsg::Paste(_) | AppMsg::Mouse(_) => AppCommand::None,
    };
    (model, command)
}

fn check_worktree(model: &mut AppModel) -> AppCommand {
    if !model.started || model.switching || model.workdir == model.project_root {
        return AppCommand::None;
    }
    let workdir = model.workdir.clone();
    AppCommand::run(vec![Task::new("check worktree", move || {
        let exists = workdir.is_dir() && worktree_exists(&workdir);
        AppMsg::WorktreeStatus { workdir, exists }
    })])
}

fn apply_config(model: &mut AppModel, config: Arc<Config>) -> AppCommand {
    info!(path = %model.config_path.display(), "config reloaded");
    model.config = config.clone();
    model.config_error = None;
    model.build_keymap();
    if !model.modals.is_open(ModalKind::ThemeSwitcher) {
        model.styles = Styles::for_theme(model.config.theme_for(Some(&model.project_root)));
    }
    model.bus.publish(
        Topic::ConfigChange,
        Event::new(
            Topic::ConfigChange,
            "reloaded",
            EventData::ConfigReloaded {
                path: model.config_path.clone(),
            },
        ),
    );
    let tasks = model
        .plugins
        .broadcast(|| PluginMsg::ConfigReloaded(config.clone()));
    model.after_plugin(tasks)
}

fn update_on_key(model: AppModel, key: KeyEvent) -> (AppModel, AppCommand) {
    let mut model = model;
    if key.kind == KeyEventKind::Release {
        return (model, AppCommand::None);
    }
    let ctrl_c = key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c');

    if let Some(kind) = model.modals.top_kind() {
        let command = if ctrl_c && kind == ModalKind::QuitConfirm {
            model.quit()
        } else if ctrl_c {
            // The confirm must end up on top, so anything that outranks it goes.
            while model
                .modals
                .top_kind()
                .is_some_and(|top| top < ModalKind::QuitConfirm)
            {
                model.modals.close_top();
            }
            model.modals.open(Modal::QuitConfirm);
            AppCommand::None
        } else {
            update_modal_key(&mut model, kind, key)
        };
        return (model, command);
    }
    if ctrl_c {
        model.modals.open(Modal::QuitConfirm);
        return (model, AppCommand::None);
    }

    let context = model.plugins.focused_context();
    if model.plugins.focused_consumes_text() || context.is_text_input() {
        let command = model.forward_key(key);
        return (model, command);
    }

    if let KeyCode::Char(digit @ '1'..='9') = key.code {
        if !key.modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) {
            let idx = digit as usize - '1' as usize;
            if !model.plugins.focus_nth(idx) {
                debug!(idx, "no plugin at that position");
            }
            return (model, AppCommand::None);
        }
    }

    let bound = key_string(&key)
        .and_then(|text| model.keymap.lookup(&text, &context).map(str::to_string));
    let command = match bound {
        Some(id) => model.run_command(&id, Some(key)),
        None => model.forward_key(key),
    };
    (model, command)
}

fn update_on_paste(model: AppModel, text: String) -> (AppModel, AppCommand) {
    let mut model = model;
    if !model.modals.is_empty() {
        match model.modals.top_mut() {
            Some(Modal::Palette(palette)) => palette.list.filter.insert_str(&text),
            Some(Modal::ProjectSwitcher(switcher)) => switcher.list.filter.insert_str(&text),
            Some(Modal::IssueInput(input)) => input.input.insert_str(&text),
            _ => {}
        }
        return (model, AppCommand::None);
    }
    let tasks = model.plugins.send_focused(PluginMsg::Paste(text));
    let command = model.after_plugin(tasks);
    (model, command)
}

fn scroll_key(scroll: &mut u16, key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('j') | KeyCode::Down => *scroll = scroll.saturating_add(1),
        KeyCode::Char('k') | KeyCode::Up => *scroll = scroll.saturating_sub(1),
        KeyCode::PageDown => *scroll = scroll.saturating_add(10),
        KeyCode::PageUp => *scroll = scroll.saturating_sub(10),
        KeyCode::Char('g') | KeyCode::Home => *scroll = 0,
        _ => return false,
    }
    true
}

fn is_close_key(key: &KeyEvent) -> bool {
    matches!(key.code, KeyCode::Esc | KeyCode::Char('q'))
}

fn update_modal_key(model: &mut AppModel, kind: ModalKind, key: KeyEvent) -> AppCommand {
    match kind {
        ModalKind::Palette => palette_key(model, key),
        ModalKind::ProjectSwitcher => project_switcher_key(model, key),
        ModalKind::WorktreeSwitcher => worktree_switcher_key(model, key),
        ModalKind::ThemeSwitcher => theme_switcher_key(model, key),
        ModalKind::IssueInput => issue_input_key(model, key),
        ModalKind::QuitConfirm => match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => model.quit(),
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc | KeyCode::Char('q') => {
                model.modals.close(kind);
                AppCommand::None
            }
            _ => AppCommand::None,
        },
        ModalKind::Update => {
            if is_close_key(&key) || matches!(key.code, KeyCode::Enter | KeyCode::Char(' ')) {
                model.modals.close(kind);
                model.remember_version();
            }
            AppCommand::None
        }
        ModalKind::Help | ModalKind::Diagnostics | ModalKind::IssuePreview => {
            let closes = is_close_key(&key)
                || (kind == ModalKind::Help && key.code == KeyCode::F(1))
                || (kind == ModalKind::Diagnostics && key.code == KeyCode::Char('!'))
                || (kind == ModalKind::IssuePreview && key.code == KeyCode::Enter);
            if closes {
                model.modals.close(kind);
                return AppCommand::None;
            }
            let scroll = match model.modals.get_mut(kind) {
                Some(Modal::Help { scroll }) | Some(Modal::Diagnostics { scroll }) => scroll,
                Some(Modal::IssuePreview(preview)) => &mut preview.scroll,
                _ => return AppCommand::None,
            };
            scroll_key(scroll, &key);
            AppCommand::None
        }
    }
}

fn palette_key(model: &mut AppModel, key: KeyEvent) -> AppCommand {
    let entries: Vec<String> = model
        .palette_entries()
        .into_iter()
        .map(|command| command.id.clone())
        .collect();
    let Some(Modal::Palette(palette)) = model.modals.get_mut(ModalKind::Palette) else {
        return AppCommand::None;
    };
    match key.code {
        KeyCode::Esc => {
            if !palette.list.filter.is_empty() {
                palette.list = FilteredList::default();
            } else {
                model.modals.close(ModalKind::Palette);
            }
        }
        KeyCode::Up => palette.list.move_by(-1, entries.len()),
        KeyCode::Down | KeyCode::Tab => palette.list.move_by(1, entries.len()),
        KeyCode::Enter => {
            let chosen = entries.get(palette.list.selected).cloned();
            model.modals.close(ModalKind::Palette);
            if let Some(id) = chosen {
                return model.run_command(&id, None);
            }
        }
        _ => {
            if palette.list.filter.handle_key(&key) == EditOutcome::Changed {
                palette.list.selected = 0;
            }
        }
    }
    AppCommand::None
}

fn project_switcher_key(model: &mut AppModel, key: KeyEvent) -> AppCommand {
    let entries: Vec<(String, PathBuf)> = model
        .project_entries()
        .into_iter()
        .map(|project| (project.name.clone(), project.resolved_path()))
        .collect();
    let Some(Modal::ProjectSwitcher(switcher)) = model.modals.get_mut(ModalKind::ProjectSwitcher)
    else {
        return AppCommand::None;
    };
    match key.code {
        KeyCode::Esc => {
            let cleared = model
                .modals
                .get_mut(ModalKind::ProjectSwitcher)
                .is_some_and(Modal::clear_filter);
            if !cleared {
                model.modals.close(ModalKind::ProjectSwitcher);
            }
        }
        KeyCode::Up => switcher.list.move_by(-1, entries.len()),
        KeyCode::Down | KeyCode::Tab => switcher.list.move_by(1, entries.len()),
        KeyCode::Enter => {
            let Some((name, path)) = entries.get(switcher.list.selected).cloned() else {
                return AppCommand::None;
            };
            if !path.is_dir() {
                switcher.error = Some(format!(
                    "{name}: {} does not exist",
                    crate::infra::paths::display_path(&path)
                ));
                return AppCommand::None;
            }
            model.modals.close(ModalKind::ProjectSwitcher);
            if path == model.workdir {
                return AppCommand::None;
            }
            return model.begin_switch(path, SwitchKind::Project);
        }
        _ => {
            if switcher.list.filter.handle_key(&key) == EditOutcome::Changed {
                switcher.list.selected = 0;
                switcher.error = None;
            }
        }
    }
    AppCommand::None
}

fn worktree_switcher_key(model: &mut AppModel, key: KeyEvent) -> AppCommand {
    let Some(Modal::WorktreeSwitcher(switcher)) =
        model.modals.get_mut(ModalKind::WorktreeSwitcher)
    else {
        return AppCommand::None;
    };
    let len = switcher.worktrees.len();
    match key.code {
        KeyCode::Esc | KeyCode::Char('q') => {
            model.modals.close(ModalKind::WorktreeSwitcher);
        }
        KeyCode::Up | KeyCode::Char('k') => switcher.selected = modal::step(switcher.selected, -1, len),
        KeyCode::Down | KeyCode::Char('j') => switcher.selected = modal::step(switcher.selected, 1, len),
        KeyCode::Enter => {
            let Some(path) = switcher
                .worktrees
                .get(switcher.selected)
                .map(|worktree| worktree.path.clone())
            else {
                return AppCommand::None;
            };
            if !path.is_dir() {
                switcher.error = Some(format!("{} no longer exists", path.display()));
                return AppCommand::None;
            }
            model.modals.close(ModalKind::WorktreeSwitcher);
            if path == model.workdir {
                return AppCommand::None;
            }
            return model.begin_switch(path, SwitchKind::Worktree);
        }
        _ => {}
    }
    AppCommand::None
}

fn theme_switcher_key(model: &mut AppModel, key: KeyEvent) -> AppCommand {
    let Some(Modal::ThemeSwitcher(switcher)) = model.modals.get_mut(ModalKind::ThemeSwitcher)
    else {
        return AppCommand::None;
    };
    let len = switcher.names.len();
    let previous = switcher.selected;
    match key.code {
        KeyCode::Esc | KeyCode::Char('q') => {
            let original = switcher.original.clone();
            model.modals.close(ModalKind::ThemeSwitcher);
            model.styles = Styles::for_theme(&original);
            return AppCommand::None;
        }
        KeyCode::Up | KeyCode::Char('k') => switcher.selected = modal::step(previous, -1, len),
        KeyCode::Down | KeyCode::Char('j') => switcher.selected = modal::step(previous, 1, len),
        KeyCode::Tab => {
            switcher.scope = match (switcher.scope, &switcher.project_root) {
                (ThemeScope::Global, Some(_)) => ThemeScope::Project,
                (ThemeScope::Global, None) => {
                    switcher.error = Some("no project entry for this directory".to_string());
                    ThemeScope::Global
                }
                (ThemeScope::Project, _) => ThemeScope::Global,
            };
        }
        KeyCode::Enter => {
            let Some(name) = switcher.names.get(switcher.selected).cloned() else {
                return AppCommand::None;
            };
            let theme = theme_from_name(&name, &switcher.original);
            let project_root = match switcher.scope {
                ThemeScope::Project => switcher.project_root.clone(),
                ThemeScope::Global => None,
            };
            model.modals.close(ModalKind::ThemeSwitcher);
            model.styles = Styles::for_theme(&theme);
            let path = model.config_path.clone();
            return AppCommand::Run(vec![Task::new("save theme", move || {
                AppMsg::ThemeSaved(
                    save_theme(&path, &theme, project_root.as_deref())
                        .map(|()| name)
                        .map_err(|error| error.to_string()),
                )
            })]);
        }
        _ => {}
    }
    if switcher.selected != previous {
        if let Some(name) = switcher.names.get(switcher.selected) {
            let preview = theme_from_name(name, &switcher.original);
            model.styles = Styles::for_theme(&preview);
        }
    }
    AppCommand::None
}

fn issue_input_key(model: &mut AppModel, key: KeyEvent) -> AppCommand {
    let workdir = model.workdir.clone();
    let Some(Modal::IssueInput(input)) = model.modals.get_mut(ModalKind::IssueInput) else {
        return AppCommand::None;
    };
    match key.code {
        KeyCode::Esc => {
            model.modals.close(ModalKind::IssueInput);
        }
        KeyCode::Enter => {
            if input.pending {
                return AppCommand::None;
            }
            let id = input.input.text.trim().to_string();
            if id.is_empty() {
                input.error = Some("enter an issue id".to_string());
                return AppCommand::None;
            }
            input.pending = true;
            input.error = None;
            return AppCommand::Run(vec![Task::new("show issue", move || {
                let result = show_issue(&workdir, &id).map_err(|error| error.to_string());
                AppMsg::IssueLoaded { id, result }
            })]);
        }
        _ => {
            if input.input.handle_key(&key) == EditOutcome::Changed {
                input.error = None;
            }
        }
    }
    AppCommand::None
}
