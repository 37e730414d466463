use super::AppMsg;
use super::keymap::{Binding, Command};
use crate::adapters::Adapter;
use crate::domain::FocusContext;
use crate::infra::{Clock, Config, Dispatcher};
use crate::ui::theme::Styles;
use crossterm::event::{KeyEvent, MouseEvent};
use ratatui::Frame;
use ratatui::layout::Rect;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

pub type AdapterMap = BTreeMap<String, Arc<dyn Adapter>>;

/// Work that must not run on the dispatch thread. Its result re-enters `update` as a message.
pub struct Task {
    label: &'static str,
    run: Box<dyn FnOnce() -> AppMsg + Send + 'static>,
}

impl Task {
    pub fn new(label: &'static str, run: impl FnOnce() -> AppMsg + Send + 'static) -> Self {
        Self {
            label,
            run: Box::new(run),
        }
    }

    /// Delivers the result back to the plugin `plugin_id` as [`PluginMsg::Data`].
    pub fn for_plugin<T: Any + Send>(
        plugin_id: &'static str,
        label: &'static str,
        run: impl FnOnce() -> T + Send + 'static,
    ) -> Self {
        Self::new(label, move || AppMsg::Plugin {
            id: plugin_id,
            msg: PluginMsg::Data(Box::new(run())),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn run(self) -> AppMsg {
        (self.run)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("label", &self.label).finish()
    }
}

pub enum PluginMsg {
    Key(KeyEvent),
    Paste(String),
    Mouse(MouseEvent),
    /// Plugin area, header and footer already subtracted.
    Resize { width: u16, height: u16 },
    /// A keymap command id resolved for this plugin's context.
    Command(String),
    ConfigReloaded(Arc<Config>),
    Refresh,
    Tick(OffsetDateTime),
    /// The result of a task started through [`Task::for_plugin`].
    Data(Box<dyn Any + Send>),
}

impl fmt::Debug for PluginMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Paste(text) => f.debug_tuple("Paste").field(text).finish(),
            Self::Mouse(mouse) => f.debug_tuple("Mouse").field(mouse).finish(),
            Self::Resize { width, height } => f
                .debug_struct("Resize")
                .field("width", width)
                .field("height", height)
                .finish(),
            Self::Command(id) => f.debug_tuple("Command").field(id).finish(),
            Self::ConfigReloaded(_) => f.write_str("ConfigReloaded"),
            Self::Refresh => f.write_str("Refresh"),
            Self::Tick(now) => f.debug_tuple("Tick").field(now).finish(),
            Self::Data(_) => f.write_str("Data(..)"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A status line a plugin wants shown as a toast.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {plugin} failed to initialize: {message}")]
    Init { plugin: &'static str, message: String },

    #[error("plugin {plugin} reached an invalid state: {message}")]
    InvalidState { plugin: &'static str, message: String },
}

/// Everything a plugin may reach. Rebuilt on every project or worktree switch.
#[derive(Clone)]
pub struct PluginContext {
    /// The active worktree.
    pub workdir: PathBuf,
    /// The repository's main worktree, or `workdir` outside git.
    pub project_root: PathBuf,
    pub config: Arc<Config>,
    pub bus: Arc<Dispatcher>,
    pub adapters: Arc<AdapterMap>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("workdir", &self.workdir)
            .field("project_root", &self.project_root)
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

pub trait Plugin {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn icon(&self) -> &'static str;

    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError>;
    fn start(&mut self) -> Vec<Task>;
    fn stop(&mut self);

    fn set_focused(&mut self, focused: bool);
    fn focus_context(&self) -> FocusContext;

    /// An `Err` disables the plugin; the shell keeps running.
    fn update(&mut self, msg: PluginMsg) -> Result<Vec<Task>, PluginError>;
    fn view(&self, frame: &mut Frame, area: Rect, styles: &Styles);

    fn commands(&self) -> Vec<Command>;

    /// Keys registered in the keymap when the plugin is added.
    fn default_bindings(&self) -> Vec<Binding> {
        Vec::new()
    }

    /// Drained by the shell after every update.
    fn take_notices(&mut self) -> Vec<Notice> {
        Vec::new()
    }

    /// While true, printable keys bypass the global shortcuts.
    fn consumes_text_input(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PluginStatus {
    Idle,
    Running,
    Failed(String),
}

impl PluginStatus {
    pub fn label(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Failed(reason) => reason,
        }
    }
}

struct Slot {
    plugin: Box<dyn Plugin>,
    status: PluginStatus,
}

#[derive(Clone, Debug)]
pub struct PluginInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
    pub status: PluginStatus,
    pub focused: bool,
}

/// Plugins in tab order. A failed plugin is stopped, skipped by focus and dispatch, and kept
/// only so diagnostics can show why.
#[derive(Default)]
pub struct PluginRegistry {
    slots: Vec<Slot>,
    focused: Option<usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        self.slots.push(Slot {
            plugin,
            status: PluginStatus::Idle,
        });
    }

    /// Inits and starts every plugin against `ctx`, then focuses the first healthy one.
    pub fn start_all(&mut self, ctx: &PluginContext) -> Vec<Task> {
        let mut tasks = Vec::new();
        for slot in &mut self.slots {
            match slot.plugin.init(ctx) {
                Ok(()) => {
                    tasks.extend(slot.plugin.start());
                    slot.status = PluginStatus::Running;
                }
                Err(error) => {
                    warn!(plugin = slot.plugin.id(), %error, "plugin init failed");
                    slot.status = PluginStatus::Failed(error.to_string());
                }
            }
        }
        let target = self
            .focused
            .filter(|idx| self.is_running(*idx))
            .or_else(|| self.first_running());
        self.focused = None;
        if let Some(idx) = target {
            self.focus_index(idx);
        }
        tasks
    }

    /// Stops everything, then starts again with a fresh context. A plugin that failed for the
    /// previous project gets another chance.
    pub fn reinit(&mut self, ctx: &PluginContext) -> Vec<Task> {
        self.stop_all();
        self.start_all(ctx)
    }

    pub fn stop_all(&mut self) {
        for slot in &mut self.slots {
            if slot.status == PluginStatus::Running {
                slot.plugin.stop();
                slot.status = PluginStatus::Idle;
            }
        }
    }

    fn is_running(&self, idx: usize) -> bool {
        self.slots
            .get(idx)
            .is_some_and(|slot| slot.status == PluginStatus::Running)
    }

    fn first_running(&self) -> Option<usize> {
        (0..self.slots.len()).find(|idx| self.is_running(*idx))
    }

    fn running_indices(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|idx| self.is_running(*idx))
            .collect()
    }

    fn focus_index(&mut self, idx: usize) {
        if self.focused == Some(idx) || !self.is_running(idx) {
            return;
        }
        if let Some(slot) = self.focused.and_then(|old| self.slots.get_mut(old)) {
            slot.plugin.set_focused(false);
        }
        self.focused = Some(idx);
        self.slots[idx].plugin.set_focused(true);
    }

    /// Focuses the `n`th visible plugin, counting from zero.
    pub fn focus_nth(&mut self, n: usize) -> bool {
        match self.running_indices().get(n) {
            Some(idx) => {
                self.focus_index(*idx);
                true
            }
            None => false,
        }
    }

    pub fn focus_id(&mut self, id: &str) -> bool {
        let Some(idx) = self
            .slots
            .iter()
            .position(|slot| slot.plugin.id() == id)
            .filter(|idx| self.is_running(*idx))
        else {
            return false;
        };
        self.focus_index(idx);
        true
    }

    /// Moves focus through the visible plugins, wrapping at both ends.
    pub fn cycle(&mut self, delta: isize) {
        let running = self.running_indices();
        if running.is_empty() {
            return;
        }
        let current = self
            .focused
            .and_then(|idx| running.iter().position(|candidate| *candidate == idx))
            .unwrap_or(0);
        let len = running.len() as isize;
        let next = (current as isize + delta).rem_euclid(len) as usize;
        self.focus_index(running[next]);
    }

    pub fn focused(&self) -> Option<&dyn Plugin> {
        self.focused
            .and_then(|idx| self.slots.get(idx))
            .map(|slot| slot.plugin.as_ref())
    }

    pub fn focused_id(&self) -> Option<&'static str> {
        self.focused().map(|plugin| plugin.id())
    }

    pub fn focused_context(&self) -> FocusContext {
        self.focused()
            .map_or(FocusContext::Global, |plugin| plugin.focus_context())
    }

    pub fn focused_consumes_text(&self) -> bool {
        self.focused()
            .is_some_and(|plugin| plugin.consumes_text_input())
    }

    pub fn visible(&self) -> Vec<PluginInfo> {
        self.info()
            .into_iter()
            .filter(|info| info.status == PluginStatus::Running)
            .collect()
    }

    pub fn info(&self) -> Vec<PluginInfo> {
        self.slots
            .iter()
            .enumerate()
            .map(|(idx, slot)| PluginInfo {
                id: slot.plugin.id(),
                name: slot.plugin.name(),
                icon: slot.plugin.icon(),
                status: slot.status.clone(),
                focused: self.focused == Some(idx),
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.slots
            .iter()
            .filter(|slot| slot.status == PluginStatus::Running)
            .flat_map(|slot| slot.plugin.commands())
            .collect()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.slots
            .iter_mut()
            .flat_map(|slot| slot.plugin.take_notices())
            .collect()
    }

    /// Commands and bindings of every registered plugin, healthy or not.
    pub fn keymap_entries(&self) -> (Vec<Command>, Vec<Binding>) {
        let mut commands = Vec::new();
        let mut bindings = Vec::new();
        for slot in &self.slots {
            commands.extend(slot.plugin.commands());
            bindings.extend(slot.plugin.default_bindings());
        }
        (commands, bindings)
    }

    pub fn view_focused(&self, frame: &mut Frame, area: Rect, styles: &Styles) {
        if let Some(plugin) = self.focused() {
            plugin.view(frame, area, styles);
        }
    }

    pub fn send_focused(&mut self, msg: PluginMsg) -> Vec<Task> {
        match self.focused {
            Some(idx) => self.dispatch(idx, msg),
            None => Vec::new(),
        }
    }

    pub fn send_to(&mut self, id: &str, msg: PluginMsg) -> Vec<Task> {
        match self.slots.iter().position(|slot| slot.plugin.id() == id) {
            Some(idx) => self.dispatch(idx, msg),
            None => {
                debug!(plugin = id, ?msg, "message for unknown plugin dropped");
                Vec::new()
            }
        }
    }

    pub fn broadcast(&mut self, make: impl Fn() -> PluginMsg) -> Vec<Task> {
        let mut tasks = Vec::new();
        for idx in 0..self.slots.len() {
            tasks.extend(self.dispatch(idx, make()));
        }
        tasks
    }

    fn dispatch(&mut self, idx: usize, msg: PluginMsg) -> Vec<Task> {
        if !self.is_running(idx) {
            return Vec::new();
        }
        let slot = &mut self.slots[idx];
        match slot.plugin.update(msg) {
            Ok(tasks) => tasks,
            Err(error) => {
                warn!(plugin = slot.plugin.id(), %error, "plugin disabled");
                slot.plugin.stop();
                slot.status = PluginStatus::Failed(error.to_string());
                if self.focused == Some(idx) {
                    self.focused = None;
                    if let Some(next) = self.first_running() {
                        self.focus_index(next);
                    }
                }
                Vec::new()
            }
        }
    }
}
