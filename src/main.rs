mod adapters;
mod app;
mod cli;
mod domain;
mod infra;
mod ui;

use crate::adapters::AdapterRegistry;
use crate::app::{
    AdapterMap, AppCommand, AppModel, AppMsg, AppServices, CLOCK_TICK, ConversationsPlugin,
    INTRO_TICK, Plugin, Task, WORKTREE_TICK,
};
use crate::cli::CliInvocation;
use crate::infra::{
    Clock, Config, ConfigWatcher, Dispatcher, StateStore, SystemClock, WatchBridge, config_path,
    init_logging, load_config, resolve_config_dir, state_path,
};
use crossterm::event::{
    self, DisableBracketedPaste, DisableMouseCapture, EnableBracketedPaste, EnableMouseCapture,
    Event, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::terminal::size as terminal_size;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use crossterm::{ExecutableCommand, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::io::{self, Stdout, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    App(#[from] crate::app::AppError),

    #[error("project directory {0} does not exist or is not a directory")]
    ProjectDir(PathBuf),
}

fn main() {
    if let Err(error) = run_main() {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "{error}");
        std::process::exit(1);
    }
}

fn run_main() -> Result<(), MainError> {
    let args = std::env::args().collect::<Vec<_>>();
    let invocation = match crate::cli::parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}\n");
            drop(err);
            print_help();
            std::process::exit(2);
        }
    };

    match invocation {
        CliInvocation::PrintHelp => {
            print_help();
            Ok(())
        }
        CliInvocation::PrintVersion => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliInvocation::Tui { project_dir } => run_tui(project_dir),
    }
}

fn print_help() {
    let mut out = io::stdout().lock();
    let _ = write!(out, "{}", crate::cli::help_text());
}

fn resolve_project_dir(project_dir: Option<PathBuf>) -> Result<PathBuf, MainError> {
    let dir = match project_dir {
        Some(dir) => dir,
        None => std::env::current_dir().map_err(crate::app::AppError::from)?,
    };
    if !dir.is_dir() {
        return Err(MainError::ProjectDir(dir));
    }
    Ok(dir.canonicalize().unwrap_or(dir))
}

fn run_tui(project_dir: Option<PathBuf>) -> Result<(), MainError> {
    let workdir = resolve_project_dir(project_dir)?;
    let config_dir = resolve_config_dir().map_err(crate::app::AppError::from)?;
    init_logging(&config_dir);
    info!(version = env!("CARGO_PKG_VERSION"), workdir = %workdir.display(), "starting");

    let config_file = config_path(&config_dir);
    let (config, startup_error) = match load_config(&config_file) {
        Ok(config) => (config, None),
        Err(error) => {
            warn!(%error, "config rejected at startup; using defaults");
            (Arc::new(Config::default()), Some(error.to_string()))
        }
    };

    let bus = Arc::new(Dispatcher::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let services = AppServices {
        config_path: config_file.clone(),
        config,
        state: Arc::new(StateStore::open(&state_path(&config_dir))),
        bus: bus.clone(),
        registry: Arc::new(AdapterRegistry::default()),
        clock: clock.clone(),
    };
    let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(ConversationsPlugin::new())];
    let model = AppModel::new(services, plugins, workdir);

    let (tx, rx) = channel::<AppMsg>();
    if let Some(reason) = startup_error {
        let _ = tx.send(AppMsg::ConfigInvalid(reason));
    }

    let mut config_watcher = start_config_watcher(&config_file, &tx);

    let mut terminal = setup_terminal()?;
    let result = run(&mut terminal, model, tx, rx, clock);
    restore_terminal(&mut terminal)?;

    if let Some(watcher) = config_watcher.as_mut() {
        watcher.stop();
    }
    bus.close();
    result.map_err(MainError::from)
}

fn start_config_watcher(path: &Path, tx: &Sender<AppMsg>) -> Option<ConfigWatcher> {
    let reload_tx = tx.clone();
    let error_tx = tx.clone();
    match ConfigWatcher::start_reporting(
        path,
        Box::new(move |config| {
            let _ = reload_tx.send(AppMsg::ConfigReloaded(config));
        }),
        Box::new(move |reason| {
            let _ = error_tx.send(AppMsg::ConfigInvalid(reason));
        }),
    ) {
        Ok(watcher) => Some(watcher),
        Err(error) => {
            warn!(%error, "config watcher unavailable; live reload disabled");
            None
        }
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, app::AppError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let _ = stdout.execute(EnableBracketedPaste);
    let _ = stdout.execute(EnableMouseCapture);
    let keyboard_flags = KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
        | KeyboardEnhancementFlags::REPORT_ALTERNATE_KEYS
        | KeyboardEnhancementFlags::REPORT_EVENT_TYPES;
    let _ = stdout.execute(PushKeyboardEnhancementFlags(keyboard_flags));
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
) -> Result<(), app::AppError> {
    disable_raw_mode()?;
    let _ = execute!(
        terminal.backend_mut(),
        DisableBracketedPaste,
        DisableMouseCapture,
        PopKeyboardEnhancementFlags
    );
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

struct Ticker {
    clock: Instant,
    intro: Instant,
    worktree: Instant,
}

impl Ticker {
    fn new(now: Instant) -> Self {
        Self {
            clock: now,
            intro: now,
            worktree: now,
        }
    }

    fn due(&mut self, model: &AppModel, now: Instant, clock: &dyn Clock) -> Vec<AppMsg> {
        let mut due = Vec::new();
        if model.intro_running() && now.duration_since(self.intro) >= INTRO_TICK {
            self.intro = now;
            due.push(AppMsg::IntroFrame);
        }
        if now.duration_since(self.clock) >= CLOCK_TICK {
            self.clock = now;
            due.push(AppMsg::Tick(clock.now()));
        }
        if now.duration_since(self.worktree) >= WORKTREE_TICK {
            self.worktree = now;
            due.push(AppMsg::WorktreeTick);
        }
        due
    }

    fn poll_timeout(&self, model: &AppModel, now: Instant) -> Duration {
        let mut timeout = IDLE_POLL.min(CLOCK_TICK.saturating_sub(now.duration_since(self.clock)));
        if model.intro_running() {
            timeout = timeout.min(INTRO_TICK.saturating_sub(now.duration_since(self.intro)));
        }
        timeout
    }
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    model: AppModel,
    tx: Sender<AppMsg>,
    rx: Receiver<AppMsg>,
    clock: Arc<dyn Clock>,
) -> Result<(), app::AppError> {
    let mut model = model;
    let mut bridges: Vec<WatchBridge> = Vec::new();

    if let Ok((width, height)) = terminal_size() {
        let _ = tx.send(AppMsg::Resize { width, height });
    }
    let boot = model.boot();
    if let Flow::Quit = execute_command(terminal, boot, &model, &tx, &mut bridges) {
        return Ok(());
    }

    let mut ticker = Ticker::new(Instant::now());
    loop {
        loop {
            let msg = match rx.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(()),
            };
            let (next, command) = app::update(model, msg);
            model = next;
            if let Flow::Quit = execute_command(terminal, command, &model, &tx, &mut bridges) {
                return Ok(());
            }
        }

        terminal.draw(|frame| ui::render(frame, &model))?;

        let now = Instant::now();
        for msg in ticker.due(&model, now, clock.as_ref()) {
            let _ = tx.send(msg);
        }

        if event::poll(ticker.poll_timeout(&model, now))? {
            let msg = match event::read()? {
                Event::Key(key) => AppMsg::Key(key),
                Event::Paste(text) => AppMsg::Paste(text),
                Event::Mouse(mouse) => AppMsg::Mouse(mouse),
                Event::Resize(width, height) => AppMsg::Resize { width, height },
                Event::FocusGained | Event::FocusLost => continue,
            };
            let (next, command) = app::update(model, msg);
            model = next;
            if let Flow::Quit = execute_command(terminal, command, &model, &tx, &mut bridges) {
                return Ok(());
            }
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

fn execute_command(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    command: AppCommand,
    model: &AppModel,
    tx: &Sender<AppMsg>,
    bridges: &mut Vec<WatchBridge>,
) -> Flow {
    match command {
        AppCommand::None => {}
        AppCommand::Quit => {
            for bridge in bridges.iter_mut() {
                bridge.stop();
            }
            return Flow::Quit;
        }
        AppCommand::Run(tasks) => spawn_tasks(tasks, tx),
        AppCommand::Rewatch {
            workdir,
            adapters,
            tasks,
        } => {
            rewatch(bridges, &workdir, &adapters, &model.bus);
            spawn_tasks(tasks, tx);
        }
        AppCommand::OpenEditor(path) => {
            let result = run_editor(terminal, &path);
            if let Err(reason) = &result {
                warn!(%reason, path = %path.display(), "editor failed");
            }
            let _ = tx.send(AppMsg::EditorExited(result));
        }
    }
    Flow::Continue
}

fn spawn_tasks(tasks: Vec<Task>, tx: &Sender<AppMsg>) {
    for task in tasks {
        let label = task.label();
        let tx = tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("task-{label}"))
            .spawn(move || {
                let _ = tx.send(task.run());
            });
        if let Err(error) = spawned {
            warn!(%error, label, "failed to spawn task thread");
        }
    }
}

fn rewatch(
    bridges: &mut Vec<WatchBridge>,
    workdir: &Path,
    adapters: &AdapterMap,
    bus: &Arc<Dispatcher>,
) {
    for bridge in bridges.iter_mut() {
        bridge.stop();
    }
    bridges.clear();

    for adapter in adapters.values() {
        let watcher = match adapter.watch(workdir) {
            Ok(watcher) => watcher,
            Err(error) => {
                warn!(adapter = adapter.id(), %error, "adapter watch failed");
                continue;
            }
        };
        match WatchBridge::spawn(adapter.id(), watcher, Arc::downgrade(bus)) {
            Ok(bridge) => bridges.push(bridge),
            Err(error) => warn!(adapter = adapter.id(), %error, "watch bridge failed"),
        }
    }
    debug!(count = bridges.len(), workdir = %workdir.display(), "adapter watches replaced");
}

fn editor_command() -> (String, Vec<String>) {
    let raw = std::env::var("EDITOR")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "vi".to_string());
    let mut parts = raw.split_whitespace().map(str::to_string);
    let program = parts.next().unwrap_or_else(|| "vi".to_string());
    (program, parts.collect())
}

fn run_editor(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    path: &Path,
) -> Result<(), String> {
    let (program, args) = editor_command();
    let _suspended = SuspendTuiGuard::suspend(terminal).map_err(|error| error.to_string())?;
    let status = Command::new(&program)
        .args(&args)
        .arg(path)
        .status()
        .map_err(|error| format!("{program}: {error}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("{program} exited with {status}"))
    }
}

/// Hands the terminal to a child process and takes it back on drop.
struct SuspendTuiGuard<'a> {
    terminal: &'a mut Terminal<CrosstermBackend<Stdout>>,
}

impl<'a> SuspendTuiGuard<'a> {
    fn suspend(terminal: &'a mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<Self> {
        let _ = execute!(
            terminal.backend_mut(),
            DisableBracketedPaste,
            DisableMouseCapture,
            PopKeyboardEnhancementFlags
        );
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        disable_raw_mode()?;
        terminal.show_cursor()?;
        Ok(Self { terminal })
    }
}

impl Drop for SuspendTuiGuard<'_> {
    fn drop(&mut self) {
        let _ = enable_raw_mode();
        let _ = execute!(
            self.terminal.backend_mut(),
            EnterAlternateScreen,
            EnableBracketedPaste,
            EnableMouseCapture,
            PushKeyboardEnhancementFlags(
                KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_ALTERNATE_KEYS
                    | KeyboardEnhancementFlags::REPORT_EVENT_TYPES
            )
        );
        let _ = self.terminal.hide_cursor();
        let _ = self.terminal.clear();
    }
}
