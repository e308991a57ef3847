//! Terminal session and event loop
//!
//! Everything blocking or slow runs off the loop: supervisor calls are spawned
//! and config writes go through `spawn_blocking`. Their outcomes come back as
//! [`CommandResult`]s on a channel and are fed through the reducer like any
//! other event.

use std::io::{self, Stdout, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use crossterm::{
    event::{Event, EventStream},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::StreamExt;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    Terminal,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tunnel9_common::{ConfigStore, TunnelEvent};
use tunnel9_supervisor::TunnelSupervisor;

use crate::app::{self, AppEvent, AppState, Command, CommandResult};
use crate::ui;

/// Redraw interval for uptime counters
const TICK: Duration = Duration::from_secs(1);

/// Runs [`Command`]s in the background and reports their results
#[derive(Clone)]
pub struct Executor {
    supervisor: TunnelSupervisor,
    store: Arc<dyn ConfigStore>,
    results: mpsc::UnboundedSender<CommandResult>,
}

impl Executor {
    pub fn new(
        supervisor: TunnelSupervisor,
        store: Arc<dyn ConfigStore>,
    ) -> (Self, mpsc::UnboundedReceiver<CommandResult>) {
        let (results, rx) = mpsc::unbounded_channel();
        (
            Self {
                supervisor,
                store,
                results,
            },
            rx,
        )
    }

    pub fn execute(&self, command: Command) {
        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor.run(command).await;
            if executor.results.send(result).is_err() {
                debug!("Event loop gone; dropping command result");
            }
        });
    }

    async fn run(&self, command: Command) -> CommandResult {
        match command {
            Command::Start(spec) => {
                let id = spec.id.clone();
                let status = self.supervisor.start(spec).await;
                CommandResult::Started { id, status }
            }
            Command::Stop(id) => {
                let result = self.supervisor.stop(&id).await.map_err(|e| e.to_string());
                CommandResult::Stopped { id, result }
            }
            Command::Remove(id) => {
                let result = self
                    .supervisor
                    .remove(&id)
                    .await
                    .map_err(|e| e.to_string());
                CommandResult::Removed { id, result }
            }
            Command::Persist { op, tunnels } => {
                let store = self.store.clone();
                let result = match tokio::task::spawn_blocking(move || store.save(&tunnels)).await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(e) => Err(format!("config writer crashed: {}", e)),
                };
                if let Err(e) = &result {
                    error!("Failed to save config for {:?}: {}", op, e);
                }
                CommandResult::Persisted { op, result }
            }
            Command::Shutdown => {
                let report = self.supervisor.shutdown().await;
                info!(
                    "Shutdown finished: {} stopped, {} forced",
                    report.stopped.len(),
                    report.forced.len()
                );
                CommandResult::ShutdownComplete {
                    forced: report.forced.len(),
                }
            }
        }
    }
}

/// Map a terminal event onto the reducer's input
fn translate(event: Event) -> Option<AppEvent> {
    match event {
        Event::Key(key) => Some(AppEvent::Key(key)),
        Event::Resize(width, height) => Some(AppEvent::Resize(width, height)),
        _ => None,
    }
}

/// Apply one event and hand the resulting commands to the executor
///
/// Returns true once the user is on the way out and the quit deadline should start.
fn dispatch(state: &mut AppState, executor: &Executor, event: AppEvent) -> bool {
    let was_quitting = state.quitting;
    for command in app::update(state, event) {
        executor.execute(command);
    }
    state.quitting && !was_quitting
}

/// Drive the UI until the reducer asks to exit
pub async fn run_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    state: &mut AppState,
    executor: &Executor,
    mut tunnel_events: mpsc::UnboundedReceiver<TunnelEvent>,
    mut results: mpsc::UnboundedReceiver<CommandResult>,
    quit_timeout: Duration,
) -> Result<()> {
    let mut events = EventStream::new();
    let mut ticker = tokio::time::interval(TICK);
    let mut quit_deadline: Option<Instant> = None;
    let mut input_open = true;

    let size = terminal.size()?;
    dispatch(state, executor, AppEvent::Resize(size.width, size.height));

    while !state.should_exit {
        terminal.draw(|frame| ui::render(frame, state, Utc::now()))?;

        let deadline = async {
            match quit_deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let event = tokio::select! {
            _ = ticker.tick() => None,
            Some(event) = tunnel_events.recv() => Some(AppEvent::Supervisor(event)),
            Some(result) = results.recv() => Some(AppEvent::CommandResult(result)),
            _ = deadline => Some(AppEvent::QuitTimeout),
            maybe_event = events.next(), if input_open => match maybe_event {
                Some(Ok(event)) => translate(event),
                Some(Err(e)) => {
                    warn!("Terminal input error: {}", e);
                    None
                }
                None => {
                    warn!("Terminal input closed");
                    input_open = false;
                    Some(AppEvent::InputClosed)
                }
            },
        };

        if let Some(event) = event {
            if dispatch(state, executor, event) {
                quit_deadline = Some(Instant::now() + quit_timeout);
            }
        }
    }

    Ok(())
}

/// Enter raw mode and the alternate screen
pub fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode().context("Failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let terminal = execute!(stdout, EnterAlternateScreen)
        .context("Failed to enter alternate screen")
        .and_then(|()| {
            Terminal::new(CrosstermBackend::new(stdout)).context("Failed to create terminal")
        });
    if terminal.is_err() {
        undo_setup(&mut io::stdout());
    }
    terminal
}

/// Best-effort return to cooked mode after a failed setup
fn undo_setup<W: Write>(out: &mut W) {
    if let Err(e) = execute!(out, LeaveAlternateScreen) {
        warn!("Failed to leave alternate screen: {}", e);
    }
    if let Err(e) = disable_raw_mode() {
        warn!("Failed to disable raw mode: {}", e);
    }
}

/// Leave raw mode and the alternate screen
pub fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
