//! Interactive controller
//!
//! A reducer: [`update`] applies one [`AppEvent`] to [`AppState`] and returns the
//! [`Command`]s the runtime should execute. Nothing here performs I/O; command
//! results come back as [`AppEvent::CommandResult`].

use std::collections::HashMap;

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tracing::{debug, warn};

use tunnel9_common::{
    is_loopback_address, TunnelEvent, TunnelId, TunnelSpec, TunnelState, TunnelStatus,
};

use crate::form::EditForm;

/// What the screen is showing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    List,
    Form,
    ConfirmDelete(TunnelId),
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Error,
}

/// Transient status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub kind: MessageKind,
    pub text: String,
}

/// Config mutation carried by a persist command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOp {
    Create(TunnelId),
    Update(TunnelId),
    Delete(TunnelId),
}

impl PersistOp {
    pub fn id(&self) -> &TunnelId {
        match self {
            PersistOp::Create(id) | PersistOp::Update(id) | PersistOp::Delete(id) => id,
        }
    }
}

/// Work for the runtime
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(TunnelSpec),
    Stop(TunnelId),
    /// Forget a deleted tunnel in the supervisor
    Remove(TunnelId),
    /// Save the full tunnel list
    Persist {
        op: PersistOp,
        tunnels: Vec<TunnelSpec>,
    },
    Shutdown,
}

/// Outcome of a [`Command`]
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Started {
        id: TunnelId,
        status: TunnelStatus,
    },
    Stopped {
        id: TunnelId,
        result: Result<TunnelStatus, String>,
    },
    Removed {
        id: TunnelId,
        result: Result<(), String>,
    },
    Persisted {
        op: PersistOp,
        result: Result<(), String>,
    },
    ShutdownComplete {
        forced: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Key(KeyEvent),
    Resize(u16, u16),
    Supervisor(TunnelEvent),
    CommandResult(CommandResult),
    /// The hard quit deadline passed before shutdown finished
    QuitTimeout,
    /// Terminal input ended; treated as a quit request
    InputClosed,
}

/// Start or Stop awaiting its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    Start,
    Stop,
}

/// One tunnel as the controller sees it
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelRow {
    pub spec: TunnelSpec,
    /// Copy of the supervisor's state, reconciled from events
    pub state: TunnelState,
    /// Most recent error, kept after the tunnel recovers
    pub last_error: Option<String>,
}

impl TunnelRow {
    fn new(spec: TunnelSpec) -> Self {
        Self {
            spec,
            state: TunnelState::default(),
            last_error: None,
        }
    }
}

/// Persist awaiting its result, with what to restore if it fails
///
/// Only specs and row membership are restored; live tunnel state always comes
/// from the supervisor.
#[derive(Debug, Clone)]
struct InFlightPersist {
    op: PersistOp,
    previous: Vec<TunnelRow>,
}

/// Presentation state
#[derive(Debug, Clone)]
pub struct AppState {
    pub rows: Vec<TunnelRow>,
    pub cursor: usize,
    pub mode: Mode,
    pub form: Option<EditForm>,
    pub message: Option<StatusMessage>,
    pub pending: HashMap<TunnelId, Pending>,
    persist: Option<InFlightPersist>,
    /// Terminal size (columns, rows)
    pub viewport: (u16, u16),
    /// Where the config lives, for the title bar
    pub config_location: String,
    /// Shutdown issued, waiting for it to finish
    pub quitting: bool,
    /// The runtime should leave its loop
    pub should_exit: bool,
}

impl AppState {
    pub fn new(specs: Vec<TunnelSpec>, config_location: impl Into<String>) -> Self {
        Self {
            rows: specs.into_iter().map(TunnelRow::new).collect(),
            cursor: 0,
            mode: Mode::List,
            form: None,
            message: None,
            pending: HashMap::new(),
            persist: None,
            viewport: (80, 24),
            config_location: config_location.into(),
            quitting: false,
            should_exit: false,
        }
    }

    pub fn selected(&self) -> Option<&TunnelRow> {
        self.rows.get(self.cursor)
    }

    pub fn row(&self, id: &TunnelId) -> Option<&TunnelRow> {
        self.rows.iter().find(|row| &row.spec.id == id)
    }

    fn row_mut(&mut self, id: &TunnelId) -> Option<&mut TunnelRow> {
        self.rows.iter_mut().find(|row| &row.spec.id == id)
    }

    pub fn persist_in_flight(&self) -> bool {
        self.persist.is_some()
    }

    pub fn specs(&self) -> Vec<TunnelSpec> {
        self.rows.iter().map(|row| row.spec.clone()).collect()
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.message = Some(StatusMessage {
            kind: MessageKind::Info,
            text: text.into(),
        });
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.message = Some(StatusMessage {
            kind: MessageKind::Error,
            text: text.into(),
        });
    }

    fn clamp_cursor(&mut self) {
        if self.cursor >= self.rows.len() {
            self.cursor = self.rows.len().saturating_sub(1);
        }
    }

    /// Start the given tunnels at launch, marking each pending
    pub fn auto_start(&mut self, ids: &[TunnelId]) -> Vec<Command> {
        ids.iter().filter_map(|id| self.request_start(id)).collect()
    }

    fn request_start(&mut self, id: &TunnelId) -> Option<Command> {
        let row = self.row(id)?;
        if self.pending.contains_key(id) {
            debug!("Start of {} suppressed; command already in flight", id);
            return None;
        }
        if !row.state.status.can_start() {
            return None;
        }
        let spec = row.spec.clone();
        self.pending.insert(id.clone(), Pending::Start);
        Some(Command::Start(spec))
    }

    fn request_stop(&mut self, id: &TunnelId) -> Option<Command> {
        let row = self.row(id)?;
        if self.pending.contains_key(id) {
            debug!("Stop of {} suppressed; command already in flight", id);
            return None;
        }
        if !row.state.status.can_stop() {
            return None;
        }
        self.pending.insert(id.clone(), Pending::Stop);
        Some(Command::Stop(id.clone()))
    }
}

/// Apply one event
pub fn update(state: &mut AppState, event: AppEvent) -> Vec<Command> {
    match event {
        AppEvent::Key(key) => {
            if key.kind != KeyEventKind::Press {
                return Vec::new();
            }
            handle_key(state, key)
        }
        AppEvent::Resize(width, height) => {
            state.viewport = (width, height);
            Vec::new()
        }
        AppEvent::Supervisor(event) => {
            apply_tunnel_event(state, event);
            Vec::new()
        }
        AppEvent::CommandResult(result) => apply_result(state, result),
        AppEvent::QuitTimeout => {
            if state.quitting {
                warn!("Shutdown did not finish in time; exiting anyway");
                state.should_exit = true;
            }
            Vec::new()
        }
        AppEvent::InputClosed => {
            if state.quitting {
                return Vec::new();
            }
            begin_quit(state)
        }
    }
}

fn is_ctrl_c(key: &KeyEvent) -> bool {
    key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL)
}

fn handle_key(state: &mut AppState, key: KeyEvent) -> Vec<Command> {
    if state.quitting {
        if is_ctrl_c(&key) {
            warn!("Force quit requested");
            state.should_exit = true;
        }
        return Vec::new();
    }

    if is_ctrl_c(&key) {
        return begin_quit(state);
    }

    match state.mode.clone() {
        Mode::List => handle_list_key(state, key),
        Mode::Form => handle_form_key(state, key),
        Mode::ConfirmDelete(id) => handle_confirm_key(state, key, id),
        Mode::Help => {
            state.mode = Mode::List;
            Vec::new()
        }
    }
}

fn begin_quit(state: &mut AppState) -> Vec<Command> {
    state.quitting = true;
    state.mode = Mode::List;
    state.form = None;
    state.info("Stopping tunnels... (Ctrl-C again to force quit)");
    vec![Command::Shutdown]
}

fn handle_list_key(state: &mut AppState, key: KeyEvent) -> Vec<Command> {
    match key.code {
        KeyCode::Up | KeyCode::Char('k') => {
            state.cursor = state.cursor.saturating_sub(1);
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if state.cursor + 1 < state.rows.len() {
                state.cursor += 1;
            }
        }
        KeyCode::Home => state.cursor = 0,
        KeyCode::End => state.cursor = state.rows.len().saturating_sub(1),
        KeyCode::Char('s') | KeyCode::Enter => return start_selected(state),
        KeyCode::Char('x') => return stop_selected(state),
        KeyCode::Char(' ') => {
            let startable = state
                .selected()
                .map(|row| row.state.status.can_start())
                .unwrap_or(false);
            return if startable {
                start_selected(state)
            } else {
                stop_selected(state)
            };
        }
        KeyCode::Char('a') => {
            let ids: Vec<TunnelId> = state.rows.iter().map(|r| r.spec.id.clone()).collect();
            let commands: Vec<Command> =
                ids.iter().filter_map(|id| state.request_start(id)).collect();
            state.info(format!("Starting {} tunnel(s)", commands.len()));
            return commands;
        }
        KeyCode::Char('X') => {
            let ids: Vec<TunnelId> = state.rows.iter().map(|r| r.spec.id.clone()).collect();
            let commands: Vec<Command> =
                ids.iter().filter_map(|id| state.request_stop(id)).collect();
            state.info(format!("Stopping {} tunnel(s)", commands.len()));
            return commands;
        }
        KeyCode::Char('n') => {
            if refuse_while_saving(state) {
                return Vec::new();
            }
            state.form = Some(EditForm::new_tunnel());
            state.mode = Mode::Form;
        }
        KeyCode::Char('e') => {
            if refuse_while_saving(state) {
                return Vec::new();
            }
            if let Some(row) = state.selected() {
                state.form = Some(EditForm::from_spec(&row.spec));
                state.mode = Mode::Form;
            }
        }
        KeyCode::Char('d') => {
            if refuse_while_saving(state) {
                return Vec::new();
            }
            if let Some(row) = state.selected() {
                let id = row.spec.id.clone();
                let name = row.spec.name.clone();
                if row.state.status.can_start() && !state.pending.contains_key(&id) {
                    state.mode = Mode::ConfirmDelete(id);
                } else {
                    state.error(format!("Stop {} before deleting it", name));
                }
            }
        }
        KeyCode::Char('?') => state.mode = Mode::Help,
        KeyCode::Char('q') => return begin_quit(state),
        _ => {}
    }
    Vec::new()
}

fn refuse_while_saving(state: &mut AppState) -> bool {
    if state.persist_in_flight() {
        state.error("Still saving the previous change; try again in a moment");
        true
    } else {
        false
    }
}

fn start_selected(state: &mut AppState) -> Vec<Command> {
    let Some(row) = state.selected() else {
        return Vec::new();
    };
    let id = row.spec.id.clone();
    let name = row.spec.name.clone();
    let status = row.state.status;

    if state.pending.contains_key(&id) {
        return Vec::new();
    }
    if !status.can_start() {
        state.info(format!("{} is already {}", name, status));
        return Vec::new();
    }
    state.request_start(&id).into_iter().collect()
}

fn stop_selected(state: &mut AppState) -> Vec<Command> {
    let Some(row) = state.selected() else {
        return Vec::new();
    };
    let id = row.spec.id.clone();
    let name = row.spec.name.clone();
    let status = row.state.status;

    if state.pending.contains_key(&id) {
        return Vec::new();
    }
    if !status.can_stop() {
        state.info(format!("{} is not running", name));
        return Vec::new();
    }
    state.request_stop(&id).into_iter().collect()
}

fn handle_form_key(state: &mut AppState, key: KeyEvent) -> Vec<Command> {
    let Some(form) = state.form.as_mut() else {
        state.mode = Mode::List;
        return Vec::new();
    };

    match key.code {
        KeyCode::Tab | KeyCode::Down => form.next_field(),
        KeyCode::BackTab | KeyCode::Up => form.prev_field(),
        KeyCode::Backspace => form.backspace(),
        KeyCode::Esc => {
            state.form = None;
            state.mode = Mode::List;
        }
        KeyCode::Enter => return save_form(state),
        KeyCode::Char(c)
            if !key
                .modifiers
                .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
        {
            form.insert(c)
        }
        _ => {}
    }
    Vec::new()
}

fn save_form(state: &mut AppState) -> Vec<Command> {
    let Some(form) = state.form.as_ref() else {
        return Vec::new();
    };
    if state.persist.is_some() {
        state.error("Still saving the previous change; try again in a moment");
        return Vec::new();
    }

    let editing = form.editing().cloned();
    let others: Vec<TunnelSpec> = state
        .rows
        .iter()
        .filter(|row| Some(&row.spec.id) != editing.as_ref())
        .map(|row| row.spec.clone())
        .collect();

    let spec = match form.build(&others) {
        Ok(spec) => spec,
        Err(e) => {
            if let Some(form) = state.form.as_mut() {
                form.error = Some(e);
            }
            return Vec::new();
        }
    };

    let previous = state.rows.clone();
    let id = spec.id.clone();
    let exposed = (!is_loopback_address(&spec.bind_address)).then(|| spec.local_endpoint());

    let op = match editing {
        Some(editing) => {
            let Some(row) = state.row_mut(&editing) else {
                state.error("Tunnel disappeared while editing");
                state.form = None;
                state.mode = Mode::List;
                return Vec::new();
            };
            let running = !row.state.status.can_start();
            row.spec = spec;
            if running {
                state.info("Saved; changes apply on next start");
            } else {
                state.info("Saved");
            }
            PersistOp::Update(id)
        }
        None => {
            state.rows.push(TunnelRow::new(spec));
            state.cursor = state.rows.len() - 1;
            state.info("Created");
            PersistOp::Create(id)
        }
    };

    if let Some(endpoint) = exposed {
        state.info(format!(
            "Saved; {} is reachable from other hosts",
            endpoint
        ));
    }

    state.form = None;
    state.mode = Mode::List;
    state.persist = Some(InFlightPersist {
        op: op.clone(),
        previous,
    });
    vec![Command::Persist {
        op,
        tunnels: state.specs(),
    }]
}

fn handle_confirm_key(state: &mut AppState, key: KeyEvent, id: TunnelId) -> Vec<Command> {
    state.mode = Mode::List;
    if !matches!(key.code, KeyCode::Char('y') | KeyCode::Char('Y')) {
        state.info("Delete cancelled");
        return Vec::new();
    }

    let Some(index) = state.rows.iter().position(|row| row.spec.id == id) else {
        return Vec::new();
    };
    let row = &state.rows[index];
    if !row.state.status.can_start() || state.pending.contains_key(&id) {
        let name = row.spec.name.clone();
        state.error(format!("Stop {} before deleting it", name));
        return Vec::new();
    }
    if state.persist.is_some() {
        state.error("Still saving the previous change; try again in a moment");
        return Vec::new();
    }

    let previous = state.rows.clone();
    let removed = state.rows.remove(index);
    state.clamp_cursor();
    state.info(format!("Deleted {}", removed.spec.name));

    let op = PersistOp::Delete(id);
    state.persist = Some(InFlightPersist {
        op: op.clone(),
        previous,
    });
    vec![Command::Persist {
        op,
        tunnels: state.specs(),
    }]
}

fn apply_tunnel_event(state: &mut AppState, event: TunnelEvent) {
    match event {
        TunnelEvent::StatusChanged {
            id,
            status,
            error,
            retry_count,
            connected_since,
        } => {
            let Some(row) = state.row_mut(&id) else {
                debug!("Status for unknown tunnel {} ignored", id);
                return;
            };
            row.state.status = status;
            row.state.retry_count = retry_count;
            row.state.connected_since = connected_since;
            row.state.last_error = error.clone();
            if let Some(error) = error {
                row.last_error = Some(error);
            }

            if status == TunnelStatus::Failed {
                let name = row.spec.name.clone();
                let reason = row.last_error.clone().unwrap_or_default();
                state.error(format!("{} failed: {}", name, reason));
            }
        }
        TunnelEvent::Exited { id } => {
            debug!("Tunnel {} released its task", id);
        }
    }
}

fn apply_result(state: &mut AppState, result: CommandResult) -> Vec<Command> {
    match result {
        CommandResult::Started { id, status } => {
            state.pending.remove(&id);
            debug!("Start of {} returned {}", id, status);
        }
        CommandResult::Stopped { id, result } => {
            state.pending.remove(&id);
            if let Err(e) = result {
                state.error(format!("Stop failed: {}", e));
            }
        }
        CommandResult::Removed { id, result } => {
            if let Err(e) = result {
                debug!("Supervisor did not know {}: {}", id, e);
            }
        }
        CommandResult::Persisted { op, result } => {
            let Some(in_flight) = state.persist.take() else {
                warn!("Unexpected persist result for {:?}", op);
                return Vec::new();
            };
            if in_flight.op != op {
                warn!(
                    "Persist result for {:?} does not match {:?} in flight",
                    op, in_flight.op
                );
                state.persist = Some(in_flight);
                return Vec::new();
            }
            match result {
                Ok(()) => {
                    debug!("Saved config after {:?}", op);
                    if let PersistOp::Delete(id) = op {
                        return vec![Command::Remove(id)];
                    }
                }
                Err(e) => {
                    warn!("Rolling back change to {}: {}", op.id(), e);
                    let commands = roll_back(state, in_flight.previous);
                    state.error(format!("Could not save config: {}", e));
                    return commands;
                }
            }
        }
        CommandResult::ShutdownComplete { forced } => {
            if forced > 0 {
                warn!("{} tunnel(s) were force-terminated", forced);
            }
            state.should_exit = true;
        }
    }
    Vec::new()
}

/// Put back the specs and rows from before a failed persist
///
/// Surviving rows keep their current status. Rows that only the failed change
/// added are dropped and removed from the supervisor in case they were started.
fn roll_back(state: &mut AppState, previous: Vec<TunnelRow>) -> Vec<Command> {
    let selected = state.selected().map(|row| row.spec.id.clone());
    let mut current: HashMap<TunnelId, TunnelRow> = state
        .rows
        .drain(..)
        .map(|row| (row.spec.id.clone(), row))
        .collect();

    state.rows = previous
        .into_iter()
        .map(|before| match current.remove(&before.spec.id) {
            Some(row) => TunnelRow {
                spec: before.spec,
                ..row
            },
            None => before,
        })
        .collect();

    if let Some(index) =
        selected.and_then(|id| state.rows.iter().position(|row| row.spec.id == id))
    {
        state.cursor = index;
    }
    state.clamp_cursor();

    current
        .into_keys()
        .map(|id| {
            state.pending.remove(&id);
            Command::Remove(id)
        })
        .collect()
}
