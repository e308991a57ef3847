// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tunnel9 Contributors

// tunnel9 - Supervisor Module
// Owns the tunnel table and runs one lifecycle task per active tunnel

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnel9_common::{
    RetryPolicy, Settings, TunnelEvent, TunnelId, TunnelSpec, TunnelState, TunnelStatus, Utc,
};

use crate::connector::{Connector, TunnelConnection};
use crate::error::{SupervisorError, TunnelError};

/// Timing knobs for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Budget for one connection attempt
    pub connect_timeout: Duration,
    /// How long Stop waits for a tunnel task before aborting it
    pub stop_timeout: Duration,
    /// How long Shutdown waits for all tunnel tasks before aborting stragglers
    pub shutdown_timeout: Duration,
    /// Retry policy for tunnels without their own
    pub default_retry: RetryPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SupervisorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            stop_timeout: settings.stop_timeout(),
            shutdown_timeout: settings.shutdown_timeout(),
            default_retry: settings.retry.clone(),
        }
    }
}

/// Immutable view of one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSnapshot {
    pub id: TunnelId,
    pub name: String,
    pub state: TunnelState,
    /// Whether a connection task is attached
    pub has_handle: bool,
}

/// Outcome of [`TunnelSupervisor::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tunnels that finished on their own
    pub stopped: Vec<TunnelId>,
    /// Tunnels whose task had to be aborted
    pub forced: Vec<TunnelId>,
}

/// Handle on a running tunnel task
struct TaskHandle {
    cancel: CancellationToken,
    abort: AbortHandle,
    /// Taken by whoever waits for the task to finish
    join: Option<JoinHandle<()>>,
}

/// State of a supervised tunnel
struct ManagedTunnel {
    spec: TunnelSpec,
    state: TunnelState,
    /// Generation of the current (or last) run
    run: u64,
    task: Option<TaskHandle>,
}

impl std::fmt::Debug for ManagedTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTunnel")
            .field("id", &self.spec.id)
            .field("status", &self.state.status)
            .field("run", &self.run)
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl ManagedTunnel {
    fn new(spec: TunnelSpec) -> Self {
        Self {
            spec,
            state: TunnelState::default(),
            run: 0,
            task: None,
        }
    }

    /// Apply a lifecycle edge and publish it; invalid edges are refused
    fn transition(
        &mut self,
        next: TunnelStatus,
        error: Option<String>,
        event_tx: &mpsc::UnboundedSender<TunnelEvent>,
    ) -> bool {
        let current = self.state.status;
        if !current.can_transition_to(next) {
            warn!(
                "Refusing transition {} -> {} for tunnel {}",
                current, next, self.spec.id
            );
            return false;
        }

        self.state.status = next;
        match next {
            TunnelStatus::Connected => {
                self.state.connected_since = Some(Utc::now());
                self.state.retry_count = 0;
                self.state.last_error = None;
            }
            TunnelStatus::Retrying => {
                self.state.connected_since = None;
                self.state.retry_count += 1;
            }
            TunnelStatus::Idle | TunnelStatus::Failed => {
                self.state.connected_since = None;
                self.task = None;
            }
            TunnelStatus::Starting | TunnelStatus::Stopping => {}
        }
        if error.is_some() {
            self.state.last_error = error;
        }

        debug!("Tunnel {}: {} -> {}", self.spec.id, current, next);

        let id = self.spec.id.clone();
        if let Err(e) = event_tx.send(TunnelEvent::StatusChanged {
            id: id.clone(),
            status: next,
            error: self.state.last_error.clone(),
            retry_count: self.state.retry_count,
            connected_since: self.state.connected_since,
        }) {
            debug!("Failed to publish status for {}: {}", id, e);
        }
        if matches!(next, TunnelStatus::Idle | TunnelStatus::Failed) {
            let _ = event_tx.send(TunnelEvent::Exited { id });
        }
        true
    }

    fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            state: self.state.clone(),
            has_handle: self.task.is_some(),
        }
    }
}

#[derive(Debug, Default)]
struct TunnelTable {
    /// Registration order
    order: Vec<TunnelId>,
    entries: HashMap<TunnelId, ManagedTunnel>,
    next_run: u64,
}

impl TunnelTable {
    fn upsert(&mut self, spec: TunnelSpec) -> &mut ManagedTunnel {
        let id = spec.id.clone();
        if !self.entries.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.entries
            .entry(id)
            .or_insert_with(|| ManagedTunnel::new(spec))
    }
}

/// A task that was told to stop and still has to be reaped
struct StopTicket {
    id: TunnelId,
    run: u64,
    join: JoinHandle<()>,
}

/// Identity of one run of a tunnel task
#[derive(Clone)]
struct RunContext {
    id: TunnelId,
    run: u64,
    cancel: CancellationToken,
}

/// Supervises all tunnels
#[derive(Clone)]
pub struct TunnelSupervisor {
    /// Tunnel table, private to the supervisor and its tasks
    tunnels: Arc<RwLock<TunnelTable>>,
    /// Ordered status events for the controller
    event_tx: mpsc::UnboundedSender<TunnelEvent>,
    connector: Arc<dyn Connector>,
    options: Arc<SupervisorOptions>,
}

impl TunnelSupervisor {
    /// Create a supervisor and the receiving end of its event stream
    pub fn new(
        connector: Arc<dyn Connector>,
        options: SupervisorOptions,
    ) -> (Self, mpsc::UnboundedReceiver<TunnelEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            tunnels: Arc::new(RwLock::new(TunnelTable::default())),
            event_tx,
            connector,
            options: Arc::new(options),
        };
        (supervisor, event_rx)
    }

    /// Install tunnel specs without starting them
    pub async fn register(&self, specs: &[TunnelSpec]) {
        let mut table = self.tunnels.write().await;
        for spec in specs {
            let entry = table.upsert(spec.clone());
            if entry.state.status.can_start() {
                entry.spec = spec.clone();
            }
        }
    }

    /// Get the status of a tunnel
    pub async fn status(&self, id: &TunnelId) -> Option<TunnelStatus> {
        let table = self.tunnels.read().await;
        table.entries.get(id).map(|t| t.state.status)
    }

    pub async fn snapshot(&self, id: &TunnelId) -> Option<TunnelSnapshot> {
        let table = self.tunnels.read().await;
        table.entries.get(id).map(ManagedTunnel::snapshot)
    }

    /// All tunnels in registration order
    pub async fn snapshots(&self) -> Vec<TunnelSnapshot> {
        let table = self.tunnels.read().await;
        table
            .order
            .iter()
            .filter_map(|id| table.entries.get(id))
            .map(ManagedTunnel::snapshot)
            .collect()
    }

    /// Start a tunnel
    ///
    /// Returns the status after the call. Starting a tunnel that is already
    /// starting, connected, retrying or stopping changes nothing.
    pub async fn start(&self, spec: TunnelSpec) -> TunnelStatus {
        let mut table = self.tunnels.write().await;
        table.next_run += 1;
        let run = table.next_run;

        let entry = table.upsert(spec.clone());
        let current = entry.state.status;
        if !current.can_start() {
            debug!("Tunnel {} already {}; ignoring start", spec.id, current);
            return current;
        }

        info!("Starting tunnel: {} ({})", spec.name, spec.id);

        entry.spec = spec.clone();
        entry.run = run;
        entry.state.retry_count = 0;
        entry.state.last_error = None;
        entry.transition(TunnelStatus::Starting, None, &self.event_tx);

        let ctx = RunContext {
            id: spec.id.clone(),
            run,
            cancel: CancellationToken::new(),
        };
        let join = tokio::spawn(run_tunnel(self.clone(), ctx.clone(), spec));
        entry.task = Some(TaskHandle {
            cancel: ctx.cancel,
            abort: join.abort_handle(),
            join: Some(join),
        });

        TunnelStatus::Starting
    }

    /// Stop a tunnel
    ///
    /// A pending backoff ends immediately; a connect attempt or live connection is
    /// cancelled and given `stop_timeout` to wind down before its task is aborted.
    pub async fn stop(&self, id: &TunnelId) -> Result<TunnelStatus, SupervisorError> {
        let ticket = {
            let mut table = self.tunnels.write().await;
            let entry = table
                .entries
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownTunnel(id.clone()))?;

            match self.begin_stop(entry) {
                Some(ticket) => ticket,
                None => return Ok(entry.state.status),
            }
        };

        self.reap(vec![ticket], self.options.stop_timeout).await;
        Ok(TunnelStatus::Idle)
    }

    /// Stop a tunnel if needed and forget it
    pub async fn remove(&self, id: &TunnelId) -> Result<(), SupervisorError> {
        self.stop(id).await?;

        let mut table = self.tunnels.write().await;
        if let Some(entry) = table.entries.get(id) {
            if entry.task.is_some() {
                // Restarted between the stop and now; leave it alone
                warn!("Tunnel {} was restarted while being removed", id);
                return Ok(());
            }
        }
        table.entries.remove(id);
        table.order.retain(|known| known != id);
        info!("Removed tunnel {}", id);
        Ok(())
    }

    /// Stop every active tunnel within `shutdown_timeout`
    ///
    /// Tunnels that do not wind down in time have their task aborted. Returns once
    /// every formerly active tunnel is Idle.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut tickets = Vec::new();
        {
            let mut table = self.tunnels.write().await;
            let ids = table.order.clone();
            for id in &ids {
                if let Some(entry) = table.entries.get_mut(id) {
                    tickets.extend(self.begin_stop(entry));
                }
            }
        }

        info!("Shutting down {} tunnel task(s)", tickets.len());
        let report = self.reap(tickets, self.options.shutdown_timeout).await;
        if !report.forced.is_empty() {
            let err = SupervisorError::ShutdownTimeout {
                timeout: self.options.shutdown_timeout,
                forced: report.forced.len(),
            };
            error!("{}", err);
        }
        report
    }

    /// Signal a tunnel to stop; returns a ticket when a task must be reaped
    fn begin_stop(&self, entry: &mut ManagedTunnel) -> Option<StopTicket> {
        match entry.state.status {
            TunnelStatus::Idle | TunnelStatus::Failed | TunnelStatus::Stopping => None,
            TunnelStatus::Retrying => {
                info!("Cancelling retry for tunnel: {}", entry.spec.name);
                if let Some(task) = &entry.task {
                    task.cancel.cancel();
                    task.abort.abort();
                }
                entry.transition(TunnelStatus::Idle, None, &self.event_tx);
                None
            }
            TunnelStatus::Starting | TunnelStatus::Connected => {
                info!("Stopping tunnel: {}", entry.spec.name);
                let join = entry.task.as_mut().and_then(|task| {
                    task.cancel.cancel();
                    task.join.take()
                });
                entry.transition(TunnelStatus::Stopping, None, &self.event_tx);
                join.map(|join| StopTicket {
                    id: entry.spec.id.clone(),
                    run: entry.run,
                    join,
                })
            }
        }
    }

    /// Wait for stopping tasks, abort stragglers, then mark them Idle
    async fn reap(&self, mut tickets: Vec<StopTicket>, limit: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if tickets.is_empty() {
            return report;
        }

        let all = futures::future::join_all(tickets.iter_mut().map(|t| &mut t.join));
        if tokio::time::timeout(limit, all).await.is_err() {
            warn!("Tunnel tasks did not stop within {:?}", limit);
        }

        for ticket in &tickets {
            if ticket.join.is_finished() {
                report.stopped.push(ticket.id.clone());
            } else {
                warn!("Force-terminating tunnel {}", ticket.id);
                ticket.join.abort();
                report.forced.push(ticket.id.clone());
            }
        }

        let mut table = self.tunnels.write().await;
        for ticket in &tickets {
            if let Some(entry) = table.entries.get_mut(&ticket.id) {
                if entry.run == ticket.run && entry.state.status == TunnelStatus::Stopping {
                    entry.transition(TunnelStatus::Idle, None, &self.event_tx);
                    info!("Tunnel {} stopped", entry.spec.name);
                }
            }
        }
        report
    }

    /// Move a running tunnel to `next` unless its run was stopped or superseded
    async fn advance(
        &self,
        ctx: &RunContext,
        next: TunnelStatus,
        error: Option<&TunnelError>,
    ) -> bool {
        let mut table = self.tunnels.write().await;
        if ctx.cancel.is_cancelled() {
            return false;
        }
        match table.entries.get_mut(&ctx.id) {
            Some(entry) if entry.run == ctx.run => {
                entry.transition(next, error.map(ToString::to_string), &self.event_tx)
            }
            _ => false,
        }
    }
}

/// Lifecycle of one run: connect, hold, retry with backoff, until failed or cancelled
async fn run_tunnel(supervisor: TunnelSupervisor, ctx: RunContext, spec: TunnelSpec) {
    let policy = spec
        .retry_policy(&supervisor.options.default_retry)
        .clone();
    let connect_timeout = supervisor.options.connect_timeout;

    if let Err(e) = spec.validate() {
        let error = TunnelError::ConfigMismatch(e.to_string());
        error!("Tunnel {} failed: {}", spec.id, error);
        supervisor
            .advance(&ctx, TunnelStatus::Failed, Some(&error))
            .await;
        return;
    }

    // Consecutive failed attempts since the last successful connect
    let mut attempt: u32 = 0;

    loop {
        let connect = AssertUnwindSafe(supervisor.connector.connect(&spec)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!("Connect attempt for {} cancelled", spec.id);
                return;
            }
            result = tokio::time::timeout(connect_timeout, connect) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_panic)) => Err(TunnelError::Connection("connector panicked".to_string())),
                Err(_elapsed) => Err(TunnelError::Timeout(connect_timeout)),
            },
        };

        let error = match outcome {
            Ok(connection) => match hold_connection(&supervisor, &ctx, &spec, connection).await {
                Some(error) => {
                    attempt = 0;
                    error
                }
                None => return,
            },
            Err(error) => error,
        };

        if !error.is_retryable() {
            error!("Tunnel {} failed: {}", spec.id, error);
            supervisor
                .advance(&ctx, TunnelStatus::Failed, Some(&error))
                .await;
            return;
        }

        attempt += 1;
        if !policy.allows(attempt) {
            let error = TunnelError::Connection(format!(
                "giving up after {} attempt(s): {}",
                attempt, error
            ));
            error!("Tunnel {} failed: {}", spec.id, error);
            supervisor
                .advance(&ctx, TunnelStatus::Failed, Some(&error))
                .await;
            return;
        }

        if !supervisor
            .advance(&ctx, TunnelStatus::Retrying, Some(&error))
            .await
        {
            return;
        }

        let delay = policy.delay(attempt);
        warn!(
            "Tunnel {} attempt {} failed ({}); retrying in {:?}",
            spec.id, attempt, error, delay
        );

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!("Backoff for {} cancelled", spec.id);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if !supervisor.advance(&ctx, TunnelStatus::Starting, None).await {
            return;
        }
    }
}

/// Hold a live connection until it drops (returns the reason) or the run is cancelled
async fn hold_connection(
    supervisor: &TunnelSupervisor,
    ctx: &RunContext,
    spec: &TunnelSpec,
    mut connection: Box<dyn TunnelConnection>,
) -> Option<TunnelError> {
    if !supervisor
        .advance(ctx, TunnelStatus::Connected, None)
        .await
    {
        connection.close().await;
        return None;
    }
    info!(
        "Tunnel {} connected: {} -> {}",
        spec.id,
        spec.local_endpoint(),
        spec.remote_endpoint()
    );

    let dropped = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => None,
        result = AssertUnwindSafe(connection.closed()).catch_unwind() => Some(
            result.unwrap_or_else(|_| TunnelError::Connection("connection panicked".to_string())),
        ),
    };

    match dropped {
        Some(error) => {
            warn!("Tunnel {} connection lost: {}", spec.id, error);
            // Connected has no edge to Failed; a drop always goes through Retrying
            if error.is_retryable() {
                Some(error)
            } else {
                Some(TunnelError::Connection(format!("connection lost: {}", error)))
            }
        }
        None => {
            debug!("Closing connection for {}", spec.id);
            connection.close().await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::Instant;

    /// What the fake connector does on one attempt
    #[derive(Clone)]
    enum Attempt {
        Fail(TunnelError),
        Hang,
        Connect {
            drop_after: Option<Duration>,
            close_hangs: bool,
        },
        /// Connect, then end the connection with `error`
        DropWith { after: Duration, error: TunnelError },
    }

    fn connect_ok() -> Attempt {
        Attempt::Connect {
            drop_after: None,
            close_hangs: false,
        }
    }

    #[derive(Default)]
    struct Counters {
        attempts: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    impl Counters {
        fn open(
            self: Arc<Self>,
            drop_after: Option<(Duration, TunnelError)>,
            close_hangs: bool,
        ) -> Box<dyn TunnelConnection> {
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            Box::new(FakeConnection {
                drop_after,
                close_hangs,
                counters: self,
            })
        }
    }

    /// Connector driven by a per-tunnel script; the last entry repeats
    #[derive(Default)]
    struct ScriptedConnector {
        scripts: Mutex<HashMap<TunnelId, VecDeque<Attempt>>>,
        counters: Mutex<HashMap<TunnelId, Arc<Counters>>>,
    }

    impl ScriptedConnector {
        fn script(&self, id: &str, attempts: Vec<Attempt>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(TunnelId::new(id), attempts.into());
        }

        fn counters(&self, id: &str) -> Arc<Counters> {
            self.counters
                .lock()
                .unwrap()
                .entry(TunnelId::new(id))
                .or_default()
                .clone()
        }

        fn next_attempt(&self, id: &TunnelId) -> Attempt {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.entry(id.clone()).or_default();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap_or_else(connect_ok)
            }
        }
    }

    struct FakeConnection {
        drop_after: Option<(Duration, TunnelError)>,
        close_hangs: bool,
        counters: Arc<Counters>,
    }

    impl Drop for FakeConnection {
        fn drop(&mut self) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TunnelConnection for FakeConnection {
        async fn closed(&mut self) -> TunnelError {
            match self.drop_after.clone() {
                Some((after, error)) => {
                    tokio::time::sleep(after).await;
                    error
                }
                None => std::future::pending().await,
            }
        }

        async fn close(self: Box<Self>) {
            if self.close_hangs {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            spec: &TunnelSpec,
        ) -> Result<Box<dyn TunnelConnection>, TunnelError> {
            let counters = self.counters(spec.id.as_str());
            counters.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;

            match self.next_attempt(&spec.id) {
                Attempt::Fail(error) => Err(error),
                Attempt::Hang => std::future::pending().await,
                Attempt::Connect {
                    drop_after,
                    close_hangs,
                } => {
                    let reset = TunnelError::Connection("connection reset".to_string());
                    Ok(counters.open(drop_after.map(|after| (after, reset)), close_hangs))
                }
                Attempt::DropWith { after, error } => {
                    Ok(counters.open(Some((after, error)), false))
                }
            }
        }
    }

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            connect_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(2),
            default_retry: RetryPolicy {
                base_delay_ms: 10_000,
                multiplier: 2.0,
                max_delay_ms: 60_000,
                max_attempts: 0,
                jitter: 0.0,
            },
        }
    }

    fn spec(name: &str) -> TunnelSpec {
        TunnelSpec::new(name, 10_000, "localhost", 80, "ssh.example.com")
    }

    fn setup() -> (
        TunnelSupervisor,
        mpsc::UnboundedReceiver<TunnelEvent>,
        Arc<ScriptedConnector>,
    ) {
        let connector = Arc::new(ScriptedConnector::default());
        let (supervisor, events) = TunnelSupervisor::new(connector.clone(), options());
        (supervisor, events, connector)
    }

    /// Next status change, skipping Exited markers
    async fn next_status(events: &mut mpsc::UnboundedReceiver<TunnelEvent>) -> TunnelStatus {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(600), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if let TunnelEvent::StatusChanged { status, .. } = event {
                return status;
            }
        }
    }

    /// Status changes up to and including `wanted`
    async fn collect_until(
        events: &mut mpsc::UnboundedReceiver<TunnelEvent>,
        wanted: TunnelStatus,
    ) -> Vec<TunnelStatus> {
        let mut seen = Vec::new();
        loop {
            let status = next_status(events).await;
            seen.push(status);
            if status == wanted {
                return seen;
            }
        }
    }

    async fn wait_for(events: &mut mpsc::UnboundedReceiver<TunnelEvent>, wanted: TunnelStatus) {
        collect_until(events, wanted).await;
    }

    fn drain_statuses(events: &mut mpsc::UnboundedReceiver<TunnelEvent>) -> Vec<TunnelStatus> {
        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TunnelEvent::StatusChanged { status, .. } = event {
                statuses.push(status);
            }
        }
        statuses
    }

    fn assert_valid_walk(statuses: &[TunnelStatus]) {
        let mut current = TunnelStatus::Idle;
        for next in statuses {
            assert!(
                current.can_transition_to(*next),
                "invalid transition {} -> {} in {:?}",
                current,
                next,
                statuses
            );
            current = *next;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects() {
        let (supervisor, mut events, _connector) = setup();

        assert_eq!(supervisor.start(spec("web")).await, TunnelStatus::Starting);
        wait_for(&mut events, TunnelStatus::Connected).await;

        let snapshot = supervisor.snapshot(&"web".into()).await.unwrap();
        assert_eq!(snapshot.state.status, TunnelStatus::Connected);
        assert!(snapshot.state.connected_since.is_some());
        assert!(snapshot.has_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_start_is_noop() {
        let (supervisor, mut events, connector) = setup();

        let results = futures::future::join_all((0..10).map(|_| supervisor.start(spec("web")))).await;
        assert_eq!(
            results.iter().filter(|s| **s == TunnelStatus::Starting).count(),
            10
        );
        wait_for(&mut events, TunnelStatus::Connected).await;

        assert_eq!(supervisor.start(spec("web")).await, TunnelStatus::Connected);

        let counters = connector.counters("web");
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.max_live.load(Ordering::SeqCst), 1);
        assert!(drain_statuses(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries() {
        let (supervisor, mut events, connector) = setup();
        connector.script(
            "web",
            vec![
                Attempt::Fail(TunnelError::Connection("refused".into())),
                connect_ok(),
            ],
        );

        supervisor.start(spec("web")).await;
        assert_eq!(next_status(&mut events).await, TunnelStatus::Starting);
        assert_eq!(next_status(&mut events).await, TunnelStatus::Retrying);

        let snapshot = supervisor.snapshot(&"web".into()).await.unwrap();
        assert_eq!(snapshot.state.retry_count, 1);
        assert!(snapshot.state.last_error.unwrap().contains("refused"));

        assert_eq!(next_status(&mut events).await, TunnelStatus::Starting);
        assert_eq!(next_status(&mut events).await, TunnelStatus::Connected);

        let snapshot = supervisor.snapshot(&"web".into()).await.unwrap();
        assert_eq!(snapshot.state.retry_count, 0);
        assert_eq!(snapshot.state.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_terminal_until_restarted() {
        let (supervisor, mut events, connector) = setup();
        connector.script(
            "web",
            vec![Attempt::Fail(TunnelError::Auth("key rejected".into())), connect_ok()],
        );

        supervisor.start(spec("web")).await;
        wait_for(&mut events, TunnelStatus::Failed).await;
        assert_eq!(
            events.recv().await,
            Some(TunnelEvent::Exited { id: "web".into() })
        );

        let snapshot = supervisor.snapshot(&"web".into()).await.unwrap();
        assert!(!snapshot.has_handle);
        assert_eq!(connector.counters("web").attempts.load(Ordering::SeqCst), 1);

        // Stop on Failed changes nothing
        assert_eq!(
            supervisor.stop(&"web".into()).await,
            Ok(TunnelStatus::Failed)
        );

        assert_eq!(supervisor.start(spec("web")).await, TunnelStatus::Starting);
        wait_for(&mut events, TunnelStatus::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.script(
            "web",
            vec![Attempt::Fail(TunnelError::Connection("unreachable".into()))],
        );
        let mut opts = options();
        opts.default_retry.max_attempts = 2;
        opts.default_retry.base_delay_ms = 100;
        let (supervisor, mut events) = TunnelSupervisor::new(connector.clone(), opts);

        supervisor.start(spec("web")).await;
        wait_for(&mut events, TunnelStatus::Failed).await;

        assert_eq!(connector.counters("web").attempts.load(Ordering::SeqCst), 3);
        let snapshot = supervisor.snapshot(&"web".into()).await.unwrap();
        assert!(snapshot.state.last_error.unwrap().contains("giving up"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_tunnel_retry_override() {
        let (supervisor, mut events, connector) = setup();
        connector.script(
            "web",
            vec![Attempt::Fail(TunnelError::Connection("unreachable".into()))],
        );
        let mut web = spec("web");
        web.retry = Some(RetryPolicy {
            base_delay_ms: 10,
            multiplier: 1.0,
            max_delay_ms: 10,
            max_attempts: 1,
            jitter: 0.0,
        });

        supervisor.start(web).await;
        wait_for(&mut events, TunnelStatus::Failed).await;
        assert_eq!(connector.counters("web").attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_retrying_cancels_backoff() {
        let (supervisor, mut events, connector) = setup();
        connector.script(
            "web",
            vec![Attempt::Fail(TunnelError::Connection("refused".into()))],
        );

        supervisor.start(spec("web")).await;
        wait_for(&mut events, TunnelStatus::Retrying).await;

        let before = Instant::now();
        assert_eq!(supervisor.stop(&"web".into()).await, Ok(TunnelStatus::Idle));
        assert!(before.elapsed() < Duration::from_millis(100));

        assert_eq!(next_status(&mut events).await, TunnelStatus::Idle);
        let snapshot = supervisor.snapshot(&"web".into()).await.unwrap();
        assert!(!snapshot.has_handle);

        // Well past the 10s backoff nothing else happens
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain_statuses(&mut events).is_empty());
        assert_eq!(connector.counters("web").attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_connect_attempt() {
        let (supervisor, mut events, connector) = setup();
        connector.script("web", vec![Attempt::Hang]);

        supervisor.start(spec("web")).await;
        assert_eq!(next_status(&mut events).await, TunnelStatus::Starting);

        let before = Instant::now();
        assert_eq!(supervisor.stop(&"web".into()).await, Ok(TunnelStatus::Idle));
        assert!(before.elapsed() < Duration::from_millis(100));

        assert_eq!(
            drain_statuses(&mut events),
            vec![TunnelStatus::Stopping, TunnelStatus::Idle]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_connected_releases_handle() {
        let (supervisor, mut events, connector) = setup();

        supervisor.start(spec("web")).await;
        wait_for(&mut events, TunnelStatus::Connected).await;

        assert_eq!(supervisor.stop(&"web".into()).await, Ok(TunnelStatus::Idle));
        let counters = connector.counters("web");
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);

        let snapshot = supervisor.snapshot(&"web".into()).await.unwrap();
        assert_eq!(snapshot.state.status, TunnelStatus::Idle);
        assert!(!snapshot.has_handle);

        // Idempotent
        assert_eq!(supervisor.stop(&"web".into()).await, Ok(TunnelStatus::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_unresponsive_connection() {
        let (supervisor, mut events, connector) = setup();
        connector.script(
            "web",
            vec![Attempt::Connect {
                drop_after: None,
                close_hangs: true,
            }],
        );

        supervisor.start(spec("web")).await;
        wait_for(&mut events, TunnelStatus::Connected).await;

        let before = Instant::now();
        assert_eq!(supervisor.stop(&"web".into()).await, Ok(TunnelStatus::Idle));
        let elapsed = before.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1_100));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.counters("web").live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unknown_tunnel() {
        let (supervisor, _events, _connector) = setup();
        assert_eq!(
            supervisor.stop(&"ghost".into()).await,
            Err(SupervisorError::UnknownTunnel("ghost".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_drop_reconnects() {
        let (supervisor, mut events, connector) = setup();
        connector.script(
            "web",
            vec![
                Attempt::Connect {
                    drop_after: Some(Duration::from_secs(5)),
                    close_hangs: false,
                },
                connect_ok(),
            ],
        );

        supervisor.start(spec("web")).await;
        wait_for(&mut events, TunnelStatus::Connected).await;
        assert_eq!(next_status(&mut events).await, TunnelStatus::Retrying);
        assert_eq!(next_status(&mut events).await, TunnelStatus::Starting);
        assert_eq!(next_status(&mut events).await, TunnelStatus::Connected);

        let counters = connector.counters("web");
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(counters.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_from_live_connection_retries_first() {
        let (supervisor, mut events, connector) = setup();
        let revoked = TunnelError::Auth("key revoked".to_string());
        connector.script(
            "web",
            vec![
                Attempt::DropWith {
                    after: Duration::from_secs(1),
                    error: revoked.clone(),
                },
                Attempt::Fail(revoked),
            ],
        );

        supervisor.start(spec("web")).await;
        let statuses = collect_until(&mut events, TunnelStatus::Failed).await;
        assert_eq!(
            statuses,
            vec![
                TunnelStatus::Starting,
                TunnelStatus::Connected,
                TunnelStatus::Retrying,
                TunnelStatus::Starting,
                TunnelStatus::Failed,
            ]
        );
        assert_valid_walk(&statuses);

        let snapshot = supervisor.snapshot(&"web".into()).await.unwrap();
        assert_eq!(snapshot.state.status, TunnelStatus::Failed);
        assert!(!snapshot.has_handle);
        assert!(snapshot.state.last_error.unwrap().contains("key revoked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_transient() {
        let (supervisor, mut events, connector) = setup();
        connector.script("web", vec![Attempt::Hang, connect_ok()]);

        supervisor.start(spec("web")).await;
        assert_eq!(next_status(&mut events).await, TunnelStatus::Starting);
        assert_eq!(next_status(&mut events).await, TunnelStatus::Retrying);

        let snapshot = supervisor.snapshot(&"web".into()).await.unwrap();
        assert!(snapshot.state.last_error.unwrap().contains("timed out"));

        wait_for(&mut events, TunnelStatus::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_spec_fails() {
        let (supervisor, mut events, connector) = setup();
        let mut bad = spec("web");
        bad.remote_host.clear();

        supervisor.start(bad).await;
        wait_for(&mut events, TunnelStatus::Failed).await;
        assert_eq!(connector.counters("web").attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_sequence_is_valid_walk() {
        let (supervisor, mut events, connector) = setup();
        connector.script(
            "web",
            vec![
                Attempt::Fail(TunnelError::Connection("refused".into())),
                connect_ok(),
            ],
        );
        let id: TunnelId = "web".into();

        let mut statuses = Vec::new();
        supervisor.start(spec("web")).await;
        supervisor.start(spec("web")).await;
        statuses.extend(collect_until(&mut events, TunnelStatus::Retrying).await);
        supervisor.stop(&id).await.unwrap();
        supervisor.stop(&id).await.unwrap();
        supervisor.start(spec("web")).await;
        statuses.extend(collect_until(&mut events, TunnelStatus::Connected).await);
        supervisor.stop(&id).await.unwrap();
        supervisor.start(spec("web")).await;
        supervisor.stop(&id).await.unwrap();
        statuses.extend(drain_statuses(&mut events));

        assert_valid_walk(&statuses);
        assert!(!statuses.windows(2).any(|pair| pair
            == [TunnelStatus::Idle, TunnelStatus::Connected]));
        assert!(connector.counters("web").max_live.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_does_not_affect_others() {
        let (supervisor, mut events, connector) = setup();
        connector.script("bad", vec![Attempt::Fail(TunnelError::Auth("nope".into()))]);

        supervisor.start(spec("bad")).await;
        supervisor.start(spec("good")).await;

        let mut failed = false;
        let mut connected = false;
        while !(failed && connected) {
            match events.recv().await.unwrap() {
                TunnelEvent::StatusChanged { id, status, .. } => match (id.as_str(), status) {
                    ("bad", TunnelStatus::Failed) => failed = true,
                    ("good", TunnelStatus::Connected) => connected = true,
                    _ => {}
                },
                TunnelEvent::Exited { .. } => {}
            }
        }
        assert_eq!(
            supervisor.status(&"good".into()).await,
            Some(TunnelStatus::Connected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_forces_unresponsive_tunnel() {
        let (supervisor, mut events, connector) = setup();
        connector.script(
            "stuck",
            vec![Attempt::Connect {
                drop_after: None,
                close_hangs: true,
            }],
        );

        for name in ["alpha", "beta", "stuck"] {
            supervisor.start(spec(name)).await;
        }
        let mut connected = 0;
        while connected < 3 {
            if let TunnelEvent::StatusChanged {
                status: TunnelStatus::Connected,
                ..
            } = events.recv().await.unwrap()
            {
                connected += 1;
            }
        }

        let before = Instant::now();
        let report = supervisor.shutdown().await;
        let elapsed = before.elapsed();

        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2_100));
        assert_eq!(report.forced, vec![TunnelId::new("stuck")]);
        assert_eq!(
            report.stopped,
            vec![TunnelId::new("alpha"), TunnelId::new("beta")]
        );

        for snapshot in supervisor.snapshots().await {
            assert_eq!(snapshot.state.status, TunnelStatus::Idle);
            assert!(!snapshot.has_handle);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.counters("stuck").live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_retrying_tunnels() {
        let (supervisor, mut events, connector) = setup();
        connector.script(
            "web",
            vec![Attempt::Fail(TunnelError::Connection("refused".into()))],
        );
        supervisor.register(&[spec("idle")]).await;
        supervisor.start(spec("web")).await;
        wait_for(&mut events, TunnelStatus::Retrying).await;

        let report = supervisor.shutdown().await;
        assert!(report.forced.is_empty());
        assert_eq!(
            supervisor.status(&"web".into()).await,
            Some(TunnelStatus::Idle)
        );
        assert_eq!(
            supervisor.status(&"idle".into()).await,
            Some(TunnelStatus::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_remove() {
        let (supervisor, mut events, _connector) = setup();
        supervisor
            .register(&[spec("one"), spec("two"), spec("three")])
            .await;
        let ids: Vec<_> = supervisor
            .snapshots()
            .await
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["one", "two", "three"]);

        supervisor.start(spec("two")).await;
        wait_for(&mut events, TunnelStatus::Connected).await;
        supervisor.remove(&"two".into()).await.unwrap();

        assert_eq!(supervisor.status(&"two".into()).await, None);
        assert_eq!(supervisor.snapshots().await.len(), 2);
    }
}
