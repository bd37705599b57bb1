// src/core/tracker.rs - Session tracker task
//
// Single owner of the session machine, the clock and the geofence monitor.
// Every input (user command, region event, server completion) is a message on
// one queue and is handled to completion before the next, so state
// transitions never interleave. Network calls run in spawned tasks whose
// results come back as messages and are re-validated against current state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::core::clock::{Clock, ClockTicker, InstantSource};
use crate::core::machine::{ClockOutReason, Command, Effect, SessionMachine, Ticket};
use crate::core::types::{DashboardSnapshot, SessionState};
use crate::events::{BusEvent, EventBus, Subscription, Topic};
use crate::gateway::cache::DashboardCache;
use crate::gateway::{CommandReceipt, DashboardGateway};
use crate::geofence::{GeofenceMonitor, GraceExpiry, RegionTransition, RegionWatcher};
use crate::infra::config::Config;
use crate::infra::errors::StudyError;

type Reply = oneshot::Sender<Result<SessionState, StudyError>>;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub grace: Duration,
    pub tick: Duration,
    pub geofence_enabled: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for TrackerConfig {
    fn from(config: &Config) -> Self {
        Self {
            grace: config.geofence.grace(),
            tick: config.clock.tick(),
            geofence_enabled: config.geofence.enabled,
        }
    }
}

pub struct TrackerDeps {
    pub gateway: Arc<dyn DashboardGateway>,
    pub watcher: Arc<dyn RegionWatcher>,
    pub bus: EventBus,
    pub source: Arc<dyn InstantSource>,
    pub cache: Option<DashboardCache>,
}

enum Message {
    ClockIn { location_id: i64, reply: Reply },
    ClockOut { reply: Reply },
    Rebuild { reply: Reply },
    Background,
    Foreground,
    Shutdown { reply: oneshot::Sender<()> },
}

enum Internal {
    Transition(RegionTransition),
    Expired(GraceExpiry),
    RetryClockOut,
    FetchDone {
        seq: u64,
        epoch: u64,
        result: Result<DashboardSnapshot, StudyError>,
    },
    CommandDone {
        ticket: Ticket,
        command: Command,
        result: Result<CommandReceipt, StudyError>,
    },
}

/// Caller waiting on the next dashboard fetch.
enum Waiter {
    /// Explicit rebuild: fetch errors are reported.
    Rebuild(Reply),
    /// Accepted command awaiting confirmation: the command itself succeeded,
    /// so a failed follow-up fetch still answers with the current state.
    Command(Reply),
}

/// Cloneable front end to the tracker task.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::UnboundedSender<Message>,
    state_rx: watch::Receiver<SessionState>,
    clock: Arc<Mutex<Clock>>,
}

impl TrackerHandle {
    /// Clock in at `location_id`. Resolves once the server has answered.
    pub async fn clock_in(&self, location_id: i64) -> Result<SessionState, StudyError> {
        self.request(|reply| Message::ClockIn { location_id, reply })
            .await
    }

    /// Clock out of the open session. Resolves once the server has answered.
    pub async fn clock_out(&self) -> Result<SessionState, StudyError> {
        self.request(|reply| Message::ClockOut { reply }).await
    }

    /// Re-derive state from a fresh dashboard fetch.
    pub async fn rebuild(&self) -> Result<SessionState, StudyError> {
        self.request(|reply| Message::Rebuild { reply }).await
    }

    /// Host went to the background: stop ticking.
    pub fn background(&self) {
        let _ = self.tx.send(Message::Background);
    }

    /// Host returned: resume ticking and refresh from the server.
    pub fn foreground(&self) {
        let _ = self.tx.send(Message::Foreground);
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.clock
            .lock()
            .map(|c| c.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn request<F>(&self, build: F) -> Result<SessionState, StudyError>
    where
        F: FnOnce(Reply) -> Message,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| StudyError::TrackerStopped)?;
        rx.await.map_err(|_| StudyError::TrackerStopped)?
    }
}

pub struct SessionTracker {
    machine: SessionMachine,
    config: TrackerConfig,
    gateway: Arc<dyn DashboardGateway>,
    bus: EventBus,
    source: Arc<dyn InstantSource>,
    cache: Option<DashboardCache>,
    clock: Arc<Mutex<Clock>>,
    ticker: ClockTicker,
    monitor: GeofenceMonitor,
    watched_location: Option<i64>,
    foreground: bool,
    state_tx: watch::Sender<SessionState>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    last_snapshot: Option<DashboardSnapshot>,
    fetch_task: Option<JoinHandle<()>>,
    clock_out_retry: Option<JoinHandle<()>>,
    fetch_seq: u64,
    fetch_in_flight: Option<u64>,
    refetch_queued: bool,
    /// Bumped on every command completion; fetches started before a
    /// completion are stale.
    commands_completed: u64,
    /// Waiters paired with the first fetch sequence number allowed to
    /// answer them.
    fetch_waiters: Vec<(u64, Waiter)>,
    command_waiters: HashMap<Ticket, Reply>,
    unauthorized_signalled: bool,
    consistency_checked: Option<u64>,
    subscriptions: Vec<Subscription>,
}

impl SessionTracker {
    /// Spawn the tracker task. It immediately rebuilds from the server.
    /// Must be called inside a tokio runtime.
    pub fn spawn(config: TrackerConfig, deps: TrackerDeps) -> (TrackerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let clock = Arc::new(Mutex::new(Clock::new(deps.source.clone())));

        let subscriptions = forward_geofence_events(&deps.bus, &internal_tx);
        let monitor = GeofenceMonitor::new(
            config.grace,
            deps.bus.clone(),
            deps.source.clone(),
            deps.watcher,
        );

        let tracker = SessionTracker {
            machine: SessionMachine::new(config.grace),
            config,
            gateway: deps.gateway,
            bus: deps.bus,
            source: deps.source,
            cache: deps.cache,
            clock: clock.clone(),
            ticker: ClockTicker::new(),
            monitor,
            watched_location: None,
            foreground: true,
            state_tx,
            internal_tx,
            last_snapshot: None,
            fetch_task: None,
            clock_out_retry: None,
            fetch_seq: 0,
            fetch_in_flight: None,
            refetch_queued: false,
            commands_completed: 0,
            fetch_waiters: Vec::new(),
            command_waiters: HashMap::new(),
            unauthorized_signalled: false,
            consistency_checked: None,
            subscriptions,
        };

        let task = tokio::spawn(tracker.run(rx, internal_rx));
        (TrackerHandle { tx, state_rx, clock }, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Message>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        tracing::info!(
            grace_secs = self.config.grace.as_secs(),
            geofence = self.config.geofence_enabled,
            "Session tracker started"
        );
        self.start_fetch();

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(Message::Shutdown { reply }) => {
                            self.teardown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(msg) => self.handle_message(msg).await,
                        None => {
                            self.teardown().await;
                            break;
                        }
                    }
                }
                Some(internal) = internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
            }
            self.after_step().await;
        }
        tracing::info!("Session tracker stopped");
    }

    async fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::ClockIn { location_id, reply } => {
                match self.machine.request_clock_in(location_id) {
                    Ok(effects) => {
                        if let Some(ticket) = self.machine.pending_ticket() {
                            self.command_waiters.insert(ticket, reply);
                        }
                        self.apply(effects).await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Message::ClockOut { reply } => {
                match self.machine.request_clock_out(ClockOutReason::Manual) {
                    Ok(effects) => {
                        if let Some(ticket) = self.machine.pending_ticket() {
                            self.command_waiters.insert(ticket, reply);
                        }
                        self.apply(effects).await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Message::Rebuild { reply } => {
                // Only a fetch started after this request may answer it.
                let wanted = self.fetch_seq + 1;
                self.start_fetch();
                self.fetch_waiters.push((wanted, Waiter::Rebuild(reply)));
            }
            Message::Background => {
                tracing::debug!("Host backgrounded; pausing ticker");
                self.foreground = false;
                self.ticker.pause();
            }
            Message::Foreground => {
                tracing::debug!("Host foregrounded; resuming");
                self.foreground = true;
                self.ensure_ticker();
                self.start_fetch();
            }
            Message::Shutdown { .. } => {}
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Transition(transition) => {
                let effects = self.machine.region_transition(&transition);
                self.apply(effects).await;
            }
            Internal::Expired(expiry) => {
                let effects = self.machine.grace_expired(&expiry);
                self.apply(effects).await;
            }
            Internal::RetryClockOut => {
                self.clock_out_retry = None;
                let effects = self.machine.retry_owed_clock_out();
                self.apply(effects).await;
            }
            Internal::FetchDone { seq, epoch, result } => {
                self.on_fetch_done(seq, epoch, result).await;
            }
            Internal::CommandDone {
                ticket,
                command,
                result,
            } => {
                self.on_command_done(ticket, command, result).await;
            }
        }
    }

    async fn on_fetch_done(
        &mut self,
        seq: u64,
        epoch: u64,
        result: Result<DashboardSnapshot, StudyError>,
    ) {
        if self.fetch_in_flight != Some(seq) {
            tracing::debug!(seq, "Ignoring result of abandoned fetch");
            return;
        }
        self.fetch_in_flight = None;
        self.fetch_task = None;

        if epoch < self.commands_completed {
            tracing::debug!("Dashboard fetch predates a command completion; refetching");
            self.refetch_queued = false;
            self.start_fetch();
            return;
        }

        match result {
            Ok(snapshot) => {
                self.unauthorized_signalled = false;
                self.store_snapshot(&snapshot);
                let effects = self.machine.rebuild(&snapshot, self.source.now());
                self.apply(effects).await;
                let state = self.machine.state().clone();
                for waiter in self.take_waiters(seq) {
                    match waiter {
                        Waiter::Rebuild(reply) | Waiter::Command(reply) => {
                            let _ = reply.send(Ok(state.clone()));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Dashboard refresh failed: {}", e);
                let state = self.machine.state().clone();
                for waiter in self.take_waiters(seq) {
                    match waiter {
                        Waiter::Rebuild(reply) => {
                            let _ = reply.send(Err(e.duplicate()));
                        }
                        Waiter::Command(reply) => {
                            let _ = reply.send(Ok(state.clone()));
                        }
                    }
                }
                if e.is_unauthorized() {
                    self.signal_unauthorized();
                } else {
                    self.bus.publish(BusEvent::CommandFailed {
                        command: "refresh".into(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if self.refetch_queued {
            self.refetch_queued = false;
            self.start_fetch();
        }
    }

    async fn on_command_done(
        &mut self,
        ticket: Ticket,
        command: Command,
        result: Result<CommandReceipt, StudyError>,
    ) {
        self.commands_completed += 1;
        let now = self.source.now();
        let mut waiter = self.command_waiters.remove(&ticket);

        let effects = match result {
            Ok(receipt) => {
                self.unauthorized_signalled = false;
                if let Some(snapshot) = &receipt.snapshot {
                    self.store_snapshot(snapshot);
                }
                match command {
                    Command::ClockIn { .. } => {
                        self.machine
                            .clock_in_succeeded(ticket, receipt.snapshot.as_ref(), now)
                    }
                    Command::ClockOut { .. } => {
                        self.machine
                            .clock_out_succeeded(ticket, receipt.snapshot.as_ref(), now)
                    }
                }
            }
            Err(e) => {
                let effects = self.machine.command_failed(ticket, &e);
                if let Some(reply) = waiter.take() {
                    let _ = reply.send(Err(e));
                }
                effects
            }
        };

        let wants_rebuild = effects.iter().any(|e| matches!(e, Effect::RequestRebuild));
        self.apply(effects).await;

        if let Some(reply) = waiter {
            if wants_rebuild && self.fetch_in_flight.is_some() {
                self.fetch_waiters.push((0, Waiter::Command(reply)));
            } else {
                let _ = reply.send(Ok(self.machine.state().clone()));
            }
        }
    }

    /// Carry out effects in order. Effects produced while applying (region
    /// registration failure) are appended to the queue.
    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::IssueClockIn {
                    ticket,
                    location_id,
                } => self.spawn_command(ticket, Command::ClockIn { location_id }),
                Effect::IssueClockOut { ticket, reason } => {
                    self.spawn_command(ticket, Command::ClockOut { reason })
                }
                Effect::StartClock(at) => self.start_clock(at),
                Effect::StopClock => self.stop_clock(),
                Effect::WatchRegions { location_id } => {
                    let more = self.watch_regions(location_id).await;
                    queue.extend(more);
                }
                Effect::UnwatchRegions => self.unwatch_regions().await,
                Effect::Publish(event) => {
                    self.bus.publish(event);
                }
                Effect::SignalUnauthorized => self.signal_unauthorized(),
                Effect::RequestRebuild => self.start_fetch(),
                Effect::ScheduleClockOutRetry(delay) => self.schedule_clock_out_retry(delay),
            }
        }
    }

    /// Publish state and check clock/state agreement after each message.
    async fn after_step(&mut self) {
        let state = self.machine.state().clone();
        self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });

        let revision = self.machine.revision();
        if self.consistency_checked == Some(revision) {
            return;
        }
        let running = self.clock.lock().map(|c| c.is_running()).unwrap_or(false);
        if let Some(effect) = self.machine.check_consistency(running) {
            self.consistency_checked = Some(revision);
            self.apply(vec![effect]).await;
        }
    }

    fn spawn_command(&mut self, ticket: Ticket, command: Command) {
        let gateway = self.gateway.clone();
        let tx = self.internal_tx.clone();
        tracing::info!(ticket, command = command.name(), "Issuing command");
        tokio::spawn(async move {
            let result = match &command {
                Command::ClockIn { location_id } => gateway.clock_in(*location_id).await,
                Command::ClockOut { .. } => gateway.clock_out().await,
            };
            let _ = tx.send(Internal::CommandDone {
                ticket,
                command,
                result,
            });
        });
    }

    fn schedule_clock_out_retry(&mut self, delay: Duration) {
        if let Some(previous) = self.clock_out_retry.take() {
            previous.abort();
        }
        let tx = self.internal_tx.clone();
        self.clock_out_retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::RetryClockOut);
        }));
    }

    /// Start a dashboard fetch, or queue one behind the fetch in flight.
    fn start_fetch(&mut self) {
        if self.fetch_in_flight.is_some() {
            self.refetch_queued = true;
            return;
        }
        self.fetch_seq += 1;
        let seq = self.fetch_seq;
        let epoch = self.commands_completed;
        let gateway = self.gateway.clone();
        let tx = self.internal_tx.clone();
        self.fetch_in_flight = Some(seq);
        self.fetch_task = Some(tokio::spawn(async move {
            let result = gateway.fetch_current_state().await;
            let _ = tx.send(Internal::FetchDone { seq, epoch, result });
        }));
    }

    fn take_waiters(&mut self, seq: u64) -> Vec<Waiter> {
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.fetch_waiters)
            .into_iter()
            .partition(|(wanted, _)| *wanted <= seq);
        self.fetch_waiters = pending;
        ready.into_iter().map(|(_, w)| w).collect()
    }

    fn store_snapshot(&mut self, snapshot: &DashboardSnapshot) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save(snapshot, self.source.now()) {
                tracing::warn!("Failed to write dashboard cache: {}", e);
            }
        }
        self.bus.publish(BusEvent::DashboardRefreshed {
            sessions: snapshot.user_sessions.len(),
        });
        self.last_snapshot = Some(snapshot.clone());
    }

    fn start_clock(&mut self, at: chrono::DateTime<chrono::Utc>) {
        match self.clock.lock() {
            Ok(mut clock) => {
                if let Err(e) = clock.start(Some(at)) {
                    tracing::warn!("Clock rejected session start: {}", e);
                }
            }
            Err(_) => tracing::error!("Clock lock poisoned"),
        }
        self.ensure_ticker();
    }

    fn stop_clock(&mut self) {
        if let Ok(mut clock) = self.clock.lock() {
            clock.reset();
        }
        self.ticker.pause();
    }

    fn ensure_ticker(&mut self) {
        let running = self.clock.lock().map(|c| c.is_running()).unwrap_or(false);
        if self.foreground && running && !self.ticker.is_active() {
            self.ticker
                .resume(self.clock.clone(), self.bus.clone(), self.config.tick);
        }
    }

    async fn watch_regions(&mut self, location_id: i64) -> Vec<Effect> {
        if !self.config.geofence_enabled {
            return Vec::new();
        }
        if self.watched_location == Some(location_id) && self.monitor.is_running() {
            return Vec::new();
        }
        let regions = self
            .last_snapshot
            .as_ref()
            .map(|s| s.regions_for_location(location_id))
            .unwrap_or_default();

        match self.monitor.start(regions).await {
            Ok(()) => {
                self.watched_location = Some(location_id);
                self.machine.regions_available();
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(location_id, "Geofence unavailable; automatic clock-out disabled: {}", e);
                self.watched_location = None;
                let first_failure = self.machine.auto_clock_out();
                let effects = self.machine.regions_unavailable(&e);
                if first_failure {
                    effects
                } else {
                    Vec::new()
                }
            }
        }
    }

    async fn unwatch_regions(&mut self) {
        if self.watched_location.take().is_some() || self.monitor.is_running() {
            self.monitor.stop().await;
        }
    }

    /// Credential rejected: stop network work and tell observers once.
    fn signal_unauthorized(&mut self) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        self.fetch_in_flight = None;
        self.refetch_queued = false;
        let state = self.machine.state().clone();
        for (_, waiter) in self.fetch_waiters.drain(..) {
            match waiter {
                Waiter::Rebuild(reply) => {
                    let _ = reply.send(Err(StudyError::Unauthorized));
                }
                Waiter::Command(reply) => {
                    let _ = reply.send(Ok(state.clone()));
                }
            }
        }
        if !self.unauthorized_signalled {
            self.unauthorized_signalled = true;
            tracing::warn!("Dashboard credential rejected");
            self.bus.publish(BusEvent::Unauthorized);
        }
    }

    async fn teardown(&mut self) {
        for sub in self.subscriptions.drain(..) {
            sub.unsubscribe();
        }
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        if let Some(task) = self.clock_out_retry.take() {
            task.abort();
        }
        self.ticker.pause();
        self.monitor.stop().await;
        for (_, waiter) in self.fetch_waiters.drain(..) {
            let (Waiter::Rebuild(reply) | Waiter::Command(reply)) = waiter;
            let _ = reply.send(Err(StudyError::TrackerStopped));
        }
        for (_, reply) in self.command_waiters.drain() {
            let _ = reply.send(Err(StudyError::TrackerStopped));
        }
    }
}

/// Geofence events arrive on the bus; route them into the tracker queue.
fn forward_geofence_events(
    bus: &EventBus,
    internal_tx: &mpsc::UnboundedSender<Internal>,
) -> Vec<Subscription> {
    let tx = internal_tx.clone();
    let transitions = bus.subscribe(Topic::GeofenceTransition, move |event| {
        if let BusEvent::GeofenceTransition(t) = event {
            tx.send(Internal::Transition(t.clone()))
                .map_err(|_| anyhow::anyhow!("session tracker stopped"))?;
        }
        Ok(())
    });
    let tx = internal_tx.clone();
    let expiries = bus.subscribe(Topic::GeofenceExpired, move |event| {
        if let BusEvent::GeofenceExpired(e) = event {
            tx.send(Internal::Expired(e.clone()))
                .map_err(|_| anyhow::anyhow!("session tracker stopped"))?;
        }
        Ok(())
    });
    vec![transitions, expiries]
}
