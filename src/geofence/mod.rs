// src/geofence/mod.rs - Geofence monitor with exit grace period
//
// Raw region transitions arrive from a `RegionWatcher` (the host's region
// registration service). The monitor republishes them on the event bus and
// runs a single-shot grace timer per region: an Exit arms it, a matching
// Enter cancels it, a newer Exit replaces it. When a timer elapses the monitor
// publishes `GeofenceExpired`, which the session tracker treats as an
// authoritative clock-out trigger.

pub mod region;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::clock::InstantSource;
use crate::core::types::GeofenceRegion;
use crate::events::{BusEvent, EventBus};
use crate::infra::errors::StudyError;
use region::RegionTracker;

/// Capacity of the raw transition channel handed out by watchers.
const TRANSITION_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Enter,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionTransition {
    pub region_id: String,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
}

/// Raised when an exit was not followed by re-entry within the grace period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraceExpiry {
    pub region_id: String,
    pub exit_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PendingExit {
    exit_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    due: Instant,
}

/// Per-region single-shot grace timers. Pure bookkeeping; the monitor task
/// decides when to call `take_due`.
#[derive(Debug)]
pub struct GraceTracker {
    grace: Duration,
    pending: HashMap<String, PendingExit>,
}

impl GraceTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: HashMap::new(),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Arm (or re-arm) the timer for `region_id`. `lag` is how long ago the
    /// exit happened relative to when it was received. Returns true when a
    /// pending timer was replaced.
    pub fn on_exit(&mut self, region_id: &str, exit_at: DateTime<Utc>, received: Instant, lag: Duration) -> bool {
        let deadline = exit_at
            + chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::zero());
        let due = received + self.grace.saturating_sub(lag);
        self.pending
            .insert(
                region_id.to_string(),
                PendingExit {
                    exit_at,
                    deadline,
                    due,
                },
            )
            .is_some()
    }

    /// Cancel the pending timer for `region_id`. Returns true if one was armed.
    pub fn on_enter(&mut self, region_id: &str) -> bool {
        self.pending.remove(region_id).is_some()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    /// Remove and return every timer due at or before `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<GraceExpiry> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired: Vec<GraceExpiry> = due
            .into_iter()
            .filter_map(|id| {
                self.pending.remove(&id).map(|p| GraceExpiry {
                    region_id: id,
                    exit_at: p.exit_at,
                    deadline: p.deadline,
                })
            })
            .collect();
        expired.sort_by_key(|e| e.deadline);
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Host region-registration service.
///
/// `register` returns the receiving end of the raw transition feed for the
/// given regions; registering again replaces the previous feed.
#[async_trait]
pub trait RegionWatcher: Send + Sync {
    async fn register(
        &self,
        regions: &[GeofenceRegion],
    ) -> Result<mpsc::Receiver<RegionTransition>, StudyError>;

    async fn unregister(&self) -> Result<(), StudyError>;
}

#[derive(Default)]
struct ChannelState {
    sender: Option<mpsc::Sender<RegionTransition>>,
    regions: Vec<GeofenceRegion>,
    tracker: RegionTracker,
}

/// In-process watcher: callers push transitions (or raw position fixes)
/// directly. Used by the CLI `watch` loop and by tests.
#[derive(Default)]
pub struct ChannelRegionWatcher {
    state: Mutex<ChannelState>,
}

impl ChannelRegionWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a transition into the active feed. Returns false when nothing is
    /// registered or the transition was dropped.
    pub fn inject(&self, transition: RegionTransition) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        let Some(tx) = state.sender.as_ref() else {
            return false;
        };
        match tx.try_send(transition) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(
                    region = %dropped.region_id,
                    kind = ?dropped.kind,
                    "Region feed full; transition dropped"
                );
                false
            }
            Err(TrySendError::Closed(dropped)) => {
                tracing::warn!(region = %dropped.region_id, "Region feed closed; transition dropped");
                false
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().is_ok_and(|s| s.sender.is_some())
    }

    /// Feed a position fix; membership changes become transitions.
    pub fn observe_fix(&self, lat: f64, lon: f64, at: DateTime<Utc>) -> usize {
        let transitions = {
            let Ok(mut state) = self.state.lock() else {
                return 0;
            };
            let regions = state.regions.clone();
            state.tracker.observe(&regions, lat, lon, at)
        };
        transitions.into_iter().filter(|t| self.inject(t.clone())).count()
    }

    pub fn registered_regions(&self) -> Vec<GeofenceRegion> {
        self.state
            .lock()
            .map(|s| s.regions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RegionWatcher for ChannelRegionWatcher {
    async fn register(
        &self,
        regions: &[GeofenceRegion],
    ) -> Result<mpsc::Receiver<RegionTransition>, StudyError> {
        let (tx, rx) = mpsc::channel(TRANSITION_BUFFER);
        let mut state = self.state.lock().map_err(|_| StudyError::RegionRegistration {
            message: "watcher state poisoned".into(),
        })?;
        state.sender = Some(tx);
        state.regions = regions.to_vec();
        // Regions are registered on clock-in, which implies presence.
        state.tracker.assume_inside(regions);
        Ok(rx)
    }

    async fn unregister(&self) -> Result<(), StudyError> {
        if let Ok(mut state) = self.state.lock() {
            state.sender = None;
            state.regions.clear();
            state.tracker.reset();
        }
        Ok(())
    }
}

/// Runs the grace-timer task for the currently registered regions.
pub struct GeofenceMonitor {
    grace: Duration,
    bus: EventBus,
    source: Arc<dyn InstantSource>,
    watcher: Arc<dyn RegionWatcher>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl GeofenceMonitor {
    pub fn new(
        grace: Duration,
        bus: EventBus,
        source: Arc<dyn InstantSource>,
        watcher: Arc<dyn RegionWatcher>,
    ) -> Self {
        Self {
            grace,
            bus,
            source,
            watcher,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Register `regions` and (re)start the monitor task. Any previous
    /// registration and its pending grace timers are discarded first.
    pub async fn start(&mut self, regions: Vec<GeofenceRegion>) -> Result<(), StudyError> {
        self.stop().await;
        if regions.is_empty() {
            return Err(StudyError::RegionRegistration {
                message: "no regions to register".into(),
            });
        }

        let rx = self.watcher.register(&regions).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let watched: HashSet<String> = regions.iter().map(|r| r.identifier.clone()).collect();

        tracing::info!(
            regions = regions.len(),
            grace_secs = self.grace.as_secs(),
            "Geofence monitor started"
        );

        self.task = Some(tokio::spawn(run_monitor(
            rx,
            shutdown_rx,
            watched,
            GraceTracker::new(self.grace),
            self.bus.clone(),
            self.source.clone(),
        )));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Stop the task and unregister. Pending grace timers are dropped.
    pub async fn stop(&mut self) {
        let was_running = self.task.is_some();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if was_running {
            if let Err(e) = self.watcher.unregister().await {
                tracing::warn!("Failed to unregister geofence regions: {}", e);
            }
            tracing::info!("Geofence monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

async fn run_monitor(
    mut rx: mpsc::Receiver<RegionTransition>,
    mut shutdown_rx: oneshot::Receiver<()>,
    watched: HashSet<String>,
    mut timers: GraceTracker,
    bus: EventBus,
    source: Arc<dyn InstantSource>,
) {
    loop {
        let next_due = timers.next_due();
        tokio::select! {
            maybe = rx.recv() => {
                let Some(transition) = maybe else {
                    tracing::info!("Region feed closed; geofence monitor exiting");
                    break;
                };
                if !watched.contains(&transition.region_id) {
                    tracing::debug!(region = %transition.region_id, "Ignoring transition for unwatched region");
                    continue;
                }
                bus.publish(BusEvent::GeofenceTransition(transition.clone()));
                match transition.kind {
                    TransitionKind::Exit => {
                        let lag = (source.now() - transition.at).to_std().unwrap_or(Duration::ZERO);
                        let replaced = timers.on_exit(&transition.region_id, transition.at, Instant::now(), lag);
                        tracing::info!(
                            region = %transition.region_id,
                            replaced,
                            "Region exit; grace period started"
                        );
                    }
                    TransitionKind::Enter => {
                        if timers.on_enter(&transition.region_id) {
                            tracing::info!(region = %transition.region_id, "Re-entered region; exit discarded");
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                for expiry in timers.take_due(Instant::now()) {
                    tracing::info!(region = %expiry.region_id, "Grace period elapsed without re-entry");
                    bus.publish(BusEvent::GeofenceExpired(expiry));
                }
            }
            _ = &mut shutdown_rx => {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualTime;
    use crate::events::Topic;
    use chrono::TimeZone;

    const GRACE: Duration = Duration::from_secs(300);

    fn wall() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
    }

    fn region() -> GeofenceRegion {
        GeofenceRegion {
            identifier: "location-1".into(),
            latitude: 33.2098,
            longitude: -87.5692,
            radius_m: 100.0,
        }
    }

    fn transition(kind: TransitionKind) -> RegionTransition {
        RegionTransition {
            region_id: "location-1".into(),
            kind,
            at: wall(),
        }
    }

    #[test]
    fn test_grace_enter_cancels_exit() {
        let mut timers = GraceTracker::new(GRACE);
        let now = Instant::now();
        assert!(!timers.on_exit("r", wall(), now, Duration::ZERO));
        assert!(timers.on_enter("r"));
        assert!(timers.take_due(now + GRACE * 2).is_empty());
        assert!(!timers.on_enter("r"));
    }

    #[test]
    fn test_grace_exit_replaces_previous_timer() {
        let mut timers = GraceTracker::new(GRACE);
        let start = Instant::now();
        timers.on_exit("r", wall(), start, Duration::ZERO);
        let later = wall() + chrono::Duration::seconds(100);
        assert!(timers.on_exit("r", later, start + Duration::from_secs(100), Duration::ZERO));
        assert_eq!(timers.pending_count(), 1);

        assert!(timers.take_due(start + GRACE).is_empty());
        let fired = timers.take_due(start + Duration::from_secs(400));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].exit_at, later);
        assert_eq!(fired[0].deadline, later + chrono::Duration::seconds(300));
        assert!(timers.take_due(start + Duration::from_secs(10_000)).is_empty());
    }

    #[test]
    fn test_grace_accounts_for_delivery_lag() {
        let mut timers = GraceTracker::new(GRACE);
        let start = Instant::now();
        timers.on_exit("r", wall(), start, Duration::from_secs(200));
        assert_eq!(timers.next_due(), Some(start + Duration::from_secs(100)));
    }

    struct Harness {
        watcher: Arc<ChannelRegionWatcher>,
        monitor: GeofenceMonitor,
        expiries: Arc<Mutex<Vec<(GraceExpiry, Instant)>>>,
        transitions: Arc<Mutex<Vec<RegionTransition>>>,
    }

    fn harness() -> Harness {
        let bus = EventBus::new();
        let expiries = Arc::new(Mutex::new(Vec::new()));
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = expiries.clone();
        bus.subscribe(Topic::GeofenceExpired, move |event| {
            if let BusEvent::GeofenceExpired(expiry) = event {
                sink.lock().unwrap().push((expiry.clone(), Instant::now()));
            }
            Ok(())
        });
        let sink = transitions.clone();
        bus.subscribe(Topic::GeofenceTransition, move |event| {
            if let BusEvent::GeofenceTransition(t) = event {
                sink.lock().unwrap().push(t.clone());
            }
            Ok(())
        });
        let watcher = Arc::new(ChannelRegionWatcher::new());
        let monitor = GeofenceMonitor::new(
            GRACE,
            bus,
            Arc::new(ManualTime::new(wall())),
            watcher.clone(),
        );
        Harness {
            watcher,
            monitor,
            expiries,
            transitions,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentry_within_grace_discards_exit() {
        let mut h = harness();
        h.monitor.start(vec![region()]).await.unwrap();

        assert!(h.watcher.inject(transition(TransitionKind::Exit)));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.watcher.inject(transition(TransitionKind::Enter)));
        tokio::time::sleep(Duration::from_secs(1000)).await;

        assert!(h.expiries.lock().unwrap().is_empty());
        assert_eq!(h.transitions.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redundant_exits_fire_once_at_latest_deadline() {
        let mut h = harness();
        h.monitor.start(vec![region()]).await.unwrap();
        let started = Instant::now();

        for _ in 0..3 {
            assert!(h.watcher.inject(transition(TransitionKind::Exit)));
            tokio::time::sleep(Duration::from_secs(100)).await;
        }
        tokio::time::sleep(Duration::from_secs(1000)).await;

        let expiries = h.expiries.lock().unwrap();
        assert_eq!(expiries.len(), 1);
        let fired_after = expiries[0].1 - started;
        assert_eq!(fired_after.as_secs(), 500);
        assert_eq!(expiries[0].0.region_id, "location-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatched_regions_are_ignored() {
        let mut h = harness();
        h.monitor.start(vec![region()]).await.unwrap();
        let mut other = transition(TransitionKind::Exit);
        other.region_id = "location-9".into();
        h.watcher.inject(other);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(h.expiries.lock().unwrap().is_empty());
        assert!(h.transitions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drops_pending_timers_and_restart_works() {
        let mut h = harness();
        h.monitor.start(vec![region()]).await.unwrap();
        h.watcher.inject(transition(TransitionKind::Exit));
        tokio::time::sleep(Duration::from_secs(10)).await;
        h.monitor.stop().await;
        assert!(!h.monitor.is_running());
        assert!(h.watcher.registered_regions().is_empty());
        assert!(!h.watcher.inject(transition(TransitionKind::Exit)));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(h.expiries.lock().unwrap().is_empty());

        h.monitor.start(vec![region()]).await.unwrap();
        assert!(h.monitor.is_running());
        assert!(h.watcher.inject(transition(TransitionKind::Exit)));
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(h.expiries.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_fixes_drive_transitions() {
        let mut h = harness();
        h.monitor.start(vec![region()]).await.unwrap();
        // Registration assumes presence: a first fix inside is not news.
        assert_eq!(h.watcher.observe_fix(33.2098, -87.5692, wall()), 0);
        assert_eq!(h.watcher.observe_fix(33.2300, -87.5692, wall()), 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.watcher.observe_fix(33.2098, -87.5692, wall()), 1);
        tokio::time::sleep(Duration::from_secs(600)).await;
        let kinds: Vec<TransitionKind> = h.transitions.lock().unwrap().iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TransitionKind::Exit, TransitionKind::Enter]);
        assert!(h.expiries.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fix_outside_after_registration_expires() {
        let mut h = harness();
        h.monitor.start(vec![region()]).await.unwrap();
        assert_eq!(h.watcher.observe_fix(33.2300, -87.5692, wall()), 1);
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(h.expiries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_feed_drops_transition_but_stays_registered() {
        let watcher = ChannelRegionWatcher::new();
        assert!(!watcher.is_registered());
        let _rx = watcher.register(&[region()]).await.unwrap();
        for _ in 0..TRANSITION_BUFFER {
            assert!(watcher.inject(transition(TransitionKind::Exit)));
        }
        assert!(!watcher.inject(transition(TransitionKind::Exit)));
        assert!(watcher.is_registered());

        watcher.unregister().await.unwrap();
        assert!(!watcher.is_registered());
    }

    #[tokio::test]
    async fn test_start_without_regions_fails() {
        let mut h = harness();
        assert!(matches!(
            h.monitor.start(Vec::new()).await,
            Err(StudyError::RegionRegistration { .. })
        ));
        assert!(!h.monitor.is_running());
    }
}
