// src/events.rs - In-process event bus
//
// The only coupling between the geofence task, the session tracker and
// observers (CLI output, unauthorized handling). Publishing is synchronous and
// runs handlers in subscription order. A failing or panicking handler is
// logged and skipped; it never reaches the publisher.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::core::machine::ClockOutReason;
use crate::core::types::{ActiveSession, SessionState};
use crate::geofence::{GraceExpiry, RegionTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    GeofenceTransition,
    GeofenceExpired,
    ClockIn,
    ClockOut,
    StateChanged,
    ClockTick,
    DashboardRefreshed,
    Unauthorized,
    CommandFailed,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeofenceTransition => "geofence_transition",
            Self::GeofenceExpired => "geofence_expired",
            Self::ClockIn => "clock_in",
            Self::ClockOut => "clock_out",
            Self::StateChanged => "state_changed",
            Self::ClockTick => "clock_tick",
            Self::DashboardRefreshed => "dashboard_refreshed",
            Self::Unauthorized => "unauthorized",
            Self::CommandFailed => "command_failed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload published on the bus. Each variant belongs to exactly one topic.
#[derive(Debug, Clone)]
pub enum BusEvent {
    GeofenceTransition(RegionTransition),
    GeofenceExpired(GraceExpiry),
    ClockIn(ActiveSession),
    ClockOut {
        session_id: i64,
        reason: ClockOutReason,
    },
    StateChanged(SessionState),
    ClockTick {
        elapsed: Duration,
    },
    DashboardRefreshed {
        sessions: usize,
    },
    Unauthorized,
    CommandFailed {
        command: String,
        message: String,
    },
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::GeofenceTransition(_) => Topic::GeofenceTransition,
            Self::GeofenceExpired(_) => Topic::GeofenceExpired,
            Self::ClockIn(_) => Topic::ClockIn,
            Self::ClockOut { .. } => Topic::ClockOut,
            Self::StateChanged(_) => Topic::StateChanged,
            Self::ClockTick { .. } => Topic::ClockTick,
            Self::DashboardRefreshed { .. } => Topic::DashboardRefreshed,
            Self::Unauthorized => Topic::Unauthorized,
            Self::CommandFailed { .. } => Topic::CommandFailed,
        }
    }
}

pub type Handler = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

struct Entry {
    id: u64,
    topic: Topic,
    handler: Handler,
}

struct Inner {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Cheap to clone; all clones share the same subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register `handler` for `topic`. Dropping the returned value does not
    /// unsubscribe; call [`Subscription::unsubscribe`].
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.push(Entry {
                id,
                topic,
                handler: Arc::new(handler),
            });
        }
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver `event` to every current subscriber of its topic.
    ///
    /// Handlers run outside the subscriber lock, so a handler may itself
    /// subscribe, unsubscribe or publish. Returns the number of handlers that
    /// completed without error.
    pub fn publish(&self, event: BusEvent) -> usize {
        if self.inner.closed.load(Ordering::Acquire) {
            return 0;
        }
        let topic = event.topic();
        let handlers: Vec<Handler> = match self.inner.entries.lock() {
            Ok(entries) => entries
                .iter()
                .filter(|e| e.topic == topic)
                .map(|e| e.handler.clone())
                .collect(),
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(topic = %topic, "Event handler failed: {}", e);
                }
                Err(_) => {
                    tracing::warn!(topic = %topic, "Event handler panicked");
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .entries
            .lock()
            .map(|entries| entries.iter().filter(|e| e.topic == topic).count())
            .unwrap_or(0)
    }

    /// Remove all subscriptions for one topic.
    pub fn clear(&self, topic: Topic) {
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.retain(|e| e.topic != topic);
        }
    }

    pub fn clear_all(&self) {
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.clear();
        }
    }

    /// Tear down: drop every subscriber and ignore further publishes.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.clear_all();
    }
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    bus: Weak<Inner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            if let Ok(mut entries) = inner.entries.lock() {
                entries.retain(|e| e.id != self.id);
            }
        }
    }
}
