// src/core/clock.rs - Elapsed-time clock for the active study session
//
// Elapsed time is always recomputed from absolute instants
// (`now - anchor + accumulated`), never by counting ticks, so the value is
// correct after any suspension of the ticker.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::events::{BusEvent, EventBus};
use crate::infra::errors::StudyError;

/// Reference instants later than `now` by up to this much are treated as
/// clock skew between device and server, not as malformed.
const FUTURE_SKEW_TOLERANCE: Duration = Duration::from_secs(30);

/// Source of "now". Injected so tests can drive time explicitly.
pub trait InstantSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTime;

impl InstantSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven instant source.
#[derive(Debug)]
pub struct ManualTime {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTime {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = instant;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }
}

impl InstantSource for ManualTime {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

pub struct Clock {
    source: Arc<dyn InstantSource>,
    /// Instant the current run is measured from; `None` while stopped.
    anchor: Option<DateTime<Utc>>,
    /// Elapsed time banked by earlier runs.
    accumulated: Duration,
}

impl Clock {
    pub fn new(source: Arc<dyn InstantSource>) -> Self {
        Self {
            source,
            anchor: None,
            accumulated: Duration::ZERO,
        }
    }

    /// Start counting.
    ///
    /// With `reference`, elapsed time restarts as `now - reference`, which is
    /// how the clock resynchronises with a server-recorded session start.
    /// Without it, counting resumes on top of whatever was accumulated.
    /// A malformed reference is rejected and the clock keeps its state.
    pub fn start(&mut self, reference: Option<DateTime<Utc>>) -> Result<(), StudyError> {
        let now = self.source.now();
        match reference {
            Some(instant) => {
                validate_reference(instant, now)?;
                self.anchor = Some(instant.min(now));
                self.accumulated = Duration::ZERO;
            }
            None => {
                if self.anchor.is_none() {
                    self.anchor = Some(now);
                }
            }
        }
        Ok(())
    }

    /// Freeze the elapsed value.
    pub fn stop(&mut self) {
        if self.anchor.is_some() {
            self.accumulated = self.elapsed();
            self.anchor = None;
        }
    }

    pub fn reset(&mut self) {
        self.anchor = None;
        self.accumulated = Duration::ZERO;
    }

    pub fn elapsed(&self) -> Duration {
        match self.anchor {
            Some(anchor) => {
                let run = (self.source.now() - anchor)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                run + self.accumulated
            }
            None => self.accumulated,
        }
    }

    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

}

fn validate_reference(instant: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), StudyError> {
    if instant.timestamp() < 0 {
        return Err(StudyError::InvalidInstant {
            message: format!("start instant {instant} precedes the epoch"),
        });
    }
    let skew = chrono::Duration::from_std(FUTURE_SKEW_TOLERANCE).unwrap_or_else(|_| chrono::Duration::zero());
    if instant > now + skew {
        return Err(StudyError::InvalidInstant {
            message: format!("start instant {instant} is in the future"),
        });
    }
    Ok(())
}

/// Render a duration as `HH:MM:SS`. Hours do not wrap at 24.
pub fn format_hms(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Publishes `ClockTick` on a fixed period while active.
///
/// Paused while the host is backgrounded so no wake-ups are spent; the value
/// published after resuming is recomputed from instants, not from a counter.
#[derive(Default)]
pub struct ClockTicker {
    task: Option<JoinHandle<()>>,
}

impl ClockTicker {
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Start (or restart) ticking. Must be called inside a tokio runtime.
    pub fn resume(&mut self, clock: Arc<Mutex<Clock>>, bus: EventBus, period: Duration) {
        self.pause();
        let period = period.max(Duration::from_secs(1));
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let elapsed = match clock.lock() {
                    Ok(clock) if clock.is_running() => clock.elapsed(),
                    Ok(_) => continue,
                    Err(_) => break,
                };
                bus.publish(BusEvent::ClockTick { elapsed });
            }
        }));
    }

    pub fn pause(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ClockTicker {
    fn drop(&mut self) {
        self.pause();
    }
}
