// src/core/machine.rs - Session state machine
//
// Pure reducer: every input returns the effects the owner must carry out
// (issue a server command, drive the clock, (un)register regions, publish).
// Billing-relevant transitions (anything ending in Idle, and entering
// Studying) happen only when a server round trip confirms them. Server data
// is the source of truth; geofence and clock state are derived from it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::core::types::{ActiveSession, DashboardSnapshot, SessionState, StudySession};
use crate::events::BusEvent;
use crate::geofence::{GraceExpiry, RegionTransition, TransitionKind};
use crate::infra::errors::StudyError;

/// Server start instants later than the local clock by more than this are
/// treated as malformed.
const MAX_START_SKEW: Duration = Duration::from_secs(30);

/// Backoff for re-issuing an automatic clock-out that failed.
const EXPIRY_RETRY_BASE: Duration = Duration::from_secs(5);
const EXPIRY_RETRY_MAX: Duration = Duration::from_secs(120);

pub type Ticket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOutReason {
    Manual,
    GeofenceExpired,
    /// Closed by the server outside this client (admin edit, other device).
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ClockIn { location_id: i64 },
    ClockOut { reason: ClockOutReason },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClockIn { .. } => "clock_in",
            Self::ClockOut { .. } => "clock_out",
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    ticket: Ticket,
    command: Command,
}

/// A grace expiry whose automatic clock-out the server has not confirmed.
/// Only honoured while the state is still the grace period it came from.
#[derive(Debug, Clone)]
struct OwedExpiry {
    region_id: String,
    exit_at: DateTime<Utc>,
    attempts: u32,
    retry_scheduled: bool,
}

/// Work the owner of the machine must perform, in order.
#[derive(Debug, Clone)]
pub enum Effect {
    IssueClockIn { ticket: Ticket, location_id: i64 },
    IssueClockOut { ticket: Ticket, reason: ClockOutReason },
    /// Resynchronise the clock to a server-recorded start.
    StartClock(DateTime<Utc>),
    /// Stop and zero the clock.
    StopClock,
    WatchRegions { location_id: i64 },
    UnwatchRegions,
    Publish(BusEvent),
    SignalUnauthorized,
    RequestRebuild,
    /// Call `retry_owed_clock_out` after the delay.
    ScheduleClockOutRetry(Duration),
}

/// Outcome of scanning the server session list.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSessionSelection<'a> {
    pub open: Option<&'a StudySession>,
    pub anomalies: Vec<String>,
}

/// Pick the in-progress session, if any.
///
/// The most recent session by start instant decides: open means studying.
/// Several open sessions violate the one-open-session invariant; the latest
/// one wins and the anomaly is reported. Ties on start instant go to the
/// later list entry.
pub fn select_open_session(sessions: &[StudySession]) -> OpenSessionSelection<'_> {
    let mut anomalies = Vec::new();
    let latest = sessions
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.start_time.cmp(&b.start_time).then(ia.cmp(ib)))
        .map(|(_, s)| s);
    let open: Vec<&StudySession> = sessions.iter().filter(|s| s.is_open()).collect();

    if open.len() > 1 {
        let ids: Vec<String> = open.iter().map(|s| s.id.to_string()).collect();
        anomalies.push(format!(
            "{} sessions in progress at once (ids {})",
            open.len(),
            ids.join(", ")
        ));
    }

    let chosen = match latest {
        Some(latest) if latest.is_open() => Some(latest),
        Some(latest) => {
            if let Some(stale) = open.first() {
                anomalies.push(format!(
                    "session {} is in progress but newer session {} is closed",
                    stale.id, latest.id
                ));
            }
            None
        }
        None => None,
    };

    OpenSessionSelection {
        open: chosen,
        anomalies,
    }
}

pub struct SessionMachine {
    state: SessionState,
    revision: u64,
    pending: Option<Pending>,
    next_ticket: Ticket,
    grace: Duration,
    auto_clock_out: bool,
    owed_expiry: Option<OwedExpiry>,
}

impl SessionMachine {
    pub fn new(grace: Duration) -> Self {
        Self {
            state: SessionState::Idle,
            revision: 0,
            pending: None,
            next_ticket: 1,
            grace,
            auto_clock_out: true,
            owed_expiry: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Incremented on every state change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn pending_command(&self) -> Option<&Command> {
        self.pending.as_ref().map(|p| &p.command)
    }

    pub fn pending_ticket(&self) -> Option<Ticket> {
        self.pending.as_ref().map(|p| p.ticket)
    }

    /// False after region registration failed: only manual clock-out applies.
    pub fn auto_clock_out(&self) -> bool {
        self.auto_clock_out
    }

    /// True while an elapsed grace period still awaits its clock-out.
    pub fn clock_out_owed(&self) -> bool {
        match (&self.owed_expiry, &self.state) {
            (Some(owed), SessionState::GraceWaitingForReentry { region_id, exit_at, .. }) => {
                owed.region_id == *region_id && owed.exit_at == *exit_at
            }
            _ => false,
        }
    }

    fn issue(&mut self, command: Command) -> Ticket {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending = Some(Pending { ticket, command });
        ticket
    }

    fn set_state(&mut self, next: SessionState, effects: &mut Vec<Effect>) {
        if self.state != next {
            tracing::info!(from = %self.state, to = %next, "Session state changed");
            if !matches!(next, SessionState::GraceWaitingForReentry { .. }) {
                self.owed_expiry = None;
            }
            self.state = next;
            self.revision += 1;
            effects.push(Effect::Publish(BusEvent::StateChanged(self.state.clone())));
        }
    }

    fn take_pending(&mut self, ticket: Ticket) -> Option<Pending> {
        match &self.pending {
            Some(p) if p.ticket == ticket => self.pending.take(),
            _ => None,
        }
    }

    // ── User commands ──────────────────────────────────────────────────────

    pub fn request_clock_in(&mut self, location_id: i64) -> Result<Vec<Effect>, StudyError> {
        if let Some(p) = &self.pending {
            return Err(StudyError::rejected(format!(
                "{} already in flight",
                p.command.name()
            )));
        }
        if self.state.is_open() {
            return Err(StudyError::rejected("already clocked in"));
        }
        let ticket = self.issue(Command::ClockIn { location_id });
        Ok(vec![Effect::IssueClockIn {
            ticket,
            location_id,
        }])
    }

    pub fn request_clock_out(&mut self, reason: ClockOutReason) -> Result<Vec<Effect>, StudyError> {
        if let Some(p) = &self.pending {
            return Err(StudyError::rejected(format!(
                "{} already in flight",
                p.command.name()
            )));
        }
        if !self.state.is_open() {
            return Err(StudyError::rejected("not clocked in"));
        }
        let ticket = self.issue(Command::ClockOut { reason });
        Ok(vec![Effect::IssueClockOut { ticket, reason }])
    }

    // ── Server completions ─────────────────────────────────────────────────

    /// Clock-in accepted by the server. `snapshot` is the dashboard fetched
    /// right after; without it the start instant is unknown, so a rebuild is
    /// requested instead of inventing one.
    pub fn clock_in_succeeded(
        &mut self,
        ticket: Ticket,
        snapshot: Option<&DashboardSnapshot>,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        if self.take_pending(ticket).is_none() {
            tracing::debug!(ticket, "Ignoring completion for stale clock-in");
            return snapshot.map(|s| self.rebuild(s, now)).unwrap_or_default();
        }
        let Some(snapshot) = snapshot else {
            return vec![Effect::RequestRebuild];
        };

        let mut effects = self.rebuild(snapshot, now);
        match self.state.active_session() {
            Some(active) => effects.push(Effect::Publish(BusEvent::ClockIn(active.clone()))),
            None => tracing::warn!("Server accepted clock-in but reports no session in progress"),
        }
        effects
    }

    /// Clock-out accepted by the server.
    pub fn clock_out_succeeded(
        &mut self,
        ticket: Ticket,
        snapshot: Option<&DashboardSnapshot>,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        let Some(pending) = self.take_pending(ticket) else {
            tracing::debug!(ticket, "Ignoring completion for stale clock-out");
            return snapshot.map(|s| self.rebuild(s, now)).unwrap_or_default();
        };
        let reason = match pending.command {
            Command::ClockOut { reason } => reason,
            Command::ClockIn { .. } => ClockOutReason::Manual,
        };
        let closed = self.state.active_session().map(|a| a.session_id);

        let mut effects = match snapshot {
            Some(snapshot) => self.reconcile(snapshot, now, false),
            None => {
                let mut effects = vec![Effect::StopClock, Effect::UnwatchRegions];
                self.set_state(SessionState::Idle, &mut effects);
                effects.push(Effect::RequestRebuild);
                effects
            }
        };

        match (closed, self.state.is_open()) {
            (Some(session_id), false) => {
                effects.push(Effect::Publish(BusEvent::ClockOut { session_id, reason }));
            }
            (_, true) => {
                tracing::warn!("Server accepted clock-out but still reports a session in progress");
            }
            (None, false) => {}
        }
        effects
    }

    /// A command failed. State stays as it was before the command; the error
    /// is surfaced, and an unauthorized failure is escalated.
    pub fn command_failed(&mut self, ticket: Ticket, error: &StudyError) -> Vec<Effect> {
        let Some(pending) = self.take_pending(ticket) else {
            return Vec::new();
        };
        tracing::warn!(command = pending.command.name(), "Command failed: {}", error);

        let mut effects = vec![Effect::Publish(BusEvent::CommandFailed {
            command: pending.command.name().to_string(),
            message: error.to_string(),
        })];
        match error {
            StudyError::Unauthorized => effects.push(Effect::SignalUnauthorized),
            // The server disagrees with our view (double clock-in/out).
            StudyError::Rejected { .. } => effects.push(Effect::RequestRebuild),
            _ => {}
        }

        // An elapsed grace period still needs its clock-out. A manual attempt
        // that lost the race hands over immediately; a failed automatic one
        // backs off.
        if self.clock_out_owed() && !error.is_unauthorized() {
            let automatic = matches!(
                pending.command,
                Command::ClockOut {
                    reason: ClockOutReason::GeofenceExpired
                }
            );
            if automatic {
                effects.extend(self.schedule_owed_retry());
            } else {
                effects.extend(self.issue_owed_clock_out());
            }
        }
        effects
    }

    // ── Geofence signals ───────────────────────────────────────────────────

    pub fn region_transition(&mut self, transition: &RegionTransition) -> Vec<Effect> {
        let mut effects = Vec::new();
        let next = match (&self.state, transition.kind) {
            (SessionState::Studying(active), TransitionKind::Exit)
                if active.region_id().as_deref() == Some(transition.region_id.as_str()) =>
            {
                Some(self.grace_state(active.clone(), transition))
            }
            (SessionState::GraceWaitingForReentry { session, region_id, .. }, TransitionKind::Exit)
                if *region_id == transition.region_id =>
            {
                Some(self.grace_state(session.clone(), transition))
            }
            (SessionState::GraceWaitingForReentry { session, region_id, .. }, TransitionKind::Enter)
                if *region_id == transition.region_id =>
            {
                Some(SessionState::Studying(session.clone()))
            }
            _ => None,
        };
        if let Some(next) = next {
            self.set_state(next, &mut effects);
        }
        effects
    }

    fn grace_state(&self, session: ActiveSession, transition: &RegionTransition) -> SessionState {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::zero());
        SessionState::GraceWaitingForReentry {
            session,
            region_id: transition.region_id.clone(),
            exit_at: transition.at,
            deadline: transition.at + grace,
        }
    }

    /// Grace period elapsed. Only the expiry matching the latest exit counts;
    /// it issues the automatic clock-out, or leaves it owed while another
    /// command is in flight. The state stays in grace until the server
    /// confirms.
    pub fn grace_expired(&mut self, expiry: &GraceExpiry) -> Vec<Effect> {
        let matches = matches!(
            &self.state,
            SessionState::GraceWaitingForReentry { region_id, exit_at, .. }
                if *region_id == expiry.region_id && *exit_at == expiry.exit_at
        );
        if !matches {
            tracing::debug!(region = %expiry.region_id, "Ignoring stale grace expiry");
            return Vec::new();
        }
        if !self.auto_clock_out {
            tracing::info!("Grace expired but automatic clock-out is disabled");
            return Vec::new();
        }
        if !self.clock_out_owed() {
            self.owed_expiry = Some(OwedExpiry {
                region_id: expiry.region_id.clone(),
                exit_at: expiry.exit_at,
                attempts: 0,
                retry_scheduled: false,
            });
        }
        if let Some(p) = &self.pending {
            tracing::info!(
                command = p.command.name(),
                "Grace expired while a command is in flight; clock-out deferred"
            );
            return Vec::new();
        }
        self.issue_owed_clock_out()
    }

    /// The backoff timer for an owed clock-out fired.
    pub fn retry_owed_clock_out(&mut self) -> Vec<Effect> {
        if let Some(owed) = self.owed_expiry.as_mut() {
            owed.retry_scheduled = false;
        }
        if self.pending.is_some() {
            return Vec::new();
        }
        self.issue_owed_clock_out()
    }

    fn issue_owed_clock_out(&mut self) -> Vec<Effect> {
        if !self.clock_out_owed() || !self.auto_clock_out {
            return Vec::new();
        }
        match self.request_clock_out(ClockOutReason::GeofenceExpired) {
            Ok(effects) => effects,
            Err(e) => {
                tracing::debug!("Owed clock-out not issued: {}", e);
                Vec::new()
            }
        }
    }

    fn schedule_owed_retry(&mut self) -> Vec<Effect> {
        let owed_live = self.clock_out_owed();
        let Some(owed) = self.owed_expiry.as_mut().filter(|o| owed_live && !o.retry_scheduled) else {
            return Vec::new();
        };
        let delay = EXPIRY_RETRY_BASE
            .saturating_mul(2u32.saturating_pow(owed.attempts))
            .min(EXPIRY_RETRY_MAX);
        owed.attempts = owed.attempts.saturating_add(1);
        owed.retry_scheduled = true;
        tracing::info!(delay_secs = delay.as_secs(), "Automatic clock-out will be retried");
        vec![Effect::ScheduleClockOutRetry(delay)]
    }

    /// Region registration failed: fall back to manual clock-out.
    pub fn regions_unavailable(&mut self, error: &StudyError) -> Vec<Effect> {
        self.auto_clock_out = false;
        vec![Effect::Publish(BusEvent::CommandFailed {
            command: "watch_regions".into(),
            message: error.to_string(),
        })]
    }

    pub fn regions_available(&mut self) {
        self.auto_clock_out = true;
    }

    // ── Reconciliation ─────────────────────────────────────────────────────

    /// Rebuild from authoritative server data.
    ///
    /// An in-progress grace period for the same session survives, since it
    /// reflects local geofence events the server does not know about.
    pub fn rebuild(&mut self, snapshot: &DashboardSnapshot, now: DateTime<Utc>) -> Vec<Effect> {
        let closing_here = matches!(self.pending_command(), Some(Command::ClockOut { .. }));
        self.reconcile(snapshot, now, !closing_here)
    }

    fn reconcile(
        &mut self,
        snapshot: &DashboardSnapshot,
        now: DateTime<Utc>,
        announce_remote_close: bool,
    ) -> Vec<Effect> {
        let selection = select_open_session(&snapshot.user_sessions);
        for anomaly in &selection.anomalies {
            tracing::warn!(anomaly = %anomaly, "Dashboard data inconsistency");
        }

        let open = selection.open.filter(|session| {
            let skew = chrono::Duration::from_std(MAX_START_SKEW).unwrap_or_else(|_| chrono::Duration::zero());
            let valid = session.start_time.timestamp() >= 0 && session.start_time <= now + skew;
            if !valid {
                tracing::warn!(
                    session = session.id,
                    start = %session.start_time,
                    "Ignoring in-progress session with malformed start instant"
                );
            }
            valid
        });

        let previous = self.state.active_session().map(|a| a.session_id);
        let mut effects = Vec::new();

        match open {
            Some(session) => {
                let active = ActiveSession::from_session(session);
                let next = match &self.state {
                    SessionState::GraceWaitingForReentry {
                        session: current,
                        region_id,
                        exit_at,
                        deadline,
                    } if current.session_id == active.session_id => {
                        SessionState::GraceWaitingForReentry {
                            session: active.clone(),
                            region_id: region_id.clone(),
                            exit_at: *exit_at,
                            deadline: *deadline,
                        }
                    }
                    _ => SessionState::Studying(active.clone()),
                };
                effects.push(Effect::StartClock(active.started_at));
                if let Some(location_id) = active.location_id {
                    effects.push(Effect::WatchRegions { location_id });
                } else {
                    effects.push(Effect::UnwatchRegions);
                }
                self.set_state(next, &mut effects);
                // After an unauthorized failure nothing else re-arms the
                // owed clock-out; a successful refresh does.
                if self.pending.is_none() {
                    effects.extend(self.schedule_owed_retry());
                }
            }
            None => {
                effects.push(Effect::StopClock);
                effects.push(Effect::UnwatchRegions);
                self.set_state(SessionState::Idle, &mut effects);
                if let (Some(session_id), true) = (previous, announce_remote_close) {
                    effects.push(Effect::Publish(BusEvent::ClockOut {
                        session_id,
                        reason: ClockOutReason::Remote,
                    }));
                }
            }
        }
        effects
    }

    /// Clock and machine must agree on whether a session is open.
    pub fn check_consistency(&self, clock_running: bool) -> Option<Effect> {
        if clock_running != self.state.is_open() {
            tracing::warn!(
                clock_running,
                state = %self.state,
                "Clock and session state diverged; rebuilding"
            );
            return Some(Effect::RequestRebuild);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const GRACE: Duration = Duration::from_secs(300);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn session(id: i64, start: i64, hours: Option<f64>) -> StudySession {
        StudySession {
            id,
            start_time: at(start),
            hours,
            location: Some(3),
            period_instance: None,
        }
    }

    fn snapshot(sessions: Vec<StudySession>) -> DashboardSnapshot {
        DashboardSnapshot {
            user_sessions: sessions,
            ..Default::default()
        }
    }

    fn transition(kind: TransitionKind, secs: i64) -> RegionTransition {
        RegionTransition {
            region_id: "location-3".into(),
            kind,
            at: at(secs),
        }
    }

    fn studying_machine() -> SessionMachine {
        let mut m = SessionMachine::new(GRACE);
        m.rebuild(&snapshot(vec![session(7, 0, None)]), at(60));
        assert!(matches!(m.state(), SessionState::Studying(_)));
        m
    }

    fn issued_clock_out(effects: &[Effect]) -> Option<(Ticket, ClockOutReason)> {
        effects.iter().find_map(|e| match e {
            Effect::IssueClockOut { ticket, reason } => Some((*ticket, *reason)),
            _ => None,
        })
    }

    #[test]
    fn test_select_last_open_session() {
        let sessions = vec![session(1, 0, Some(1.0)), session(2, 100, None)];
        let sel = select_open_session(&sessions);
        assert_eq!(sel.open.map(|s| s.id), Some(2));
        assert!(sel.anomalies.is_empty());
    }

    #[test]
    fn test_select_idle_when_last_closed() {
        let sessions = vec![session(1, 0, Some(1.0)), session(2, 100, Some(2.0))];
        assert!(select_open_session(&sessions).open.is_none());
        assert!(select_open_session(&[]).open.is_none());
    }

    #[test]
    fn test_select_two_open_prefers_later_start() {
        let sessions = vec![session(5, 500, None), session(4, 100, None)];
        let sel = select_open_session(&sessions);
        assert_eq!(sel.open.map(|s| s.id), Some(5));
        assert_eq!(sel.anomalies.len(), 1);
    }

    #[test]
    fn test_select_open_but_superseded_is_idle() {
        let sessions = vec![session(1, 0, None), session(2, 100, Some(1.0))];
        let sel = select_open_session(&sessions);
        assert!(sel.open.is_none());
        assert_eq!(sel.anomalies.len(), 1);
    }

    #[test]
    fn test_rebuild_studying_uses_server_start() {
        let mut m = SessionMachine::new(GRACE);
        let effects = m.rebuild(&snapshot(vec![session(1, 0, Some(1.0)), session(2, 100, None)]), at(500));
        assert_eq!(
            m.state(),
            &SessionState::Studying(ActiveSession {
                session_id: 2,
                started_at: at(100),
                location_id: Some(3),
            })
        );
        assert!(matches!(effects[0], Effect::StartClock(t) if t == at(100)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::WatchRegions { location_id: 3 })));
        assert_eq!(m.revision(), 1);
    }

    #[test]
    fn test_rebuild_rejects_future_start() {
        let mut m = SessionMachine::new(GRACE);
        m.rebuild(&snapshot(vec![session(1, 10_000, None)]), at(0));
        assert_eq!(m.state(), &SessionState::Idle);
    }

    #[test]
    fn test_rebuild_closed_elsewhere_publishes_remote_clock_out() {
        let mut m = studying_machine();
        let effects = m.rebuild(&snapshot(vec![session(7, 0, Some(0.5))]), at(1800));
        assert_eq!(m.state(), &SessionState::Idle);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Publish(BusEvent::ClockOut { session_id: 7, reason: ClockOutReason::Remote })
        )));
        assert!(effects.iter().any(|e| matches!(e, Effect::StopClock)));
    }

    #[test]
    fn test_clock_in_confirmed_only_after_server() {
        let mut m = SessionMachine::new(GRACE);
        let effects = m.request_clock_in(3).unwrap();
        let ticket = match effects[0] {
            Effect::IssueClockIn { ticket, location_id: 3 } => ticket,
            ref other => panic!("unexpected effect {other:?}"),
        };
        assert_eq!(m.state(), &SessionState::Idle);
        assert!(m.request_clock_in(3).is_err());

        let effects = m.clock_in_succeeded(ticket, Some(&snapshot(vec![session(9, 0, None)])), at(5));
        assert!(matches!(m.state(), SessionState::Studying(a) if a.session_id == 9));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Publish(BusEvent::ClockIn(a)) if a.session_id == 9)));
        assert!(m.pending_command().is_none());
    }

    #[test]
    fn test_clock_in_without_snapshot_requests_rebuild() {
        let mut m = SessionMachine::new(GRACE);
        let ticket = match m.request_clock_in(3).unwrap()[0] {
            Effect::IssueClockIn { ticket, .. } => ticket,
            _ => unreachable!(),
        };
        let effects = m.clock_in_succeeded(ticket, None, at(0));
        assert_eq!(m.state(), &SessionState::Idle);
        assert!(matches!(effects.as_slice(), [Effect::RequestRebuild]));
    }

    #[test]
    fn test_clock_in_rejected_when_studying() {
        let mut m = studying_machine();
        assert!(matches!(m.request_clock_in(3), Err(StudyError::Rejected { .. })));
    }

    #[test]
    fn test_exit_enter_within_grace_returns_to_studying() {
        let mut m = studying_machine();
        m.region_transition(&transition(TransitionKind::Exit, 100));
        match m.state() {
            SessionState::GraceWaitingForReentry { exit_at, deadline, .. } => {
                assert_eq!(*exit_at, at(100));
                assert_eq!(*deadline, at(400));
            }
            other => panic!("unexpected state {other:?}"),
        }
        m.region_transition(&transition(TransitionKind::Enter, 220));
        assert!(matches!(m.state(), SessionState::Studying(a) if a.session_id == 7));
    }

    #[test]
    fn test_transitions_for_other_regions_ignored() {
        let mut m = studying_machine();
        let mut other = transition(TransitionKind::Exit, 100);
        other.region_id = "location-99".into();
        assert!(m.region_transition(&other).is_empty());
        assert!(matches!(m.state(), SessionState::Studying(_)));
    }

    #[test]
    fn test_expiry_issues_single_clock_out() {
        let mut m = studying_machine();
        m.region_transition(&transition(TransitionKind::Exit, 100));
        let expiry = GraceExpiry {
            region_id: "location-3".into(),
            exit_at: at(100),
            deadline: at(400),
        };
        let effects = m.grace_expired(&expiry);
        assert_eq!(
            issued_clock_out(&effects).map(|(_, r)| r),
            Some(ClockOutReason::GeofenceExpired)
        );
        // State stays in grace until the server confirms.
        assert!(matches!(m.state(), SessionState::GraceWaitingForReentry { .. }));
        // A duplicate expiry while the clock-out is in flight does nothing.
        assert!(m.grace_expired(&expiry).is_empty());
    }

    #[test]
    fn test_stale_expiry_ignored() {
        let mut m = studying_machine();
        m.region_transition(&transition(TransitionKind::Exit, 100));
        m.region_transition(&transition(TransitionKind::Exit, 200));
        let stale = GraceExpiry {
            region_id: "location-3".into(),
            exit_at: at(100),
            deadline: at(400),
        };
        assert!(m.grace_expired(&stale).is_empty());

        m.region_transition(&transition(TransitionKind::Enter, 250));
        let late = GraceExpiry {
            region_id: "location-3".into(),
            exit_at: at(200),
            deadline: at(500),
        };
        assert!(m.grace_expired(&late).is_empty());
    }

    fn expiry_at(exit: i64) -> GraceExpiry {
        GraceExpiry {
            region_id: "location-3".into(),
            exit_at: at(exit),
            deadline: at(exit + 300),
        }
    }

    #[test]
    fn test_expiry_during_failed_manual_clock_out_is_reissued() {
        let mut m = studying_machine();
        m.region_transition(&transition(TransitionKind::Exit, 100));
        let (manual, _) = issued_clock_out(&m.request_clock_out(ClockOutReason::Manual).unwrap()).unwrap();

        // Expiry lands while the manual clock-out is still in flight.
        assert!(m.grace_expired(&expiry_at(100)).is_empty());
        assert!(m.clock_out_owed());

        let effects = m.command_failed(manual, &StudyError::transient("HTTP 503"));
        assert_eq!(
            issued_clock_out(&effects).map(|(_, r)| r),
            Some(ClockOutReason::GeofenceExpired)
        );
        assert!(matches!(m.state(), SessionState::GraceWaitingForReentry { .. }));
    }

    #[test]
    fn test_failed_automatic_clock_out_backs_off() {
        let mut m = studying_machine();
        m.region_transition(&transition(TransitionKind::Exit, 100));
        let (first, _) = issued_clock_out(&m.grace_expired(&expiry_at(100))).unwrap();

        let effects = m.command_failed(first, &StudyError::transient("HTTP 503"));
        assert!(issued_clock_out(&effects).is_none());
        let delays: Vec<Duration> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::ScheduleClockOutRetry(d) => Some(*d),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![Duration::from_secs(5)]);

        let (second, reason) = issued_clock_out(&m.retry_owed_clock_out()).unwrap();
        assert_eq!(reason, ClockOutReason::GeofenceExpired);
        let effects = m.command_failed(second, &StudyError::transient("HTTP 503"));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleClockOutRetry(d) if *d == Duration::from_secs(10))));
    }

    #[test]
    fn test_owed_clock_out_dropped_on_reentry() {
        let mut m = studying_machine();
        m.region_transition(&transition(TransitionKind::Exit, 100));
        let (ticket, _) = issued_clock_out(&m.grace_expired(&expiry_at(100))).unwrap();
        m.command_failed(ticket, &StudyError::transient("HTTP 503"));

        m.region_transition(&transition(TransitionKind::Enter, 420));
        assert!(matches!(m.state(), SessionState::Studying(_)));
        assert!(!m.clock_out_owed());
        assert!(m.retry_owed_clock_out().is_empty());
    }

    #[test]
    fn test_owed_clock_out_rearmed_by_refresh_after_unauthorized() {
        let mut m = studying_machine();
        m.region_transition(&transition(TransitionKind::Exit, 100));
        let (ticket, _) = issued_clock_out(&m.grace_expired(&expiry_at(100))).unwrap();
        let effects = m.command_failed(ticket, &StudyError::Unauthorized);
        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleClockOutRetry(_))));

        let effects = m.rebuild(&snapshot(vec![session(7, 0, None)]), at(900));
        assert!(matches!(m.state(), SessionState::GraceWaitingForReentry { .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::ScheduleClockOutRetry(_))));
    }

    #[test]
    fn test_clock_out_confirmed_goes_idle() {
        let mut m = studying_machine();
        let (ticket, _) = issued_clock_out(&m.request_clock_out(ClockOutReason::Manual).unwrap()).unwrap();
        assert!(matches!(m.state(), SessionState::Studying(_)));

        let effects = m.clock_out_succeeded(ticket, Some(&snapshot(vec![session(7, 0, Some(1.0))])), at(3600));
        assert_eq!(m.state(), &SessionState::Idle);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Publish(BusEvent::ClockOut { session_id: 7, reason: ClockOutReason::Manual })
        )));
        assert!(!effects.iter().any(|e| matches!(
            e,
            Effect::Publish(BusEvent::ClockOut { reason: ClockOutReason::Remote, .. })
        )));
    }

    #[test]
    fn test_clock_out_confirmed_without_snapshot() {
        let mut m = studying_machine();
        let (ticket, _) = issued_clock_out(&m.request_clock_out(ClockOutReason::Manual).unwrap()).unwrap();
        let effects = m.clock_out_succeeded(ticket, None, at(100));
        assert_eq!(m.state(), &SessionState::Idle);
        assert!(effects.iter().any(|e| matches!(e, Effect::RequestRebuild)));
    }

    #[test]
    fn test_clock_out_unauthorized_keeps_studying() {
        let mut m = studying_machine();
        let before = m.state().clone();
        let (ticket, _) = issued_clock_out(&m.request_clock_out(ClockOutReason::Manual).unwrap()).unwrap();
        let effects = m.command_failed(ticket, &StudyError::Unauthorized);
        assert_eq!(m.state(), &before);
        assert!(m.pending_command().is_none());
        assert!(effects.iter().any(|e| matches!(e, Effect::SignalUnauthorized)));
    }

    #[test]
    fn test_rejected_command_requests_rebuild() {
        let mut m = SessionMachine::new(GRACE);
        let ticket = match m.request_clock_in(3).unwrap()[0] {
            Effect::IssueClockIn { ticket, .. } => ticket,
            _ => unreachable!(),
        };
        let effects = m.command_failed(ticket, &StudyError::rejected("already clocked in"));
        assert!(effects.iter().any(|e| matches!(e, Effect::RequestRebuild)));
        assert_eq!(m.state(), &SessionState::Idle);
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut m = studying_machine();
        assert!(m.command_failed(999, &StudyError::transient("late")).is_empty());
        assert!(m.clock_out_succeeded(999, None, at(0)).is_empty());
        assert!(matches!(m.state(), SessionState::Studying(_)));
    }

    #[test]
    fn test_rebuild_keeps_grace_for_same_session() {
        let mut m = studying_machine();
        m.region_transition(&transition(TransitionKind::Exit, 100));
        m.rebuild(&snapshot(vec![session(7, 0, None)]), at(150));
        assert!(matches!(m.state(), SessionState::GraceWaitingForReentry { .. }));
    }

    #[test]
    fn test_manual_mode_skips_auto_clock_out() {
        let mut m = studying_machine();
        m.regions_unavailable(&StudyError::RegionRegistration {
            message: "denied".into(),
        });
        m.region_transition(&transition(TransitionKind::Exit, 100));
        let expiry = GraceExpiry {
            region_id: "location-3".into(),
            exit_at: at(100),
            deadline: at(400),
        };
        assert!(m.grace_expired(&expiry).is_empty());
        assert!(!m.auto_clock_out());
        m.regions_available();
        assert!(m.auto_clock_out());
    }

    #[test]
    fn test_consistency_check() {
        let m = studying_machine();
        assert!(m.check_consistency(true).is_none());
        assert!(matches!(m.check_consistency(false), Some(Effect::RequestRebuild)));
        let idle = SessionMachine::new(GRACE);
        assert!(idle.check_consistency(false).is_none());
    }
}
