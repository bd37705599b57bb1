// src/gateway/mod.rs - Dashboard sync gateway
//
// The only path between the session tracker and the remote dashboard API.
// Every call maps failures onto the `StudyError` taxonomy (Unauthorized,
// Transient, Rejected, DataInconsistency).

pub mod cache;
pub mod http;
pub mod retry;

use async_trait::async_trait;

use crate::core::types::DashboardSnapshot;
use crate::infra::errors::StudyError;

/// Result of an accepted clock command.
///
/// The API acknowledges clock commands without returning the session, so the
/// gateway follows up with a dashboard fetch. `snapshot` is `None` when that
/// follow-up failed; the command itself was still accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandReceipt {
    pub snapshot: Option<DashboardSnapshot>,
}

#[async_trait]
pub trait DashboardGateway: Send + Sync {
    /// Fetch the authoritative dashboard state.
    async fn fetch_current_state(&self) -> Result<DashboardSnapshot, StudyError>;

    /// Open a session at `location_id`. Never retried implicitly.
    async fn clock_in(&self, location_id: i64) -> Result<CommandReceipt, StudyError>;

    /// Close the open session. Never retried implicitly.
    async fn clock_out(&self) -> Result<CommandReceipt, StudyError>;

    /// Correct the hours of a recorded session.
    async fn edit_session(&self, session_id: i64, hours: f64) -> Result<(), StudyError>;

    async fn delete_session(&self, session_id: i64) -> Result<(), StudyError>;
}
