// src/gateway/retry.rs - Retry with exponential backoff for dashboard reads
//
// Wraps any DashboardGateway. Only `fetch_current_state` is retried, and only
// on Transient errors. Clock commands and session edits are passed straight
// through: they are not idempotent, and a user decides whether to repeat them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandReceipt, DashboardGateway};
use crate::core::types::DashboardSnapshot;
use crate::infra::config::RetrySettings;
use crate::infra::errors::StudyError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            backoff_factor: s.backoff_factor,
            max_delay: Duration::from_millis(s.max_delay_ms),
            jitter_fraction: s.jitter_fraction,
        }
    }
}

pub struct RetryGateway {
    inner: Arc<dyn DashboardGateway>,
    config: RetryConfig,
}

impl RetryGateway {
    pub fn new(inner: Arc<dyn DashboardGateway>) -> Self {
        Self {
            inner,
            config: RetryConfig::default(),
        }
    }

    pub fn with_config(inner: Arc<dyn DashboardGateway>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Delay before retry `attempt` (0-indexed).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_factor.powi(attempt as i32);
        let capped_ms = base_ms.min(self.config.max_delay.as_millis() as f64);
        let jitter = deterministic_jitter(attempt, self.config.jitter_fraction);
        let final_ms = (capped_ms * jitter).max(50.0);
        Duration::from_millis(final_ms as u64)
    }
}

fn should_retry(error: &StudyError) -> bool {
    error.is_retriable()
}

/// Multiplier in [1 - fraction, 1 + fraction], stable per attempt.
fn deterministic_jitter(attempt: u32, fraction: f64) -> f64 {
    let hash = (attempt.wrapping_mul(2654435761)) as f64 / u32::MAX as f64;
    1.0 + fraction * (2.0 * hash - 1.0)
}

#[async_trait]
impl DashboardGateway for RetryGateway {
    async fn fetch_current_state(&self) -> Result<DashboardSnapshot, StudyError> {
        let mut attempt = 0;
        loop {
            match self.inner.fetch_current_state().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if should_retry(&e) && attempt < self.config.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying dashboard fetch after error: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn clock_in(&self, location_id: i64) -> Result<CommandReceipt, StudyError> {
        self.inner.clock_in(location_id).await
    }

    async fn clock_out(&self) -> Result<CommandReceipt, StudyError> {
        self.inner.clock_out().await
    }

    async fn edit_session(&self, session_id: i64, hours: f64) -> Result<(), StudyError> {
        self.inner.edit_session(session_id, hours).await
    }

    async fn delete_session(&self, session_id: i64) -> Result<(), StudyError> {
        self.inner.delete_session(session_id).await
    }
}
