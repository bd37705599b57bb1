// src/infra/errors.rs - Error types for studytrack

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StudyError {
    // Credential expired or invalid. Never retried transparently.
    #[error("Unauthorized: credential expired or invalid")]
    Unauthorized,

    // Network or server failure; caller may retry.
    #[error("Transient error: {message}")]
    Transient { message: String },

    // Business-rule refusal from the server (double clock-in, unknown session, ...)
    #[error("Rejected: {message}")]
    Rejected { message: String },

    #[error("Data inconsistency: {message}")]
    DataInconsistency { message: String },

    // Local-only
    #[error("Invalid instant: {message}")]
    InvalidInstant { message: String },

    #[error("Region registration failed: {message}")]
    RegionRegistration { message: String },

    #[error("Session tracker is not running")]
    TrackerStopped,

    // Infra
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StudyError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn inconsistency(message: impl Into<String>) -> Self {
        Self::DataInconsistency {
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, StudyError::Transient { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, StudyError::Unauthorized)
    }

    /// Errors are not `Clone` (io/json sources); this produces an equivalent
    /// value for fan-out to several waiters.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Unauthorized => Self::Unauthorized,
            Self::Transient { message } => Self::transient(message.clone()),
            Self::Rejected { message } => Self::rejected(message.clone()),
            Self::DataInconsistency { message } => Self::inconsistency(message.clone()),
            Self::InvalidInstant { message } => Self::InvalidInstant {
                message: message.clone(),
            },
            Self::RegionRegistration { message } => Self::RegionRegistration {
                message: message.clone(),
            },
            Self::TrackerStopped => Self::TrackerStopped,
            Self::Config(msg) => Self::Config(msg.clone()),
            other => Self::Other(anyhow::anyhow!("{other}")),
        }
    }
}
