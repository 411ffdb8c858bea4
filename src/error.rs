//! Core error taxonomy shared by the RunStore, Driver, and Scheduler.
//!
//! Mirrors the error kinds named in the orchestration contract: callers
//! match on variant, not on message text, so the HTTP layer can map each
//! one to a stable status code.

use thiserror::Error;

/// Result type used throughout the core crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors recognized by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Run, node, flow, or agent referenced by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create was called with an id that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The requested status change is not reachable from the current status.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Plan, checkpoint, or expression failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A driver's subprocess or job could not start, or exited with a
    /// non-retriable failure.
    #[error("driver failure: {0}")]
    DriverFailure(String),

    /// A deadline elapsed before the operation completed.
    #[error("timeout")]
    Timeout,

    /// The caller requested cancellation.
    #[error("cancelled")]
    Cancelled,

    /// The persistence backend failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Short machine-readable tag, used for logging and for the `reason`
    /// field on terminal node/run status events.
    pub fn reason(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::AlreadyExists(_) => "already_exists",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::Validation(_) => "validation",
            CoreError::DriverFailure(_) => "driver_failure",
            CoreError::Timeout => "timeout",
            CoreError::Cancelled => "cancelled",
            CoreError::Storage(_) => "storage",
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation(format!("invalid json: {err}"))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            other => CoreError::Storage(other.to_string()),
        }
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Storage(format!("redis: {err}"))
    }
}
