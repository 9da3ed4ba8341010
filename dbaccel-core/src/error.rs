//! # DbAccel Error Types
//!
//! Centralized error handling for the database access acceleration layer.
//!
//! Capacity and expiry conditions never become errors: an oversized item is
//! rejected by `set` returning `false`, an expired entry reads as
//! `Lookup::Expired`, and a stale pool handle is dropped. Timeouts and
//! execution failures travel back to the caller through the operation handle.

use thiserror::Error;

use crate::lock_timeout::LockTimeoutError;

/// Result type alias for DbAccel operations
pub type Result<T> = std::result::Result<T, AccelError>;

/// Core error types for DbAccel
#[derive(Error, Debug)]
pub enum AccelError {
    /// Liveness probe failed
    #[error("Liveness probe failed: {0}")]
    Liveness(String),

    /// Deadline elapsed before execution, or a bounded sub-step ran out of time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Underlying batched operation raised
    #[error("Execution error: {0}")]
    Execution(String),

    /// Bounded lock acquisition failed
    #[error("Lock timeout: {0}")]
    LockTimeout(#[from] LockTimeoutError),

    /// Session pool has been shut down
    #[error("Session pool is closed")]
    PoolClosed,

    /// Operation was dropped before it could be resolved
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Background worker already started
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic errors with context
    #[error("{0}")]
    Other(String),
}

impl AccelError {
    /// Create a new liveness error
    pub fn liveness(msg: impl Into<String>) -> Self {
        Self::Liveness(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new already-running error
    pub fn already_running(msg: impl Into<String>) -> Self {
        Self::AlreadyRunning(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the caller's data may not have been persisted.
    ///
    /// Only timeouts, execution failures and cancellations qualify; these
    /// are the errors that operation handles surface.
    pub fn is_unpersisted(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Execution(_) | Self::Cancelled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = AccelError::timeout("deadline elapsed");
        assert_eq!(err.to_string(), "Timeout: deadline elapsed");

        let err = AccelError::PoolClosed;
        assert_eq!(err.to_string(), "Session pool is closed");
    }

    #[test]
    fn test_lock_timeout_conversion() {
        let err: AccelError = LockTimeoutError::Timeout {
            name: "queues".to_string(),
            timeout: Duration::from_millis(50),
        }
        .into();
        assert!(matches!(err, AccelError::LockTimeout(_)));
        assert!(err.to_string().contains("queues"));
    }

    #[test]
    fn test_unpersisted_classification() {
        assert!(AccelError::execution("boom").is_unpersisted());
        assert!(AccelError::cancelled("dropped").is_unpersisted());
        assert!(!AccelError::liveness("probe failed").is_unpersisted());
        assert!(!AccelError::PoolClosed.is_unpersisted());
    }
}
