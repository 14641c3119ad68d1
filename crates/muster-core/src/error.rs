//! Error types for muster-core.
//!
//! Errors fall into three groups:
//!
//! - **Ownership / placement**: `LockConflict`, `NotOwner`, `StaleLockDetected`,
//!   `CapacityExceeded`, `NoCapableWorker`. Never retried.
//! - **Transient**: `BackendUnavailable`. Retried locally with backoff, then surfaced.
//! - **Contract**: `InvalidConfig`, `InvalidPattern`, `Serialization`. Fail fast.

use std::time::Duration;

use thiserror::Error;

/// Core error type for coordination operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Resource is already owned by another worker.
    #[error("resource '{resource}' is locked by '{holder}'")]
    LockConflict { resource: String, holder: String },

    /// Release or heartbeat attempted by a worker that does not hold the lock.
    #[error("worker '{worker_id}' does not own the lock on '{resource}'")]
    NotOwner {
        resource: String,
        worker_id: String,
        holder: Option<String>,
    },

    /// Lock holder has not heartbeated within the staleness threshold.
    #[error("lock on '{resource}' held by '{holder}' is stale ({stale_for_ms}ms since last heartbeat)")]
    StaleLockDetected {
        resource: String,
        holder: String,
        stale_for_ms: u64,
    },

    /// Capable workers exist but none has room for the task.
    #[error("no worker has capacity for complexity {required}")]
    CapacityExceeded { required: u32 },

    /// No worker offers the required capabilities.
    #[error("no worker offers capabilities [{}]", .capabilities.join(", "))]
    NoCapableWorker { capabilities: Vec<String> },

    /// Backing store failed or is unreachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Overall deadline exceeded during a retry loop.
    #[error("timed out after {elapsed:?} waiting for '{resource}'")]
    Timeout { resource: String, elapsed: Duration },

    /// Acquire loop cancelled between attempts.
    #[error("operation on '{0}' was cancelled")]
    Cancelled(String),

    /// Worker, key or lock not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Subscription pattern could not be compiled.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Stored data could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LockConflict { .. } => "LOCK_CONFLICT",
            Self::NotOwner { .. } => "NOT_OWNER",
            Self::StaleLockDetected { .. } => "STALE_LOCK_DETECTED",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::NoCapableWorker { .. } => "NO_CAPABLE_WORKER",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled(_) => "CANCELLED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::InvalidPattern { .. } => "INVALID_PATTERN",
            Self::Serialization(_) => "SERIALIZATION",
        }
    }

    /// Whether a local retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<chrono::ParseError> for Error {
    fn from(err: chrono::ParseError) -> Self {
        Self::Serialization(format!("invalid timestamp: {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfig(format!("failed to parse config: {err}"))
    }
}

/// Result type alias for muster-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflict_display_names_holder() {
        let err = Error::LockConflict {
            resource: "task-1".into(),
            holder: "worker-a".into(),
        };
        assert_eq!(err.to_string(), "resource 'task-1' is locked by 'worker-a'");
        assert_eq!(err.code(), "LOCK_CONFLICT");
    }

    #[test]
    fn test_only_backend_errors_are_transient() {
        assert!(Error::backend("down").is_transient());
        assert!(!Error::not_found("w").is_transient());
        assert!(!Error::NotOwner {
            resource: "r".into(),
            worker_id: "b".into(),
            holder: Some("a".into()),
        }
        .is_transient());
    }

    #[test]
    fn test_no_capable_worker_lists_capabilities() {
        let err = Error::NoCapableWorker {
            capabilities: vec!["rust".into(), "gpu".into()],
        };
        assert_eq!(err.to_string(), "no worker offers capabilities [rust, gpu]");
    }

    #[test]
    fn test_toml_error_maps_to_invalid_config() {
        let parsed: std::result::Result<toml::Value, _> = toml::from_str("= broken");
        let err: Error = match parsed {
            Ok(_) => return,
            Err(e) => e.into(),
        };
        assert_eq!(err.code(), "INVALID_CONFIG");
    }
}
