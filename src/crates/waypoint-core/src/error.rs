//! Error types for run execution
//!
//! Every fallible operation in this crate returns [`RuntimeError`]. The enum
//! is `Clone` because a single execution may be shared between several
//! callers (see the cache middleware's single-flight), each of which receives
//! its own copy of the outcome.
//!
//! # Error Hierarchy
//!
//! ```text
//! RuntimeError
//! ├── Validation         - bad input, chain or resolution; never retried
//! ├── Retryable          - transient backend/network failure
//! ├── LeaseConflict      - another worker owns the thread
//! ├── VersionConflict    - a concurrent checkpoint write won
//! ├── NotFound           - missing thread, checkpoint or key
//! ├── Timeout            - step or run exceeded its deadline
//! ├── Interrupted        - control signal: the run paused
//! ├── InvalidResumption  - resume does not match the pending interrupt
//! ├── TypeMismatch       - typed state accessor on the wrong value type
//! ├── StepLimit          - routing did not terminate within max_steps
//! ├── Cancelled          - caller cancelled the run
//! ├── Step               - a step failed permanently
//! ├── Storage            - non-transient checkpoint backend failure
//! ├── Serialization      - JSON/YAML errors
//! └── Configuration      - invalid runtime configuration
//! ```
//!
//! # Classification
//!
//! [`RuntimeError::kind`] folds the variants into an [`ErrorKind`], which is
//! what the retry middleware consults. Only [`ErrorKind::Retryable`] is
//! retried by default; [`ErrorKind::Timeout`] is retried only when the retry
//! policy opts in. Conflicts, validation failures, interrupts and
//! cancellation are never retried.
//!
//! ```rust
//! use waypoint_core::{ErrorKind, RuntimeError};
//!
//! let err = RuntimeError::retryable("connection reset");
//! assert_eq!(err.kind(), ErrorKind::Retryable);
//! assert!(err.is_retryable());
//!
//! let err = RuntimeError::validation("missing field 'order_id'");
//! assert!(!err.is_retryable());
//! ```

use crate::interrupt::Interrupt;
use thiserror::Error;
use waypoint_checkpoint::CheckpointError;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while building or executing runs
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Invalid input, chain definition or routing target
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient failure; safe to retry
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Another worker holds a live lease on the thread
    #[error("Thread '{thread_id}' is leased by worker '{holder}'")]
    LeaseConflict { thread_id: String, holder: String },

    /// Concurrent checkpoint write detected
    #[error("Version conflict on thread '{thread_id}': expected latest step {expected:?}, found {actual:?}")]
    VersionConflict {
        thread_id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// Missing thread, checkpoint or state key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Step or run exceeded its deadline
    #[error("Operation '{operation}' timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// The run paused on an interrupt; not a failure
    #[error("Run interrupted at '{}'", .0.name)]
    Interrupted(Interrupt),

    /// A resume did not match the thread's pending interrupt
    #[error("Invalid resumption: {0}")]
    InvalidResumption(String),

    /// Typed accessor found a different value type
    #[error("Type mismatch for key '{key}': expected {expected}, found {actual}")]
    TypeMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// The run executed more steps than allowed
    #[error("Step limit of {limit} exceeded")]
    StepLimit { limit: usize },

    /// The run was cancelled by its caller
    #[error("Run cancelled")]
    Cancelled,

    /// A step failed permanently
    #[error("Step '{step}' failed: {message}")]
    Step { step: String, message: String },

    /// Non-transient checkpoint backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Coarse classification of a [`RuntimeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; fatal and never retried
    Validation,
    /// Transient; retried by the retry middleware
    Retryable,
    /// Lease or version conflict; surfaced to the caller
    Conflict,
    /// Something the caller asked for does not exist
    NotFound,
    /// Deadline exceeded; retried only when the policy opts in
    Timeout,
    /// Control signal that the run paused
    Interrupted,
    /// The caller cancelled the run
    Cancelled,
    /// Any other unrecoverable failure
    Fatal,
}

impl RuntimeError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    /// Create a permanent step failure
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::InvalidResumption(_)
            | Self::TypeMismatch { .. }
            | Self::Configuration(_) => ErrorKind::Validation,
            Self::Retryable(_) => ErrorKind::Retryable,
            Self::LeaseConflict { .. } | Self::VersionConflict { .. } => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Interrupted(_) => ErrorKind::Interrupted,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::StepLimit { .. }
            | Self::Step { .. }
            | Self::Storage(_)
            | Self::Serialization(_) => ErrorKind::Fatal,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Whether this is the pause signal rather than a failure
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

impl From<CheckpointError> for RuntimeError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::NotFound(what) => Self::NotFound(what),
            CheckpointError::VersionConflict {
                thread_id,
                expected,
                actual,
            } => Self::VersionConflict {
                thread_id,
                expected,
                actual,
            },
            CheckpointError::LeaseConflict {
                thread_id, holder, ..
            } => Self::LeaseConflict { thread_id, holder },
            err @ CheckpointError::Store(_) if err.is_retryable() => {
                Self::Retryable(err.to_string())
            }
            CheckpointError::Store(err) => Self::Storage(err.to_string()),
            CheckpointError::Serialization(err) => Self::Serialization(err.to_string()),
            CheckpointError::Invalid(message) => Self::Validation(message),
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RuntimeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_checkpoint::StoreError;

    #[test]
    fn test_classification() {
        assert_eq!(RuntimeError::retryable("x").kind(), ErrorKind::Retryable);
        assert_eq!(RuntimeError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(
            RuntimeError::timeout("step 'a'", std::time::Duration::from_millis(5)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(RuntimeError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(RuntimeError::step("a", "boom").kind(), ErrorKind::Fatal);
        assert!(RuntimeError::Interrupted(Interrupt::new("review", "approved")).is_interrupt());
    }

    #[test]
    fn test_checkpoint_error_mapping() {
        let conflict: RuntimeError = CheckpointError::VersionConflict {
            thread_id: "t".to_string(),
            expected: Some(1),
            actual: Some(2),
        }
        .into();
        assert_eq!(conflict.kind(), ErrorKind::Conflict);

        let transient: RuntimeError =
            CheckpointError::Store(StoreError::Unavailable("redis down".to_string())).into();
        assert!(transient.is_retryable());

        let permanent: RuntimeError =
            CheckpointError::Store(StoreError::Other("disk full".to_string())).into();
        assert!(matches!(permanent, RuntimeError::Storage(_)));

        let missing: RuntimeError = CheckpointError::NotFound("thread 't'".to_string()).into();
        assert!(matches!(missing, RuntimeError::NotFound(_)));
    }

    #[test]
    fn test_display() {
        let err = RuntimeError::timeout("step 'fetch'", std::time::Duration::from_millis(250));
        assert_eq!(err.to_string(), "Operation 'step 'fetch'' timed out after 250ms");

        let err = RuntimeError::Interrupted(Interrupt::new("approval", "approved"));
        assert_eq!(err.to_string(), "Run interrupted at 'approval'");
    }
}
