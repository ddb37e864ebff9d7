//! Error types for checkpoint operations

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint not found
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// The thread's latest checkpoint is not the one the writer expected
    #[error("Version conflict on thread '{thread_id}': expected latest step {expected:?}, found {actual:?}")]
    VersionConflict {
        thread_id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// Another worker holds a live lease on the thread
    #[error("Thread '{thread_id}' is leased by worker '{holder}' until {expires_at}")]
    LeaseConflict {
        thread_id: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// Backing store failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid checkpoint or argument
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),
}

impl CheckpointError {
    /// Whether retrying the same operation may succeed
    ///
    /// Only transient store failures qualify. Conflicts are never retried
    /// because the caller's view of the thread is stale.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckpointError::Store(err) if err.is_transient())
    }
}
