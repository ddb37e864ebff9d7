//! In-process checkpoint storage
//!
//! [`LocalCheckpointer`] keeps every thread's history in memory behind a
//! single `tokio::sync::RwLock`. It is the checkpointer for single-process
//! deployments, tests and development: nothing survives a restart and nothing
//! is shared with other processes.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  LocalCheckpointer                            │
//! │  Arc<RwLock<HashMap<thread_id, Vec<..>>>>     │
//! │    "session-1" ─ [0] [1] [2]                  │
//! │    "session-2" ─ [0]                          │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The version check and the append happen under one write-lock acquisition,
//! so two concurrent saves expecting the same latest step cannot both win.
//! Cloning shares the underlying storage.

use crate::{
    checkpoint::{next_step_index, Checkpoint, CheckpointDraft, CheckpointId},
    error::{CheckpointError, Result},
    traits::Checkpointer,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe in-memory checkpoint storage
type CheckpointStorage = Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>;

/// In-memory checkpointer for a single process
#[derive(Debug, Clone, Default)]
pub struct LocalCheckpointer {
    storage: CheckpointStorage,
}

impl LocalCheckpointer {
    /// Create a new in-memory checkpointer
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of threads being tracked
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Get the total number of checkpoints across all threads
    pub async fn checkpoint_count(&self) -> usize {
        self.storage.read().await.values().map(Vec::len).sum()
    }

    /// Clear all checkpoints (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

fn require_thread(thread_id: &str) -> Result<()> {
    if thread_id.is_empty() {
        return Err(CheckpointError::Invalid("thread_id is required".to_string()));
    }
    Ok(())
}

#[async_trait]
impl Checkpointer for LocalCheckpointer {
    async fn save(
        &self,
        thread_id: &str,
        draft: CheckpointDraft,
        expected_prev_step: Option<u64>,
    ) -> Result<CheckpointId> {
        require_thread(thread_id)?;

        let mut storage = self.storage.write().await;

        let latest = storage.get(thread_id).and_then(|entries| entries.last());
        let actual = latest.map(|c| c.step_index);
        if actual != expected_prev_step {
            return Err(CheckpointError::VersionConflict {
                thread_id: thread_id.to_string(),
                expected: expected_prev_step,
                actual,
            });
        }
        let version = latest.map_or(1, |c| c.version + 1);

        let entries = storage.entry(thread_id.to_string()).or_default();
        let checkpoint = Checkpoint::commit(
            thread_id,
            next_step_index(expected_prev_step),
            version,
            draft,
        );
        let id = checkpoint.id.clone();
        entries.push(checkpoint);

        Ok(id)
    }

    async fn load(&self, thread_id: &str, step_index: Option<u64>) -> Result<Checkpoint> {
        require_thread(thread_id)?;

        let storage = self.storage.read().await;
        let entries = storage
            .get(thread_id)
            .ok_or_else(|| CheckpointError::NotFound(format!("thread '{}'", thread_id)))?;

        let found = match step_index {
            // Step indices are contiguous from 0, so the index is the position.
            Some(step) => usize::try_from(step).ok().and_then(|i| entries.get(i)),
            None => entries.last(),
        };

        found.cloned().ok_or_else(|| {
            CheckpointError::NotFound(match step_index {
                Some(step) => format!("thread '{}' step {}", thread_id, step),
                None => format!("thread '{}'", thread_id),
            })
        })
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        require_thread(thread_id)?;
        Ok(self
            .storage
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        require_thread(thread_id)?;
        self.storage.write().await.remove(thread_id);
        Ok(())
    }
}
