//! The [`Checkpointer`] trait
//!
//! Every persistence backend implements this trait. The runtime talks to it
//! exclusively through `Arc<dyn Checkpointer>`, so local and distributed
//! backends are interchangeable.
//!
//! # Write protocol
//!
//! Checkpoints of a thread are an append-only, gap-free sequence. A writer
//! states which step it believes is the latest (`expected_prev_step`, `None`
//! for an empty thread) and the backend appends at the next index only if
//! that belief is still true:
//!
//! ```text
//!  writer A: save(t, draft, Some(1)) ──► [0][1][2 A]          ok, id returned
//!  writer B: save(t, draft, Some(1)) ──► [0][1][2 A]          VersionConflict
//! ```
//!
//! Backends must make that check and the append a single atomic decision.
//!
//! # Leases
//!
//! Multi-worker backends additionally hand out per-thread leases. The lease
//! hooks default to no-ops so single-process backends need not care.
//!
//! # Example: reading a thread's history
//!
//! ```rust,no_run
//! use waypoint_checkpoint::{Checkpointer, LocalCheckpointer};
//!
//! # async fn example() -> waypoint_checkpoint::Result<()> {
//! let checkpointer = LocalCheckpointer::new();
//! for checkpoint in checkpointer.list("thread-1").await? {
//!     println!("step {} -> {:?}", checkpoint.step_index, checkpoint.metadata.step);
//! }
//! # Ok(())
//! # }
//! ```

use crate::{
    checkpoint::{Checkpoint, CheckpointDraft, CheckpointId},
    error::{CheckpointError, Result},
    lease::Lease,
};
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::pin::Pin;

/// Type alias for async stream of checkpoints
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<Checkpoint>> + Send + 'static>>;

/// Core trait for checkpoint storage backends
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Append a checkpoint to a thread
    ///
    /// The new checkpoint gets `step_index = expected_prev_step + 1` (or 0
    /// when `expected_prev_step` is `None`).
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::VersionConflict`] if the thread's latest step is
    ///   not `expected_prev_step`
    /// - [`CheckpointError::LeaseConflict`] if another worker holds the
    ///   thread's lease (distributed backends only)
    async fn save(
        &self,
        thread_id: &str,
        draft: CheckpointDraft,
        expected_prev_step: Option<u64>,
    ) -> Result<CheckpointId>;

    /// Load the latest checkpoint, or the one at `step_index`
    ///
    /// # Errors
    ///
    /// [`CheckpointError::NotFound`] if the thread or step does not exist.
    async fn load(&self, thread_id: &str, step_index: Option<u64>) -> Result<Checkpoint>;

    /// Full history of a thread, ordered by step index
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    /// Remove every checkpoint of a thread
    async fn delete(&self, thread_id: &str) -> Result<()>;

    /// Latest checkpoint, `None` for an unknown thread
    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        match self.load(thread_id, None).await {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(CheckpointError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// History of a thread as a stream
    async fn history(&self, thread_id: &str) -> Result<CheckpointStream> {
        let checkpoints = self.list(thread_id).await?;
        Ok(Box::pin(stream::iter(checkpoints.into_iter().map(Ok))))
    }

    /// Acquire the thread's lease for this worker
    ///
    /// Returns `None` when the backend does not use leases.
    async fn acquire_lease(&self, _thread_id: &str) -> Result<Option<Lease>> {
        Ok(None)
    }

    /// Extend a lease held by this worker
    async fn renew_lease(&self, lease: &Lease) -> Result<Lease> {
        Ok(lease.clone())
    }

    /// Give up a lease held by this worker
    async fn release_lease(&self, _lease: &Lease) -> Result<()> {
        Ok(())
    }
}
