//! # waypoint-checkpoint - Durable Step History for Workflow Threads
//!
//! Trait-based checkpoint storage for the waypoint runtime. A **thread** is
//! one logical execution of a workflow; every committed step appends an
//! immutable [`Checkpoint`] to the thread's history. Restarting a process,
//! resuming after a human answered an interrupt, or letting another worker
//! pick the thread up all start from the latest checkpoint.
//!
//! ## Core Concepts
//!
//! ### 1. The `Checkpointer` trait
//!
//! [`Checkpointer`] is the seam between the runtime and storage:
//!
//! - **`save()`** - append a [`CheckpointDraft`] after an expected step
//! - **`load()`** - latest checkpoint or a specific step
//! - **`list()`** / **`history()`** - full ordered history
//! - **`delete()`** - drop a thread
//! - lease hooks for multi-worker backends
//!
//! ### 2. Optimistic concurrency
//!
//! Every save names the step the writer believes is the latest. If another
//! writer got there first the save fails with
//! [`CheckpointError::VersionConflict`] and nothing is written, so a thread's
//! history is always the gap-free sequence `0, 1, 2, ...`.
//!
//! ### 3. Backends
//!
//! | Backend | Scope | Coordination |
//! |---------|-------|--------------|
//! | [`LocalCheckpointer`] | one process | write lock |
//! | [`DistributedCheckpointer`] | many workers | [`Lease`] + compare-and-swap on a [`BackingStore`] |
//!
//! [`InMemoryStore`] implements [`BackingStore`] for tests and single-host
//! setups; production deployments plug in their own service.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use waypoint_checkpoint::{CheckpointDraft, Checkpointer, LocalCheckpointer, StateValues};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let checkpointer = LocalCheckpointer::new();
//!
//!     let mut state = StateValues::new();
//!     state.insert("count".to_string(), json!(1));
//!
//!     checkpointer.save("thread-1", CheckpointDraft::new(state), None).await?;
//!
//!     let latest = checkpointer.load("thread-1", None).await?;
//!     assert_eq!(latest.step_index, 0);
//!     Ok(())
//! }
//! ```
//!
//! ## Multiple workers
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use waypoint_checkpoint::{DistributedCheckpointer, DistributedConfig, InMemoryStore};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let worker_a = DistributedCheckpointer::new(
//!     store.clone(),
//!     DistributedConfig::new().with_worker_id("a").with_lease_ttl(Duration::from_secs(10)),
//! );
//! let worker_b = DistributedCheckpointer::new(
//!     store,
//!     DistributedConfig::new().with_worker_id("b"),
//! );
//! ```
//!
//! ## See Also
//!
//! - `waypoint-core` - the runtime that writes these checkpoints

pub mod checkpoint;
pub mod distributed;
pub mod error;
pub mod lease;
pub mod memory;
pub mod store;
pub mod traits;

pub use checkpoint::{
    next_step_index, Checkpoint, CheckpointDraft, CheckpointId, CheckpointMetadata,
    CheckpointSource, PendingInterrupt, StateValues,
};
pub use distributed::{DistributedCheckpointer, DistributedConfig};
pub use error::{CheckpointError, Result};
pub use lease::Lease;
pub use memory::LocalCheckpointer;
pub use store::{namespace, BackingStore, InMemoryStore, Namespace, StoreError, StoreResult};
pub use traits::{CheckpointStream, Checkpointer};
