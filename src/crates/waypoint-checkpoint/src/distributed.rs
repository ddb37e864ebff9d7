//! Checkpoints shared between worker processes
//!
//! [`DistributedCheckpointer`] persists checkpoints in an injected
//! [`BackingStore`] and coordinates writers with two independent guards:
//!
//! 1. **Lease.** Before every save the worker acquires or renews the thread's
//!    lease (`[thread_id, "lease"]`). A live lease held by another worker
//!    fails the save with [`CheckpointError::LeaseConflict`] before anything is
//!    written. Expired leases are taken over.
//! 2. **Version token.** Each checkpoint record lives at its own slot
//!    (`[thread_id, "checkpoints"]`, key = zero-padded step index) and
//!    carries `version = previous.version + 1`. The record is created with a
//!    compare-and-swap that requires the slot to be empty, so of two writers
//!    that observed the same latest checkpoint only one can append. The loser
//!    gets [`CheckpointError::VersionConflict`] even if it believed it held
//!    the lease, which covers clock skew and a lease lapsing mid-step.
//!
//! ```text
//!  worker A ──claim lease──► check latest == expected ──CAS slot 3 (empty?)──► ok
//!  worker B ──claim lease──X LeaseConflict
//!  worker A' (stale lease) ─► check latest ───────────X VersionConflict
//! ```
//!
//! The durability unit is one record write. A worker that crashes mid-step
//! leaves the previous record as the latest checkpoint and therefore as the
//! resume point.
//!
//! Deleting a thread claims its lease first. A save that still loses a race
//! with a delete re-reads the slot before its own once the append lands; if
//! that slot is gone the new record is withdrawn and the save fails with
//! [`CheckpointError::VersionConflict`], so history never starts mid-way.

use crate::{
    checkpoint::{next_step_index, Checkpoint, CheckpointDraft, CheckpointId},
    error::{CheckpointError, Result},
    lease::Lease,
    store::{namespace, BackingStore, Namespace},
    traits::Checkpointer,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const CHECKPOINTS: &str = "checkpoints";
const LEASE: &str = "lease";
const LEASE_KEY: &str = "current";
const MAX_CLAIM_ATTEMPTS: u32 = 3;

/// Configuration for a [`DistributedCheckpointer`]
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Identity of this worker; must be unique among workers sharing a store
    pub worker_id: String,

    /// How long a lease stays valid without renewal
    pub lease_ttl: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

impl DistributedConfig {
    /// Create a configuration with a random worker id
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker id
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Set the lease TTL
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}

/// Checkpointer backed by a shared [`BackingStore`]
#[derive(Clone)]
pub struct DistributedCheckpointer {
    store: Arc<dyn BackingStore>,
    config: DistributedConfig,
}

impl std::fmt::Debug for DistributedCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCheckpointer")
            .field("config", &self.config)
            .finish()
    }
}

fn checkpoint_ns(thread_id: &str) -> Namespace {
    namespace([thread_id, CHECKPOINTS])
}

fn lease_ns(thread_id: &str) -> Namespace {
    namespace([thread_id, LEASE])
}

fn step_key(step_index: u64) -> String {
    format!("{:020}", step_index)
}

fn require_thread(thread_id: &str) -> Result<()> {
    if thread_id.is_empty() {
        return Err(CheckpointError::Invalid("thread_id is required".to_string()));
    }
    Ok(())
}

impl DistributedCheckpointer {
    /// Create a checkpointer over a store
    pub fn new(store: Arc<dyn BackingStore>, config: DistributedConfig) -> Self {
        Self { store, config }
    }

    /// This worker's id
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Configuration in use
    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    fn lease_ttl(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.config.lease_ttl)
            .map_err(|e| CheckpointError::Invalid(format!("lease ttl out of range: {}", e)))
    }

    /// Current lease record, raw and decoded
    async fn read_lease(&self, thread_id: &str) -> Result<Option<(Value, Lease)>> {
        match self.store.get(&lease_ns(thread_id), LEASE_KEY).await? {
            Some(raw) => {
                let lease: Lease = serde_json::from_value(raw.clone())?;
                Ok(Some((raw, lease)))
            }
            None => Ok(None),
        }
    }

    /// Current lease of a thread, if any
    pub async fn current_lease(&self, thread_id: &str) -> Result<Option<Lease>> {
        Ok(self.read_lease(thread_id).await?.map(|(_, lease)| lease))
    }

    fn conflict(lease: &Lease) -> CheckpointError {
        CheckpointError::LeaseConflict {
            thread_id: lease.thread_id.clone(),
            holder: lease.worker_id.clone(),
            expires_at: lease.expires_at,
        }
    }

    /// Acquire the lease, renew our own, or take over an expired one
    ///
    /// A lost compare-and-swap against our own concurrent renewal is retried.
    async fn claim(&self, thread_id: &str) -> Result<Lease> {
        let ttl = self.lease_ttl()?;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let current = self.read_lease(thread_id).await?;
            let now = Utc::now();

            let next = match &current {
                Some((_, lease)) if lease.is_held_by(&self.config.worker_id) => lease.renewed(ttl),
                Some((_, lease)) if !lease.is_expired_at(now) => return Err(Self::conflict(lease)),
                Some((_, lease)) => {
                    debug!(
                        thread_id,
                        previous_holder = %lease.worker_id,
                        worker_id = %self.config.worker_id,
                        "Taking over expired lease"
                    );
                    Lease::new(thread_id, &self.config.worker_id, ttl)
                }
                None => Lease::new(thread_id, &self.config.worker_id, ttl),
            };

            let swapped = self
                .store
                .compare_and_swap(
                    &lease_ns(thread_id),
                    LEASE_KEY,
                    current.as_ref().map(|(raw, _)| raw),
                    Some(serde_json::to_value(&next)?),
                )
                .await?;

            if swapped {
                return Ok(next);
            }

            // Someone else claimed it between our read and our write.
            match self.current_lease(thread_id).await? {
                Some(winner)
                    if winner.is_held_by(&self.config.worker_id)
                        && attempts < MAX_CLAIM_ATTEMPTS =>
                {
                    continue
                }
                Some(winner) => return Err(Self::conflict(&winner)),
                None => {
                    return Err(CheckpointError::LeaseConflict {
                        thread_id: thread_id.to_string(),
                        holder: "unknown".to_string(),
                        expires_at: now,
                    })
                }
            }
        }
    }

    async fn read_record(&self, thread_id: &str, key: &str) -> Result<Option<Checkpoint>> {
        match self.store.get(&checkpoint_ns(thread_id), key).await? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    async fn latest_record(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let keys = self.store.list(&checkpoint_ns(thread_id)).await?;
        match keys.iter().max() {
            Some(key) => self.read_record(thread_id, key).await,
            None => Ok(None),
        }
    }

    /// Checkpoints of a thread whose top-level record fields match `filter`
    pub async fn search(
        &self,
        thread_id: &str,
        filter: &HashMap<String, Value>,
    ) -> Result<Vec<Checkpoint>> {
        require_thread(thread_id)?;
        let mut checkpoints = self
            .store
            .search(&checkpoint_ns(thread_id), filter)
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<Checkpoint>, _>>()?;
        checkpoints.sort_by_key(|c| c.step_index);
        Ok(checkpoints)
    }
}

#[async_trait]
impl Checkpointer for DistributedCheckpointer {
    #[tracing::instrument(skip(self, draft), fields(worker_id = %self.config.worker_id))]
    async fn save(
        &self,
        thread_id: &str,
        draft: CheckpointDraft,
        expected_prev_step: Option<u64>,
    ) -> Result<CheckpointId> {
        require_thread(thread_id)?;
        self.claim(thread_id).await?;

        let latest = self.latest_record(thread_id).await?;
        let actual = latest.as_ref().map(|c| c.step_index);
        if actual != expected_prev_step {
            return Err(CheckpointError::VersionConflict {
                thread_id: thread_id.to_string(),
                expected: expected_prev_step,
                actual,
            });
        }

        let step_index = next_step_index(expected_prev_step);
        let version = latest.as_ref().map_or(1, |c| c.version + 1);
        let checkpoint = Checkpoint::commit(thread_id, step_index, version, draft);
        let id = checkpoint.id.clone();

        let record = serde_json::to_value(&checkpoint)?;
        let created = self
            .store
            .compare_and_swap(
                &checkpoint_ns(thread_id),
                &step_key(step_index),
                None,
                Some(record.clone()),
            )
            .await?;

        if !created {
            warn!(thread_id, step_index, "Lost race for checkpoint slot");
            return Err(CheckpointError::VersionConflict {
                thread_id: thread_id.to_string(),
                expected: expected_prev_step,
                actual: Some(step_index),
            });
        }

        // A delete that ran between the latest-step check and the slot write
        // would leave this record with nothing before it.
        if let Some(previous) = expected_prev_step {
            if self.read_record(thread_id, &step_key(previous)).await?.is_none() {
                warn!(thread_id, step_index, "Thread cleared during save, withdrawing record");
                self.store
                    .compare_and_swap(
                        &checkpoint_ns(thread_id),
                        &step_key(step_index),
                        Some(&record),
                        None,
                    )
                    .await?;
                return Err(CheckpointError::VersionConflict {
                    thread_id: thread_id.to_string(),
                    expected: expected_prev_step,
                    actual: None,
                });
            }
        }

        debug!(thread_id, step_index, version, "Checkpoint committed");
        Ok(id)
    }

    async fn load(&self, thread_id: &str, step_index: Option<u64>) -> Result<Checkpoint> {
        require_thread(thread_id)?;

        let found = match step_index {
            Some(step) => self.read_record(thread_id, &step_key(step)).await?,
            None => self.latest_record(thread_id).await?,
        };

        found.ok_or_else(|| {
            CheckpointError::NotFound(match step_index {
                Some(step) => format!("thread '{}' step {}", thread_id, step),
                None => format!("thread '{}'", thread_id),
            })
        })
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        self.search(thread_id, &HashMap::new()).await
    }

    /// Remove the thread's checkpoints and lease
    ///
    /// Requires the lease like a save does, so a thread another worker is
    /// running cannot be deleted under it.
    async fn delete(&self, thread_id: &str) -> Result<()> {
        require_thread(thread_id)?;
        self.claim(thread_id).await?;
        let removed = self.store.clear(&checkpoint_ns(thread_id)).await?;
        self.store.clear(&lease_ns(thread_id)).await?;
        debug!(thread_id, removed, "Thread deleted");
        Ok(())
    }

    async fn acquire_lease(&self, thread_id: &str) -> Result<Option<Lease>> {
        require_thread(thread_id)?;
        self.claim(thread_id).await.map(Some)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease> {
        if !lease.is_held_by(&self.config.worker_id) {
            return Err(CheckpointError::Invalid(format!(
                "lease on '{}' belongs to worker '{}'",
                lease.thread_id, lease.worker_id
            )));
        }
        self.claim(&lease.thread_id).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let Some((raw, current)) = self.read_lease(&lease.thread_id).await? else {
            return Ok(());
        };
        if !current.is_held_by(&self.config.worker_id) {
            debug!(
                thread_id = %lease.thread_id,
                holder = %current.worker_id,
                "Lease already taken over, nothing to release"
            );
            return Ok(());
        }
        self.store
            .compare_and_swap(&lease_ns(&lease.thread_id), LEASE_KEY, Some(&raw), None)
            .await?;
        Ok(())
    }
}
