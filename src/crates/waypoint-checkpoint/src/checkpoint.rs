//! Checkpoint data model
//!
//! A [`Checkpoint`] is one committed, durable snapshot of a run's working
//! memory. For a given thread the checkpoints form an append-only sequence
//! ordered by [`Checkpoint::step_index`]: the first one has index 0 and every
//! later one has exactly the previous index plus one.
//!
//! Writers never build a `Checkpoint` directly. They hand a
//! [`CheckpointDraft`] to a [`Checkpointer`](crate::Checkpointer), which
//! assigns the id, step index, version and timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Serialized state of a run: key → value, ordered by key
pub type StateValues = BTreeMap<String, serde_json::Value>;

/// Where a checkpoint came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Written from the input of a fresh run
    Input,
    /// Written after a step committed inside the run loop
    Loop,
    /// Written when the run paused on an interrupt
    Interrupt,
    /// Written while continuing a previously interrupted run
    Resume,
}

/// Metadata associated with a checkpoint
///
/// The runtime stores its resume cursor here: `cursor` names the chain step
/// that executes next, `output` carries the last step output so that the
/// following step receives it as input after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// Name of the chain this thread runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,

    /// Name of the step that produced this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    /// Index of the chain step to execute next; `None` once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<usize>,

    /// Output of the step that produced this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// Whether the run finished with this checkpoint
    #[serde(default)]
    pub completed: bool,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    /// Create empty checkpoint metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the chain name
    pub fn with_chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }

    /// Set the producing step name
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Set the cursor of the next step
    pub fn with_cursor(mut self, cursor: Option<usize>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Set the step output
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Mark the run as completed
    pub fn completed(mut self) -> Self {
        self.completed = true;
        self.cursor = None;
        self
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A paused interrupt persisted alongside a checkpoint
///
/// Created when a run reaches an interrupt point. It is cleared once a resume
/// supplies the resolution value, which the runtime merges into the state
/// under `resolution_key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingInterrupt {
    /// Interrupt name; a resume must name the same interrupt
    pub name: String,

    /// Payload handed to whoever resolves the interrupt
    #[serde(default)]
    pub payload: serde_json::Value,

    /// State key the resolution value is written to
    pub resolution_key: String,

    /// Chain step the run continues with after the resume
    pub cursor: usize,

    /// Name of that chain step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    /// When the run paused
    pub created_at: DateTime<Utc>,
}

impl PendingInterrupt {
    pub fn new(
        name: impl Into<String>,
        payload: serde_json::Value,
        resolution_key: impl Into<String>,
        cursor: usize,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            resolution_key: resolution_key.into(),
            cursor,
            step: None,
            created_at: Utc::now(),
        }
    }

    /// Set the name of the step the run continues with
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

/// Content of a checkpoint before it is committed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointDraft {
    /// State values to persist
    pub state: StateValues,

    /// Pending interrupt, if the run is pausing
    pub pending_interrupt: Option<PendingInterrupt>,

    /// Checkpoint metadata
    pub metadata: CheckpointMetadata,
}

impl CheckpointDraft {
    /// Create a draft from state values
    pub fn new(state: StateValues) -> Self {
        Self {
            state,
            pending_interrupt: None,
            metadata: CheckpointMetadata::default(),
        }
    }

    /// Attach a pending interrupt
    pub fn with_interrupt(mut self, interrupt: PendingInterrupt) -> Self {
        self.pending_interrupt = Some(interrupt);
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: CheckpointMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A committed state snapshot of one thread at one step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Unique checkpoint id
    pub id: CheckpointId,

    /// Thread (run) this checkpoint belongs to
    pub thread_id: String,

    /// Position within the thread's history, 0-based and contiguous
    pub step_index: u64,

    /// Serialized state values
    pub state: StateValues,

    /// Optimistic concurrency token, incremented on every successful save
    pub version: u64,

    /// Commit timestamp
    pub created_at: DateTime<Utc>,

    /// Pending interrupt, present while the run is paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<PendingInterrupt>,

    /// Checkpoint metadata
    #[serde(default)]
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Commit a draft at the given position
    pub fn commit(
        thread_id: impl Into<String>,
        step_index: u64,
        version: u64,
        draft: CheckpointDraft,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            step_index,
            state: draft.state,
            version,
            created_at: Utc::now(),
            pending_interrupt: draft.pending_interrupt,
            metadata: draft.metadata,
        }
    }

    /// Whether the run is paused on an interrupt at this checkpoint
    pub fn is_interrupted(&self) -> bool {
        self.pending_interrupt.is_some()
    }

    /// Whether the run completed with this checkpoint
    pub fn is_completed(&self) -> bool {
        self.metadata.completed
    }
}

/// Step index the next save for a thread must pass as `expected_prev_step`
pub fn next_step_index(expected_prev_step: Option<u64>) -> u64 {
    expected_prev_step.map_or(0, |step| step + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_commit_assigns_position() {
        let mut state = StateValues::new();
        state.insert("count".to_string(), json!(2));

        let checkpoint = Checkpoint::commit("thread-1", 3, 4, CheckpointDraft::new(state));

        assert_eq!(checkpoint.thread_id, "thread-1");
        assert_eq!(checkpoint.step_index, 3);
        assert_eq!(checkpoint.version, 4);
        assert_eq!(checkpoint.state.get("count"), Some(&json!(2)));
        assert!(!checkpoint.id.is_empty());
        assert!(!checkpoint.is_interrupted());
    }

    #[test]
    fn test_next_step_index() {
        assert_eq!(next_step_index(None), 0);
        assert_eq!(next_step_index(Some(0)), 1);
        assert_eq!(next_step_index(Some(41)), 42);
    }

    #[test]
    fn test_metadata_completed_clears_cursor() {
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Loop)
            .with_cursor(Some(2))
            .completed();

        assert!(metadata.completed);
        assert_eq!(metadata.cursor, None);
    }

    #[test]
    fn test_record_serialization_keeps_interrupt() {
        let draft = CheckpointDraft::new(StateValues::new()).with_interrupt(
            PendingInterrupt::new("approval", json!({"amount": 10}), "approved", 2)
                .with_step("charge"),
        );
        let checkpoint = Checkpoint::commit("thread-1", 0, 1, draft);

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["pending_interrupt"]["name"], "approval");
        assert_eq!(value["pending_interrupt"]["cursor"], 2);

        let restored: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(restored, checkpoint);
    }

    #[test]
    fn test_metadata_extra_is_flattened() {
        let metadata = CheckpointMetadata::new().with_extra("tenant", json!("acme"));
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["tenant"], "acme");
        assert_eq!(value["completed"], false);
    }
}
