//! Human-in-the-loop interrupts
//!
//! An [`Interrupt`] pauses a run until someone outside the process supplies a
//! value. There are two ways to reach one:
//!
//! - **Declared**: [`ChainBuilder::interrupt_before`](crate::ChainBuilder::interrupt_before)
//!   places an interrupt point in front of a step. The run pauses when it
//!   arrives at that step and enters it directly once resumed.
//! - **Dynamic**: a step registered as interruptible returns
//!   `Err(RuntimeError::Interrupted(..))`, usually built with [`interrupt`].
//!   On resume the step runs again and finds the resolution in the state.
//!
//! Either way the runtime persists a checkpoint carrying a
//! [`PendingInterrupt`], halts, and hands the caller an
//! [`InterruptDescriptor`]. Nothing else executes until
//! [`Runtime::resume`](crate::Runtime::resume) is called, possibly from a
//! different process sharing the same checkpoint store.
//!
//! ```text
//!  invoke ─► step 0 ─► step 1 ─► ⏸ approval (checkpoint with pending interrupt)
//!                                     │
//!  resume(Resolution::new("approval", true))
//!                                     └─► state["approved"] = true ─► step 2 ─► step 3 ─► done
//! ```
//!
//! # Example: pausing from inside a step
//!
//! ```rust
//! use waypoint_core::{interrupt, StepContext, Result};
//! use serde_json::{json, Value};
//!
//! async fn charge(input: Value, ctx: StepContext) -> Result<Value> {
//!     let amount = input["amount"].as_i64().unwrap_or(0);
//!     if amount > 1_000 && !ctx.state().contains_key("manager_ok") {
//!         return Err(interrupt("manager_approval", json!({"amount": amount}), "manager_ok"));
//!     }
//!     Ok(json!({"charged": amount}))
//! }
//! ```

use crate::error::{Result, RuntimeError};
use crate::state::State;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use waypoint_checkpoint::{
    Checkpoint, CheckpointDraft, CheckpointId, CheckpointMetadata, CheckpointSource,
    Checkpointer, PendingInterrupt,
};

/// A named pause point awaiting external input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Interrupt name; the resume must name it
    pub name: String,

    /// Information for whoever resolves the interrupt
    #[serde(default)]
    pub payload: Value,

    /// State key the resolution value is merged into
    pub resolution_key: String,
}

impl Interrupt {
    /// Create an interrupt without payload
    pub fn new(name: impl Into<String>, resolution_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
            resolution_key: resolution_key.into(),
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn into_pending(self, cursor: usize, step: &str) -> PendingInterrupt {
        PendingInterrupt::new(self.name, self.payload, self.resolution_key, cursor).with_step(step)
    }
}

impl From<&PendingInterrupt> for Interrupt {
    fn from(pending: &PendingInterrupt) -> Self {
        Self {
            name: pending.name.clone(),
            payload: pending.payload.clone(),
            resolution_key: pending.resolution_key.clone(),
        }
    }
}

/// Build the error an interruptible step returns to pause the run
pub fn interrupt(
    name: impl Into<String>,
    payload: Value,
    resolution_key: impl Into<String>,
) -> RuntimeError {
    RuntimeError::Interrupted(Interrupt::new(name, resolution_key).with_payload(payload))
}

/// What the caller gets back when a run pauses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptDescriptor {
    /// Paused thread
    pub thread_id: String,

    /// Checkpoint holding the pending interrupt
    pub checkpoint_id: CheckpointId,

    /// Step index of that checkpoint
    pub step_index: u64,

    /// Chain step the run continues with
    pub step: Option<String>,

    /// The interrupt itself
    pub interrupt: Interrupt,
}

impl InterruptDescriptor {
    /// Describe the pending interrupt of a checkpoint
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Option<Self> {
        checkpoint.pending_interrupt.as_ref().map(|pending| Self {
            thread_id: checkpoint.thread_id.clone(),
            checkpoint_id: checkpoint.id.clone(),
            step_index: checkpoint.step_index,
            step: pending.step.clone(),
            interrupt: Interrupt::from(pending),
        })
    }
}

/// External input answering a pending interrupt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Name of the interrupt being answered
    pub interrupt: String,

    /// Value merged into the state at the interrupt's resolution key
    pub value: Value,
}

impl Resolution {
    pub fn new(interrupt: impl Into<String>, value: Value) -> Self {
        Self {
            interrupt: interrupt.into(),
            value,
        }
    }
}

/// Where a resumed thread picks up
#[derive(Debug, Clone)]
pub enum ResumePoint {
    /// The thread already finished; nothing to execute
    Completed(Checkpoint),

    /// Continue at `cursor` with the resolution merged into `state`
    Continue {
        checkpoint: Checkpoint,
        state: State,
        cursor: usize,
        input: Value,
    },
}

/// Persists and resolves pending interrupts
#[derive(Clone)]
pub struct InterruptController {
    checkpointer: Arc<dyn Checkpointer>,
}

impl std::fmt::Debug for InterruptController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptController").finish_non_exhaustive()
    }
}

impl InterruptController {
    pub fn new(checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self { checkpointer }
    }

    /// Persist a pause point and describe it
    ///
    /// `state` is the last committed state and `metadata` carries the chain
    /// name and the input of the step at `cursor`; both are written unchanged
    /// next to the pending interrupt.
    #[allow(clippy::too_many_arguments)]
    pub async fn pause(
        &self,
        thread_id: &str,
        expected_prev_step: Option<u64>,
        state: &State,
        interrupt: Interrupt,
        cursor: usize,
        step: &str,
        metadata: CheckpointMetadata,
    ) -> Result<InterruptDescriptor> {
        let pending = interrupt.clone().into_pending(cursor, step);
        let draft = CheckpointDraft::new(state.to_values())
            .with_interrupt(pending)
            .with_metadata(
                metadata
                    .with_source(CheckpointSource::Interrupt)
                    .with_cursor(Some(cursor)),
            );

        let checkpoint_id = self
            .checkpointer
            .save(thread_id, draft, expected_prev_step)
            .await?;
        let step_index = waypoint_checkpoint::next_step_index(expected_prev_step);

        info!(
            thread_id,
            interrupt = %interrupt.name,
            step,
            step_index,
            "Run paused on interrupt"
        );

        Ok(InterruptDescriptor {
            thread_id: thread_id.to_string(),
            checkpoint_id,
            step_index,
            step: Some(step.to_string()),
            interrupt,
        })
    }

    /// Pending interrupt of a thread's latest checkpoint
    pub async fn pending(&self, thread_id: &str) -> Result<Option<InterruptDescriptor>> {
        Ok(self
            .checkpointer
            .latest(thread_id)
            .await?
            .as_ref()
            .and_then(InterruptDescriptor::from_checkpoint))
    }

    /// Validate a resolution against the latest checkpoint and merge it
    ///
    /// Nothing is written: the pending interrupt is cleared by the next
    /// checkpoint the resumed run commits, so a resume that fails before
    /// then can simply be repeated.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::NotFound`] for an unknown thread
    /// - [`RuntimeError::InvalidResumption`] if no interrupt is pending or
    ///   the resolution names a different one
    pub async fn resume(&self, thread_id: &str, resolution: Resolution) -> Result<ResumePoint> {
        let checkpoint = self.checkpointer.load(thread_id, None).await?;

        if checkpoint.is_completed() {
            debug!(thread_id, "Resume on completed thread");
            return Ok(ResumePoint::Completed(checkpoint));
        }

        let Some(pending) = checkpoint.pending_interrupt.clone() else {
            return Err(RuntimeError::InvalidResumption(format!(
                "thread '{}' has no pending interrupt",
                thread_id
            )));
        };

        if pending.name != resolution.interrupt {
            return Err(RuntimeError::InvalidResumption(format!(
                "thread '{}' is waiting on '{}', not '{}'",
                thread_id, pending.name, resolution.interrupt
            )));
        }

        let state = State::from_values(checkpoint.state.clone());
        state.set(pending.resolution_key.clone(), resolution.value);
        let input = checkpoint.metadata.output.clone().unwrap_or(Value::Null);

        info!(
            thread_id,
            interrupt = %pending.name,
            resolution_key = %pending.resolution_key,
            "Interrupt resolved"
        );

        Ok(ResumePoint::Continue {
            checkpoint,
            state,
            cursor: pending.cursor,
            input,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypoint_checkpoint::LocalCheckpointer;

    fn controller() -> (InterruptController, Arc<LocalCheckpointer>) {
        let checkpointer = Arc::new(LocalCheckpointer::new());
        (InterruptController::new(checkpointer.clone()), checkpointer)
    }

    async fn paused(controller: &InterruptController) -> InterruptDescriptor {
        let state = State::new();
        state.set("order", json!(7));
        controller
            .pause(
                "t1",
                None,
                &state,
                Interrupt::new("approval", "approved").with_payload(json!({"total": 12})),
                2,
                "charge",
                CheckpointMetadata::new()
                    .with_chain("orders")
                    .with_output(json!({"validated": true})),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pause_persists_pending_interrupt() {
        let (controller, checkpointer) = controller();

        let descriptor = paused(&controller).await;
        assert_eq!(descriptor.step_index, 0);
        assert_eq!(descriptor.step.as_deref(), Some("charge"));

        let latest = checkpointer.load("t1", None).await.unwrap();
        let pending = latest.pending_interrupt.unwrap();
        assert_eq!(pending.name, "approval");
        assert_eq!(pending.cursor, 2);
        assert_eq!(latest.metadata.source, Some(CheckpointSource::Interrupt));
        assert_eq!(
            controller.pending("t1").await.unwrap().unwrap().interrupt.payload,
            json!({"total": 12})
        );
    }

    #[tokio::test]
    async fn test_resume_merges_resolution() {
        let (controller, _) = controller();
        paused(&controller).await;

        let point = controller
            .resume("t1", Resolution::new("approval", json!(true)))
            .await
            .unwrap();

        match point {
            ResumePoint::Continue {
                state,
                cursor,
                input,
                ..
            } => {
                assert_eq!(cursor, 2);
                assert_eq!(state.get("approved"), Some(json!(true)));
                assert_eq!(state.get("order"), Some(json!(7)));
                assert_eq!(input, json!({"validated": true}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resume_rejects_wrong_name_and_missing_interrupt() {
        let (controller, checkpointer) = controller();

        assert!(matches!(
            controller.resume("t1", Resolution::new("approval", json!(1))).await,
            Err(RuntimeError::NotFound(_))
        ));

        paused(&controller).await;
        assert!(matches!(
            controller.resume("t1", Resolution::new("other", json!(1))).await,
            Err(RuntimeError::InvalidResumption(_))
        ));

        // A later checkpoint without interrupt means nothing is pending
        checkpointer
            .save(
                "t1",
                CheckpointDraft::new(Default::default())
                    .with_metadata(CheckpointMetadata::new().with_cursor(Some(3))),
                Some(0),
            )
            .await
            .unwrap();
        assert!(matches!(
            controller.resume("t1", Resolution::new("approval", json!(1))).await,
            Err(RuntimeError::InvalidResumption(_))
        ));
    }

    #[test]
    fn test_interrupt_helper() {
        let err = interrupt("review", json!({"doc": 1}), "review_result");
        match err {
            RuntimeError::Interrupted(i) => {
                assert_eq!(i.name, "review");
                assert_eq!(i.resolution_key, "review_result");
            }
            other => panic!("unexpected: {other}"),
        }
    }
}
