//! Ordered steps with state-driven routing
//!
//! A [`Chain`] is a sequence of named steps. After a step succeeds its
//! optional router looks at a snapshot of the state and picks what runs
//! next:
//!
//! - [`Route::Next`] continues with the following step (or completes after
//!   the last one),
//! - [`Route::Goto`] jumps to a named step, forwards or backwards,
//! - [`Route::End`] completes the chain.
//!
//! There is no fan-out or join: branching is local to each step.
//!
//! # Execution state machine
//!
//! ```text
//!            invoke
//!  Pending ─────────► Running(0) ──success──► Running(i+1) / Running(goto)
//!                        │   │                      │
//!                        │   └──pause──► Interrupted(i) ──resume──► Running(i)
//!                        │
//!                        ├──error──► Failed        (terminal)
//!                        └──last step / End──► Completed  (terminal)
//! ```
//!
//! The runtime drives this machine one step at a time and checkpoints in
//! between. A `Chain` is also a [`Runnable`] itself, executed in memory
//! without checkpoints, so a chain can be used as a step of another chain.
//!
//! # Example
//!
//! ```rust
//! use waypoint_core::{Chain, Interrupt, Passthrough, Route};
//!
//! let chain = Chain::builder("orders")
//!     .step("validate", Passthrough)
//!     .step("review", Passthrough)
//!     .step("charge", Passthrough)
//!     .route("validate", |state| {
//!         if state.get_bool("needs_review") == Some(true) {
//!             Route::Next
//!         } else {
//!             Route::goto("charge")
//!         }
//!     })
//!     .interrupt_before("charge", Interrupt::new("approval", "approved"))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(chain.len(), 3);
//! ```

use crate::error::{Result, RuntimeError};
use crate::interrupt::Interrupt;
use crate::runnable::{FnRunnable, Runnable, StepContext, ValueStream};
use crate::state::StateSnapshot;
use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Default bound on steps executed by one in-memory chain invocation
pub const DEFAULT_MAX_STEPS: usize = 100;

/// Routing decision taken after a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Continue with the following step
    Next,
    /// Continue with the named step
    Goto(String),
    /// Complete the chain
    End,
}

impl Route {
    pub fn goto(step: impl Into<String>) -> Self {
        Route::Goto(step.into())
    }
}

/// Routing function evaluated over a state snapshot
pub type Router = Arc<dyn Fn(&StateSnapshot) -> Route + Send + Sync>;

/// Execution status of a chain run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "step")]
pub enum ChainStatus {
    /// Not started
    Pending,
    /// Executing the step at this position
    Running(usize),
    /// Paused before or inside the step at this position
    Interrupted(usize),
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl ChainStatus {
    /// Completed and Failed admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainStatus::Completed | ChainStatus::Failed)
    }

    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: ChainStatus) -> bool {
        use ChainStatus::*;
        match (self, next) {
            (Pending, Running(0)) | (Pending, Interrupted(0)) => true,
            (Running(_), Running(_)) => true,
            (Running(i), Interrupted(j)) => *i == j,
            (Running(_), Completed) | (Running(_), Failed) => true,
            (Interrupted(i), Running(j)) => *i == j,
            (Pending, Failed) | (Interrupted(_), Failed) => true,
            _ => false,
        }
    }
}

impl Default for ChainStatus {
    fn default() -> Self {
        ChainStatus::Pending
    }
}

/// One step of a chain
pub struct ChainStep {
    name: String,
    runnable: Arc<dyn Runnable>,
    router: Option<Router>,
    interrupt_before: Option<Interrupt>,
    interruptible: bool,
}

impl std::fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStep")
            .field("name", &self.name)
            .field("routed", &self.router.is_some())
            .field("interrupt_before", &self.interrupt_before)
            .field("interruptible", &self.interruptible)
            .finish()
    }
}

impl ChainStep {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runnable(&self) -> &Arc<dyn Runnable> {
        &self.runnable
    }

    /// Declared interrupt point in front of this step
    pub fn interrupt_before(&self) -> Option<&Interrupt> {
        self.interrupt_before.as_ref()
    }

    /// Whether the step may pause the run from inside
    pub fn is_interruptible(&self) -> bool {
        self.interruptible
    }

    /// Routing decision for a snapshot taken after this step ran
    pub fn route(&self, snapshot: &StateSnapshot) -> Route {
        self.router.as_ref().map_or(Route::Next, |router| router(snapshot))
    }
}

/// Named, validated sequence of steps
#[derive(Debug)]
pub struct Chain {
    name: String,
    steps: Vec<ChainStep>,
    positions: HashMap<String, usize>,
    max_steps: usize,
}

impl Chain {
    /// Start building a chain
    pub fn builder(name: impl Into<String>) -> ChainBuilder {
        ChainBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, position: usize) -> Option<&ChainStep> {
        self.steps.get(position)
    }

    /// Position of a step by name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    /// Step budget for in-memory invocation
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub(crate) fn require(&self, position: usize) -> Result<&ChainStep> {
        self.steps.get(position).ok_or_else(|| {
            RuntimeError::validation(format!(
                "chain '{}' has no step at position {}",
                self.name, position
            ))
        })
    }

    /// Position to run after the step at `current`, `None` to complete
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Validation`] when the router names an unknown step.
    pub fn next_position(&self, current: usize, snapshot: &StateSnapshot) -> Result<Option<usize>> {
        let step = self.require(current)?;
        match step.route(snapshot) {
            Route::Next if current + 1 < self.steps.len() => Ok(Some(current + 1)),
            Route::Next | Route::End => Ok(None),
            Route::Goto(target) => self.position(&target).map(Some).ok_or_else(|| {
                RuntimeError::validation(format!(
                    "step '{}' routed to unknown step '{}'",
                    step.name, target
                ))
            }),
        }
    }
}

/// In-memory execution without checkpoints
///
/// Each step sees the caller's state. A declared interrupt point fires
/// unless the state already holds its resolution key, and an interrupt
/// raised by an interruptible step is returned as
/// [`RuntimeError::Interrupted`], so an enclosing interruptible step pauses
/// the outer run and re-enters this chain on resume.
#[async_trait]
impl Runnable for Chain {
    async fn invoke(&self, input: Value, ctx: &StepContext) -> Result<Value> {
        self.run_in_memory(input, ctx, None).await
    }

    /// Yields the output of every step in execution order
    ///
    /// A failing step ends the stream with its error after the outputs of
    /// the steps before it.
    async fn stream(&self, input: Value, ctx: &StepContext) -> Result<ValueStream> {
        let mut partials = Vec::new();
        let outcome = self.run_in_memory(input, ctx, Some(&mut partials)).await;
        let mut items: Vec<Result<Value>> = partials.into_iter().map(Ok).collect();
        if let Err(err) = outcome {
            items.push(Err(err));
        }
        Ok(Box::pin(stream::iter(items)))
    }
}

impl Chain {
    async fn run_in_memory(
        &self,
        input: Value,
        ctx: &StepContext,
        mut partials: Option<&mut Vec<Value>>,
    ) -> Result<Value> {
        let mut position = 0usize;
        let mut output = input;
        let mut executed = 0usize;

        loop {
            if ctx.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            if executed >= self.max_steps {
                return Err(RuntimeError::StepLimit {
                    limit: self.max_steps,
                });
            }

            let step = self.require(position)?;
            if let Some(point) = &step.interrupt_before {
                if !ctx.state().contains_key(&point.resolution_key) {
                    return Err(RuntimeError::Interrupted(point.clone()));
                }
            }

            let step_ctx = ctx.clone().with_step(step.name.clone(), ctx.step_index());
            output = match step.runnable.invoke(output, &step_ctx).await {
                Ok(value) => value,
                Err(err) if err.is_interrupt() && !step.interruptible => {
                    return Err(RuntimeError::validation(format!(
                        "step '{}' is not interruptible",
                        step.name
                    )));
                }
                Err(err) => return Err(err),
            };
            executed += 1;
            if let Some(partials) = partials.as_deref_mut() {
                partials.push(output.clone());
            }

            match self.next_position(position, &ctx.state().snapshot())? {
                Some(next) => position = next,
                None => {
                    debug!(chain = %self.name, steps = executed, "Chain completed in memory");
                    return Ok(output);
                }
            }
        }
    }
}

struct StepSpec {
    name: String,
    runnable: Arc<dyn Runnable>,
    interruptible: bool,
}

/// Builder for [`Chain`]
pub struct ChainBuilder {
    name: String,
    steps: Vec<StepSpec>,
    routers: Vec<(String, Router)>,
    interrupts: Vec<(String, Interrupt)>,
    max_steps: usize,
}

impl ChainBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            routers: Vec::new(),
            interrupts: Vec::new(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Append a step
    pub fn step(self, name: impl Into<String>, runnable: impl Runnable + 'static) -> Self {
        self.push(name.into(), Arc::new(runnable), false)
    }

    /// Append a shared runnable as a step
    pub fn step_arc(self, name: impl Into<String>, runnable: Arc<dyn Runnable>) -> Self {
        self.push(name.into(), runnable, false)
    }

    /// Append a closure step
    pub fn step_fn<F, Fut>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let runnable = FnRunnable::new(name.clone(), func);
        self.push(name, Arc::new(runnable), false)
    }

    /// Append a step allowed to pause the run by returning an interrupt
    pub fn interruptible_step(
        self,
        name: impl Into<String>,
        runnable: impl Runnable + 'static,
    ) -> Self {
        self.push(name.into(), Arc::new(runnable), true)
    }

    fn push(mut self, name: String, runnable: Arc<dyn Runnable>, interruptible: bool) -> Self {
        self.steps.push(StepSpec {
            name,
            runnable,
            interruptible,
        });
        self
    }

    /// Attach a router to a step
    pub fn route<F>(mut self, step: impl Into<String>, router: F) -> Self
    where
        F: Fn(&StateSnapshot) -> Route + Send + Sync + 'static,
    {
        self.routers.push((step.into(), Arc::new(router)));
        self
    }

    /// Declare an interrupt point in front of a step
    pub fn interrupt_before(mut self, step: impl Into<String>, interrupt: Interrupt) -> Self {
        self.interrupts.push((step.into(), interrupt));
        self
    }

    /// Bound the steps of one in-memory invocation
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Validate and build the chain
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Validation`] if the chain is empty, a step name is
    /// empty or repeated, a router or interrupt names an unknown step, a step
    /// has two routers or two interrupt points, or `max_steps` is zero.
    pub fn build(self) -> Result<Chain> {
        if self.name.is_empty() {
            return Err(RuntimeError::validation("chain name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(RuntimeError::validation(format!(
                "chain '{}' has no steps",
                self.name
            )));
        }
        if self.max_steps == 0 {
            return Err(RuntimeError::validation("max_steps must be at least 1"));
        }

        let mut positions = HashMap::new();
        for (position, spec) in self.steps.iter().enumerate() {
            if spec.name.is_empty() {
                return Err(RuntimeError::validation(format!(
                    "chain '{}' has a step without name",
                    self.name
                )));
            }
            if positions.insert(spec.name.clone(), position).is_some() {
                return Err(RuntimeError::validation(format!(
                    "chain '{}' has duplicate step '{}'",
                    self.name, spec.name
                )));
            }
        }

        let mut steps: Vec<ChainStep> = self
            .steps
            .into_iter()
            .map(|spec| ChainStep {
                name: spec.name,
                runnable: spec.runnable,
                router: None,
                interrupt_before: None,
                interruptible: spec.interruptible,
            })
            .collect();

        for (step, router) in self.routers {
            let position = *positions.get(&step).ok_or_else(|| {
                RuntimeError::validation(format!("router attached to unknown step '{}'", step))
            })?;
            if steps[position].router.replace(router).is_some() {
                return Err(RuntimeError::validation(format!(
                    "step '{}' has more than one router",
                    step
                )));
            }
        }

        for (step, interrupt) in self.interrupts {
            let position = *positions.get(&step).ok_or_else(|| {
                RuntimeError::validation(format!(
                    "interrupt declared before unknown step '{}'",
                    step
                ))
            })?;
            if interrupt.name.is_empty() || interrupt.resolution_key.is_empty() {
                return Err(RuntimeError::validation(format!(
                    "interrupt before '{}' needs a name and a resolution key",
                    step
                )));
            }
            if steps[position].interrupt_before.replace(interrupt).is_some() {
                return Err(RuntimeError::validation(format!(
                    "step '{}' has more than one interrupt point",
                    step
                )));
            }
        }

        Ok(Chain {
            name: self.name,
            steps,
            positions,
            max_steps: self.max_steps,
        })
    }
}
