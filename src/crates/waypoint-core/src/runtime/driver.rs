//! Step-by-step execution of one run

use super::lease::LeaseKeeper;
use super::stream::StepEvent;
use super::{RunContext, RunOutcome, RunStatus, Runtime};
use crate::chain::{Chain, ChainStatus};
use crate::error::{Result, RuntimeError};
use crate::interrupt::{Interrupt, InterruptDescriptor};
use crate::middleware::{Handler, Request};
use crate::runnable::{Runnable, StepContext};
use crate::state::{State, StateSnapshot};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waypoint_checkpoint::{next_step_index, CheckpointDraft, CheckpointMetadata, CheckpointSource};

/// Bounds applied to one invocation
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_steps: usize,
    pub step_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl Limits {
    pub fn new(
        max_steps: usize,
        step_timeout: Option<Duration>,
        run_timeout: Option<Duration>,
    ) -> Self {
        Self {
            max_steps,
            step_timeout,
            run_timeout,
            deadline: run_timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    fn run_expired(&self) -> Option<RuntimeError> {
        match (self.deadline, self.run_timeout) {
            (Some(deadline), Some(timeout)) if Instant::now() >= deadline => {
                Some(RuntimeError::timeout("run", timeout))
            }
            _ => None,
        }
    }

    /// Time one attempt of `step` may take, and the error when it runs out
    fn attempt_budget(&self, step: &str) -> Option<(Duration, RuntimeError)> {
        let run_left = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        match (self.step_timeout, run_left, self.run_timeout) {
            (Some(step_limit), Some(left), Some(run)) if left < step_limit => {
                Some((left, RuntimeError::timeout("run", run)))
            }
            (Some(step_limit), _, _) => Some((
                step_limit,
                RuntimeError::timeout(format!("step '{}'", step), step_limit),
            )),
            (None, Some(left), Some(run)) => Some((left, RuntimeError::timeout("run", run))),
            _ => None,
        }
    }
}

/// Where a run starts
pub(crate) struct Launch {
    pub state: State,
    pub cursor: usize,
    pub input: Value,
    pub last_step: Option<u64>,
    pub source: CheckpointSource,
    /// Declared interrupt already answered at this position
    pub skip_interrupt_at: Option<usize>,
    /// Chain status the run starts from
    pub status: ChainStatus,
}

/// Result of advancing a run by one step
pub(crate) enum Progress {
    Stepped(StepEvent),
    Completed(StepEvent, RunOutcome),
    Paused(InterruptDescriptor),
}

/// Terminal handler running one step attempt below the middleware
struct StepHandler {
    runnable: Arc<dyn Runnable>,
    ctx: StepContext,
    snapshot: StateSnapshot,
    limits: Limits,
}

#[async_trait]
impl Handler for StepHandler {
    async fn call(&self, request: Request) -> Result<Value> {
        // A retried attempt starts from the state the first attempt saw
        if request.attempt > 0 {
            self.ctx.state().restore(&self.snapshot);
        }

        let work = self.runnable.invoke(request.input, &self.ctx);
        match self.limits.attempt_budget(self.ctx.step()) {
            Some((budget, elapsed)) => match tokio::time::timeout(budget, work).await {
                Ok(result) => result,
                Err(_) => Err(elapsed),
            },
            None => work.await,
        }
    }
}

/// Drives one invocation of a chain
pub(crate) struct RunDriver {
    runtime: Runtime,
    chain: Arc<Chain>,
    thread_id: String,
    state: State,
    cursor: usize,
    input: Value,
    last_step: Option<u64>,
    source: CheckpointSource,
    skip_interrupt_at: Option<usize>,
    status: ChainStatus,
    executed: usize,
    limits: Limits,
    cancellation: CancellationToken,
    lease: Option<LeaseKeeper>,
    context: HashMap<String, Value>,
}

impl RunDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Runtime,
        ctx: &RunContext,
        thread_id: &str,
        chain: Arc<Chain>,
        launch: Launch,
        limits: Limits,
        cancellation: CancellationToken,
        lease: Option<LeaseKeeper>,
    ) -> Self {
        debug!(
            thread_id,
            chain = %chain.name(),
            cursor = launch.cursor,
            last_step = ?launch.last_step,
            "Run starting"
        );
        Self {
            runtime,
            chain,
            thread_id: thread_id.to_string(),
            state: launch.state,
            cursor: launch.cursor,
            input: launch.input,
            last_step: launch.last_step,
            source: launch.source,
            skip_interrupt_at: launch.skip_interrupt_at,
            status: launch.status,
            executed: 0,
            limits,
            cancellation,
            lease,
            context: ctx.metadata().clone(),
        }
    }

    /// Step index of the latest checkpoint this run knows of
    pub fn last_step(&self) -> Option<u64> {
        self.last_step
    }

    /// Where the chain state machine currently stands
    pub fn status(&self) -> ChainStatus {
        self.status
    }

    fn transition(&mut self, next: ChainStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RuntimeError::validation(format!(
                "chain '{}' cannot move from {:?} to {:?}",
                self.chain.name(),
                self.status,
                next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Advance until the run completes, pauses or fails
    pub async fn run(mut self) -> Result<RunOutcome> {
        let result = loop {
            match self.advance().await {
                Ok(Progress::Stepped(_)) => continue,
                Ok(Progress::Completed(_, outcome)) => break Ok(outcome),
                Ok(Progress::Paused(descriptor)) => break Ok(RunOutcome::Interrupted(descriptor)),
                Err(err) => break Err(err),
            }
        };
        self.finish(RunStatus::of(&result)).await;
        result
    }

    /// Release the lease and log the end of the run
    pub async fn finish(&mut self, status: RunStatus) {
        if let Some(lease) = self.lease.as_mut() {
            lease.release().await;
        }
        info!(
            thread_id = %self.thread_id,
            chain = %self.chain.name(),
            status = ?status,
            steps = self.executed,
            last_step = ?self.last_step,
            "Run finished"
        );
    }

    fn check_boundary(&self) -> Result<()> {
        if let Some(lost) = self.lease.as_ref().and_then(LeaseKeeper::lost) {
            return Err(lost);
        }
        if self.cancellation.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if let Some(expired) = self.limits.run_expired() {
            return Err(expired);
        }
        if self.executed >= self.limits.max_steps {
            return Err(RuntimeError::StepLimit {
                limit: self.limits.max_steps,
            });
        }
        Ok(())
    }

    /// Execute the step at the cursor and commit its checkpoint
    ///
    /// Any error moves the chain to [`ChainStatus::Failed`].
    pub async fn advance(&mut self) -> Result<Progress> {
        let progress = self.step_once().await;
        if progress.is_err() {
            self.status = ChainStatus::Failed;
        }
        progress
    }

    async fn step_once(&mut self) -> Result<Progress> {
        self.check_boundary()?;

        let chain = self.chain.clone();
        let step = chain.require(self.cursor)?;
        self.transition(ChainStatus::Running(self.cursor))?;

        if let Some(point) = step.interrupt_before() {
            if self.skip_interrupt_at != Some(self.cursor) {
                return self.pause(point.clone(), step.name()).await;
            }
        }
        self.skip_interrupt_at = None;

        let step_index = next_step_index(self.last_step);
        let snapshot = self.state.snapshot();
        let handler = StepHandler {
            runnable: step.runnable().clone(),
            ctx: StepContext::new(self.thread_id.clone(), self.state.clone())
                .with_step(step.name(), step_index)
                .with_cancellation(self.cancellation.clone()),
            snapshot: snapshot.clone(),
            limits: self.limits,
        };

        let target = format!("{}.{}", chain.name(), step.name());
        let mut request = Request::new(target, self.input.clone())
            .with_context("thread_id", json!(self.thread_id))
            .with_context("step_index", json!(step_index));
        for (key, value) in &self.context {
            request.context.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let response = self.runtime.middleware().execute(request, &handler).await;
        let output = match response.result {
            Ok(output) => output,
            Err(RuntimeError::Interrupted(interrupt)) => {
                self.state.restore(&snapshot);
                if !step.is_interruptible() {
                    return Err(RuntimeError::validation(format!(
                        "step '{}' is not interruptible",
                        step.name()
                    )));
                }
                return self.pause(interrupt, step.name()).await;
            }
            Err(err) => {
                self.state.restore(&snapshot);
                warn!(
                    thread_id = %self.thread_id,
                    step = %step.name(),
                    step_index,
                    error = %err,
                    "Step failed"
                );
                return Err(err);
            }
        };

        let next = match chain.next_position(self.cursor, &self.state.snapshot()) {
            Ok(next) => next,
            Err(err) => {
                self.state.restore(&snapshot);
                return Err(err);
            }
        };

        let mut metadata = CheckpointMetadata::new()
            .with_source(self.source)
            .with_chain(chain.name())
            .with_step(step.name())
            .with_cursor(next)
            .with_output(output.clone());
        if next.is_none() {
            metadata = metadata.completed();
        }
        if response.metadata.retry_count > 0 {
            metadata = metadata.with_extra("retry_count", json!(response.metadata.retry_count));
        }
        if response.metadata.cache_hit {
            metadata = metadata.with_extra("cache_hit", json!(true));
        }

        let draft = CheckpointDraft::new(self.state.to_values()).with_metadata(metadata);
        if let Err(err) = self
            .runtime
            .checkpointer()
            .save(&self.thread_id, draft, self.last_step)
            .await
        {
            self.state.restore(&snapshot);
            return Err(err.into());
        }

        debug!(
            thread_id = %self.thread_id,
            step = %step.name(),
            step_index,
            retries = response.metadata.retry_count,
            cache_hit = response.metadata.cache_hit,
            latency = ?response.metadata.latency,
            "Step committed"
        );

        self.last_step = Some(step_index);
        self.source = CheckpointSource::Loop;
        self.executed += 1;

        let event = StepEvent::step(&self.thread_id, step_index, step.name(), output.clone());
        match next {
            Some(position) => {
                self.cursor = position;
                self.input = output;
                Ok(Progress::Stepped(event))
            }
            None => {
                self.transition(ChainStatus::Completed)?;
                let outcome = RunOutcome::Completed {
                    thread_id: self.thread_id.clone(),
                    output,
                    step_index,
                };
                Ok(Progress::Completed(event, outcome))
            }
        }
    }

    async fn pause(&mut self, interrupt: Interrupt, step: &str) -> Result<Progress> {
        self.transition(ChainStatus::Interrupted(self.cursor))?;
        let metadata = CheckpointMetadata::new()
            .with_chain(self.chain.name())
            .with_step(step)
            .with_output(self.input.clone());

        let descriptor = self
            .runtime
            .interrupts()
            .pause(
                &self.thread_id,
                self.last_step,
                &self.state,
                interrupt,
                self.cursor,
                step,
                metadata,
            )
            .await?;

        self.last_step = Some(descriptor.step_index);
        Ok(Progress::Paused(descriptor))
    }
}
