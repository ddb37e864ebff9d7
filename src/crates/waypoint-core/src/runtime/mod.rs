//! Durable execution of chains
//!
//! The [`Runtime`] drives a [`Chain`] one step at a time. Every step runs
//! through the runtime's [`MiddlewareChain`] and, once it succeeds, the new
//! state is committed as a checkpoint before the run advances. A run ends in
//! exactly one of three ways:
//!
//! - **completed**: [`RunOutcome::Completed`] with the last step's output,
//! - **interrupted**: [`RunOutcome::Interrupted`] with a descriptor of the
//!   pending interrupt, to be answered through [`Runtime::resume`],
//! - **failed**: `Err(RuntimeError)`; checkpoints committed before the
//!   failure stay valid.
//!
//! ```text
//!   invoke ──► lease ──► [interrupt point?] ──► middleware(step) ──► save checkpoint ──► route
//!                              │                                                         │
//!                              └──► save pending interrupt ──► Interrupted     next ◄────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use waypoint_core::{
//!     Chain, Interrupt, InvokeOptions, Passthrough, Resolution, RunContext, RunOutcome, Runtime,
//!     StepContext,
//! };
//! use waypoint_core::middleware::MiddlewareChain;
//! use waypoint_checkpoint::LocalCheckpointer;
//!
//! # async fn example() -> waypoint_core::Result<()> {
//! let chain = Arc::new(
//!     Chain::builder("refund")
//!         .step_fn("assess", |input: Value, ctx: StepContext| async move {
//!             ctx.state().set("amount", input["amount"].clone());
//!             Ok(input)
//!         })
//!         .step("pay", Passthrough)
//!         .interrupt_before("pay", Interrupt::new("approval", "approved"))
//!         .build()?,
//! );
//!
//! let runtime = Runtime::new(Arc::new(LocalCheckpointer::new()), MiddlewareChain::new());
//! let ctx = RunContext::for_thread("refund-42");
//!
//! let outcome = runtime
//!     .invoke(&ctx, chain, json!({"amount": 30}), InvokeOptions::default())
//!     .await?;
//! assert!(outcome.is_interrupted());
//!
//! let outcome = runtime
//!     .resume(&ctx, "refund-42", Resolution::new("approval", json!(true)))
//!     .await?;
//! assert!(matches!(outcome, RunOutcome::Completed { .. }));
//! # Ok(())
//! # }
//! ```

mod driver;
mod lease;
mod stream;

pub use stream::{RunStream, StepEvent};

use crate::chain::{Chain, ChainStatus};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::interrupt::{InterruptController, InterruptDescriptor, Resolution, ResumePoint};
use crate::middleware::MiddlewareChain;
use crate::state::State;
use driver::{Launch, Limits, Progress, RunDriver};
use futures::{Stream, StreamExt};
use lease::LeaseKeeper;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use waypoint_checkpoint::{Checkpoint, CheckpointSource, Checkpointer};

/// Caller-side context of a run
///
/// Carries the thread id, the cancellation token and free-form metadata
/// that is handed to every middleware request.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    thread_id: Option<String>,
    cancellation: CancellationToken,
    metadata: HashMap<String, Value>,
}

impl RunContext {
    /// Context for a new thread with a generated id
    pub fn new() -> Self {
        Self::default()
    }

    /// Context bound to an existing or chosen thread id
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self::default().with_thread_id(thread_id)
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Use an existing cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Attach metadata visible to middleware as request context
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Ask every run using this context to stop at its next step boundary
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    fn resolve_thread_id(&self) -> String {
        self.thread_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

/// Per-invocation overrides of [`RuntimeConfig`] defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvokeOptions {
    /// Deadline for the whole invocation
    pub timeout: Option<Duration>,

    /// Deadline for each step attempt
    pub step_timeout: Option<Duration>,

    /// Steps this invocation may execute
    pub max_steps: Option<usize>,

    /// Stream events retained by [`RunStream::history`]
    pub history: Option<usize>,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_history(mut self, events: usize) -> Self {
        self.history = Some(events);
        self
    }

    fn limits(&self, config: &RuntimeConfig) -> Limits {
        Limits::new(
            self.max_steps.unwrap_or(config.max_steps),
            self.step_timeout.or_else(|| config.step_timeout()),
            self.timeout.or_else(|| config.run_timeout()),
        )
    }
}

/// How a run that did not fail ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The chain finished
    Completed {
        thread_id: String,
        output: Value,
        step_index: u64,
    },

    /// The run paused on an interrupt
    Interrupted(InterruptDescriptor),
}

impl RunOutcome {
    fn from_completed(checkpoint: &Checkpoint) -> Self {
        RunOutcome::Completed {
            thread_id: checkpoint.thread_id.clone(),
            output: checkpoint.metadata.output.clone().unwrap_or(Value::Null),
            step_index: checkpoint.step_index,
        }
    }

    pub fn thread_id(&self) -> &str {
        match self {
            RunOutcome::Completed { thread_id, .. } => thread_id,
            RunOutcome::Interrupted(descriptor) => &descriptor.thread_id,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed { .. } => RunStatus::Completed,
            RunOutcome::Interrupted(_) => RunStatus::Interrupted,
        }
    }

    /// Final output of a completed run
    pub fn output(&self) -> Option<&Value> {
        match self {
            RunOutcome::Completed { output, .. } => Some(output),
            RunOutcome::Interrupted(_) => None,
        }
    }

    /// Pending interrupt of a paused run
    pub fn interrupt(&self) -> Option<&InterruptDescriptor> {
        match self {
            RunOutcome::Interrupted(descriptor) => Some(descriptor),
            RunOutcome::Completed { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunOutcome::Interrupted(_))
    }
}

/// Externally visible status of a finished invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn of(result: &Result<RunOutcome>) -> Self {
        match result {
            Ok(outcome) => outcome.status(),
            Err(_) => RunStatus::Failed,
        }
    }
}

/// Executes chains with checkpointing, middleware and interrupts
#[derive(Clone)]
pub struct Runtime {
    checkpointer: Arc<dyn Checkpointer>,
    middleware: MiddlewareChain,
    config: RuntimeConfig,
    chains: Arc<RwLock<HashMap<String, Arc<Chain>>>>,
    interrupts: InterruptController,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("middleware", &self.middleware)
            .field("config", &self.config)
            .field("chains", &self.chains.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create a runtime with the default configuration
    pub fn new(checkpointer: Arc<dyn Checkpointer>, middleware: MiddlewareChain) -> Self {
        Self {
            interrupts: InterruptController::new(checkpointer.clone()),
            checkpointer,
            middleware,
            config: RuntimeConfig::default(),
            chains: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }

    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    /// Make a chain resumable by name
    ///
    /// Chains passed to [`invoke`](Self::invoke) are registered
    /// automatically; a fresh process that only resumes or recovers threads
    /// must register the chains they were started with.
    pub fn register(&self, chain: Arc<Chain>) {
        let name = chain.name().to_string();
        if self.chains.write().insert(name.clone(), chain).is_none() {
            debug!(chain = %name, "Chain registered");
        }
    }

    /// Registered chain by name
    pub fn chain(&self, name: &str) -> Option<Arc<Chain>> {
        self.chains.read().get(name).cloned()
    }

    /// Run a chain to completion, interruption or failure
    ///
    /// The run uses the thread of `ctx` (a new one when unset). Step 0
    /// receives `input`; an object input is also merged into the state. A
    /// thread with earlier checkpoints continues from its latest committed
    /// state, appending after its latest step.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Validation`] if the thread waits on an interrupt
    /// - any step failure that middleware did not recover from
    /// - [`RuntimeError::Timeout`], [`RuntimeError::StepLimit`],
    ///   [`RuntimeError::Cancelled`]
    /// - [`RuntimeError::LeaseConflict`] / [`RuntimeError::VersionConflict`]
    ///   when another worker owns the thread
    #[tracing::instrument(
        skip(self, ctx, chain, input, options),
        fields(chain = %chain.name(), thread_id = tracing::field::Empty)
    )]
    pub async fn invoke(
        &self,
        ctx: &RunContext,
        chain: Arc<Chain>,
        input: Value,
        options: InvokeOptions,
    ) -> Result<RunOutcome> {
        let thread_id = ctx.resolve_thread_id();
        tracing::Span::current().record("thread_id", thread_id.as_str());

        let driver = self.start(ctx, &thread_id, chain, input, &options).await?;
        driver.run().await
    }

    /// Run a chain, yielding one event per step and a final `done` event
    ///
    /// The stream is pull-driven: nothing executes between polls. Dropping
    /// it or cancelling `ctx` stops the run at the next step boundary and
    /// the last checkpoint remains the resume point.
    pub fn stream(
        &self,
        ctx: &RunContext,
        chain: Arc<Chain>,
        input: Value,
        options: InvokeOptions,
    ) -> RunStream {
        let thread_id = ctx.resolve_thread_id();
        let history = options.history.unwrap_or(self.config.stream_history);
        let runtime = self.clone();
        let ctx = ctx.clone();
        let thread = thread_id.clone();

        let events = async_stream::stream! {
            match runtime.start(&ctx, &thread, chain, input, &options).await {
                Err(err) => {
                    yield StepEvent::failed(&thread, None, err);
                }
                Ok(driver) => {
                    let mut steps = Box::pin(drive(driver, thread));
                    while let Some(event) = steps.next().await {
                        yield event;
                    }
                }
            }
        };

        RunStream::new(thread_id, Box::pin(events), history)
    }

    /// Answer a pending interrupt and keep driving the thread
    ///
    /// A thread that already completed returns its stored output without
    /// executing anything.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::NotFound`] for an unknown thread or an unregistered
    ///   chain
    /// - [`RuntimeError::InvalidResumption`] if the resolution does not
    ///   match the pending interrupt
    #[tracing::instrument(skip(self, ctx, resolution), fields(interrupt = %resolution.interrupt))]
    pub async fn resume(
        &self,
        ctx: &RunContext,
        thread_id: &str,
        resolution: Resolution,
    ) -> Result<RunOutcome> {
        self.resume_with_options(ctx, thread_id, resolution, InvokeOptions::default())
            .await
    }

    /// [`resume`](Self::resume) with per-invocation options
    pub async fn resume_with_options(
        &self,
        ctx: &RunContext,
        thread_id: &str,
        resolution: Resolution,
        options: InvokeOptions,
    ) -> Result<RunOutcome> {
        match self.prepare_resume(ctx, thread_id, resolution, &options).await? {
            Resumed::Done(checkpoint) => Ok(RunOutcome::from_completed(&checkpoint)),
            Resumed::Continue(driver) => driver.run().await,
        }
    }

    /// Answer a pending interrupt and stream the rest of the run
    ///
    /// Events follow the same rules as [`stream`](Self::stream). A thread
    /// that already completed yields a single `done` event with its stored
    /// output.
    pub fn resume_stream(
        &self,
        ctx: &RunContext,
        thread_id: &str,
        resolution: Resolution,
        options: InvokeOptions,
    ) -> RunStream {
        let history = options.history.unwrap_or(self.config.stream_history);
        let runtime = self.clone();
        let ctx = ctx.clone();
        let thread = thread_id.to_string();

        let events = async_stream::stream! {
            match runtime.prepare_resume(&ctx, &thread, resolution, &options).await {
                Err(err) => {
                    yield StepEvent::failed(&thread, None, err);
                }
                Ok(Resumed::Done(checkpoint)) => {
                    yield StepEvent::finished(&RunOutcome::from_completed(&checkpoint));
                }
                Ok(Resumed::Continue(driver)) => {
                    let mut steps = Box::pin(drive(driver, thread));
                    while let Some(event) = steps.next().await {
                        yield event;
                    }
                }
            }
        };

        RunStream::new(thread_id.to_string(), Box::pin(events), history)
    }

    async fn prepare_resume(
        &self,
        ctx: &RunContext,
        thread_id: &str,
        resolution: Resolution,
        options: &InvokeOptions,
    ) -> Result<Resumed> {
        let cancellation = ctx.cancellation().child_token();
        let lease = self.lease(thread_id, &cancellation).await?;

        match self.interrupts.resume(thread_id, resolution).await? {
            ResumePoint::Completed(checkpoint) => {
                info!(thread_id, "Thread already completed, returning stored output");
                if let Some(mut lease) = lease {
                    lease.release().await;
                }
                Ok(Resumed::Done(checkpoint))
            }
            ResumePoint::Continue {
                checkpoint,
                state,
                cursor,
                input,
            } => {
                let chain = self.chain_of(&checkpoint)?;
                let launch = Launch {
                    state,
                    cursor,
                    input,
                    last_step: Some(checkpoint.step_index),
                    source: CheckpointSource::Resume,
                    skip_interrupt_at: Some(cursor),
                    status: ChainStatus::Interrupted(cursor),
                };
                Ok(Resumed::Continue(RunDriver::new(
                    self.clone(),
                    ctx,
                    thread_id,
                    chain,
                    launch,
                    options.limits(&self.config),
                    cancellation,
                    lease,
                )))
            }
        }
    }

    /// Continue a thread whose last run stopped between steps
    ///
    /// Used after a crash or a cancellation: execution picks up at the
    /// cursor stored in the latest checkpoint. Completed threads return
    /// their output and interrupted threads their pending interrupt,
    /// without executing anything.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn recover(&self, ctx: &RunContext, thread_id: &str) -> Result<RunOutcome> {
        let cancellation = ctx.cancellation().child_token();
        let lease = self.lease(thread_id, &cancellation).await?;
        let checkpoint = self.checkpointer.load(thread_id, None).await?;

        if checkpoint.is_completed() {
            return Ok(RunOutcome::from_completed(&checkpoint));
        }
        if let Some(descriptor) = InterruptDescriptor::from_checkpoint(&checkpoint) {
            return Ok(RunOutcome::Interrupted(descriptor));
        }

        let cursor = checkpoint.metadata.cursor.ok_or_else(|| {
            RuntimeError::validation(format!(
                "checkpoint {} of thread '{}' has no cursor to continue from",
                checkpoint.step_index, thread_id
            ))
        })?;
        let chain = self.chain_of(&checkpoint)?;
        info!(thread_id, cursor, step_index = checkpoint.step_index, "Recovering thread");

        let launch = Launch {
            state: State::from_values(checkpoint.state.clone()),
            cursor,
            input: checkpoint.metadata.output.clone().unwrap_or(Value::Null),
            last_step: Some(checkpoint.step_index),
            source: CheckpointSource::Loop,
            skip_interrupt_at: None,
            status: ChainStatus::Running(cursor),
        };
        RunDriver::new(
            self.clone(),
            ctx,
            thread_id,
            chain,
            launch,
            InvokeOptions::default().limits(&self.config),
            cancellation,
            lease,
        )
        .run()
        .await
    }

    /// Committed state of a thread
    pub async fn state(&self, thread_id: &str) -> Result<State> {
        let checkpoint = self.checkpointer.load(thread_id, None).await?;
        Ok(State::from_values(checkpoint.state))
    }

    /// Every checkpoint of a thread, oldest first
    pub async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.checkpointer.list(thread_id).await?)
    }

    /// Pending interrupt of a thread, if it is paused
    pub async fn pending(&self, thread_id: &str) -> Result<Option<InterruptDescriptor>> {
        self.interrupts.pending(thread_id).await
    }

    pub(crate) fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    async fn lease(
        &self,
        thread_id: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<LeaseKeeper>> {
        if thread_id.is_empty() {
            return Err(RuntimeError::validation("thread id must not be empty"));
        }
        LeaseKeeper::start(
            self.checkpointer.clone(),
            thread_id,
            self.config.lease_renew_interval(),
            cancellation.clone(),
        )
        .await
    }

    /// Prepare a fresh run at step 0 of `chain`
    async fn start(
        &self,
        ctx: &RunContext,
        thread_id: &str,
        chain: Arc<Chain>,
        input: Value,
        options: &InvokeOptions,
    ) -> Result<RunDriver> {
        self.register(chain.clone());
        let cancellation = ctx.cancellation().child_token();
        let lease = self.lease(thread_id, &cancellation).await?;

        let latest = self.checkpointer.latest(thread_id).await?;
        if let Some(pending) = latest.as_ref().and_then(|cp| cp.pending_interrupt.as_ref()) {
            return Err(RuntimeError::validation(format!(
                "thread '{}' is waiting on interrupt '{}'; resume it instead",
                thread_id, pending.name
            )));
        }

        let state = latest
            .as_ref()
            .map(|cp| State::from_values(cp.state.clone()))
            .unwrap_or_default();
        if let Value::Object(fields) = &input {
            state.merge(fields.clone());
        }

        let launch = Launch {
            state,
            cursor: 0,
            input,
            last_step: latest.map(|cp| cp.step_index),
            source: CheckpointSource::Input,
            skip_interrupt_at: None,
            status: ChainStatus::Pending,
        };

        Ok(RunDriver::new(
            self.clone(),
            ctx,
            thread_id,
            chain,
            launch,
            options.limits(&self.config),
            cancellation,
            lease,
        ))
    }

    fn chain_of(&self, checkpoint: &Checkpoint) -> Result<Arc<Chain>> {
        let name = checkpoint.metadata.chain.as_deref().ok_or_else(|| {
            RuntimeError::validation(format!(
                "checkpoint {} of thread '{}' does not name its chain",
                checkpoint.step_index, checkpoint.thread_id
            ))
        })?;
        self.chain(name)
            .ok_or_else(|| RuntimeError::NotFound(format!("chain '{}' is not registered", name)))
    }
}

/// Where a resume leaves the thread
enum Resumed {
    /// Already completed; nothing to run
    Done(Checkpoint),
    Continue(RunDriver),
}

/// Advance `driver` to the end, one event per step plus the final event
///
/// Every event carries the chain status reached when it was produced.
fn drive(mut driver: RunDriver, thread: String) -> impl Stream<Item = StepEvent> + Send {
    async_stream::stream! {
        loop {
            match driver.advance().await {
                Ok(Progress::Stepped(event)) => {
                    yield event.with_chain_status(driver.status());
                }
                Ok(Progress::Completed(event, outcome)) => {
                    yield event.with_chain_status(driver.status());
                    yield StepEvent::finished(&outcome);
                    driver.finish(RunStatus::Completed).await;
                    break;
                }
                Ok(Progress::Paused(descriptor)) => {
                    yield StepEvent::paused(descriptor).with_chain_status(driver.status());
                    driver.finish(RunStatus::Interrupted).await;
                    break;
                }
                Err(err) => {
                    yield StepEvent::failed(&thread, driver.last_step(), err);
                    driver.finish(RunStatus::Failed).await;
                    break;
                }
            }
        }
    }
}
