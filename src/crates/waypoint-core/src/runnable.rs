//! Units of work executed by chains
//!
//! A [`Runnable`] turns an input value into an output value. It receives a
//! [`StepContext`] giving access to the run's [`State`], the thread id and
//! the cancellation signal. Runnables may also expose a stream of partial
//! outputs; the default stream yields the single result of `invoke`.
//!
//! Most steps are closures wrapped in [`FnRunnable`]:
//!
//! ```rust
//! use waypoint_core::{FnRunnable, StepContext};
//! use serde_json::{json, Value};
//!
//! let validate = FnRunnable::new("validate", |input: Value, ctx: StepContext| async move {
//!     let id = input["order_id"].as_i64().unwrap_or_default();
//!     ctx.state().set("order_id", json!(id));
//!     Ok(json!({"valid": id > 0}))
//! });
//! ```

use crate::error::Result;
use crate::state::State;
use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Stream of partial outputs
pub type ValueStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Everything a step can see of the run executing it
#[derive(Debug, Clone)]
pub struct StepContext {
    thread_id: String,
    step: String,
    step_index: u64,
    state: State,
    cancellation: CancellationToken,
}

impl StepContext {
    /// Context for running a step outside the runtime
    pub fn new(thread_id: impl Into<String>, state: State) -> Self {
        Self {
            thread_id: thread_id.into(),
            step: String::new(),
            step_index: 0,
            state,
            cancellation: CancellationToken::new(),
        }
    }

    /// Set the step name and checkpoint index the step will commit as
    pub fn with_step(mut self, step: impl Into<String>, step_index: u64) -> Self {
        self.step = step.into();
        self.step_index = step_index;
        self
    }

    /// Use an existing cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Thread the step runs in
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Name of the running step
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Step index of the checkpoint this step commits on success
    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// The run's working memory
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Cancellation signal of the run
    ///
    /// Long-running steps may select on `cancelled()` to stop early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A unit of work
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Produce the output for `input`
    async fn invoke(&self, input: Value, ctx: &StepContext) -> Result<Value>;

    /// Produce partial outputs; defaults to the single result of `invoke`
    ///
    /// Used when runnables are composed in memory. The runtime executes
    /// steps through `invoke` and reports one [`StepEvent`] per committed
    /// step, so partial outputs never reach its event stream.
    ///
    /// [`StepEvent`]: crate::runtime::StepEvent
    async fn stream(&self, input: Value, ctx: &StepContext) -> Result<ValueStream> {
        let output = self.invoke(input, ctx).await?;
        Ok(Box::pin(stream::once(async move { Ok(output) })))
    }
}

type BoxedFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type BoxedFn = Box<dyn Fn(Value, StepContext) -> BoxedFuture + Send + Sync>;

/// Runnable backed by an async closure
///
/// The closure receives an owned [`StepContext`] so its future can be
/// `'static`.
pub struct FnRunnable {
    name: String,
    func: BoxedFn,
}

impl std::fmt::Debug for FnRunnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnRunnable").field("name", &self.name).finish()
    }
}

impl FnRunnable {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(move |input, ctx| Box::pin(func(input, ctx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Runnable for FnRunnable {
    async fn invoke(&self, input: Value, ctx: &StepContext) -> Result<Value> {
        (self.func)(input, ctx.clone()).await
    }
}

/// Returns its input unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl Runnable for Passthrough {
    async fn invoke(&self, input: Value, _ctx: &StepContext) -> Result<Value> {
        Ok(input)
    }
}
