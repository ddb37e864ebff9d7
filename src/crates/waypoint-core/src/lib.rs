//! # waypoint-core - Durable, Resumable Workflows
//!
//! `waypoint-core` executes multi-step workflows that survive restarts,
//! pause for human input and resume in a different process.
//!
//! ## Overview
//!
//! - **State** - a shared key/value working memory with cheap snapshots
//! - **Chains** - ordered named steps with routing decided over the state
//! - **Middleware** - logging, timing, retry and single-flight caching
//!   wrapped around every step
//! - **Checkpointing** - every committed step is persisted through a
//!   [`Checkpointer`](waypoint_checkpoint::Checkpointer) before the run
//!   advances
//! - **Interrupts** - declared or dynamic pause points resolved from outside
//! - **Runtime** - invoke, stream, resume and recover, with timeouts,
//!   cancellation and distributed leases
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          Runtime                              │
//! │  invoke / stream / resume / recover                           │
//! │                                                               │
//! │   Chain ──► step ──► MiddlewareChain ──► Runnable             │
//! │     │                                       │                 │
//! │     │ route(StateSnapshot)                  ▼                 │
//! │     └──────────────◄─────────────────── State                 │
//! │                                                               │
//! │   InterruptController          LeaseKeeper                    │
//! └───────────────┬───────────────────────────────────────────────┘
//!                 ▼
//!        Checkpointer (local / distributed over a BackingStore)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use waypoint_core::middleware::{MiddlewareChain, LoggingMiddleware, RetryMiddleware, RetryPolicy};
//! use waypoint_core::{Chain, InvokeOptions, RunContext, Runtime, StepContext};
//! use waypoint_checkpoint::LocalCheckpointer;
//!
//! # async fn example() -> waypoint_core::Result<()> {
//! let chain = Arc::new(
//!     Chain::builder("greeting")
//!         .step_fn("lookup", |input: Value, ctx: StepContext| async move {
//!             ctx.state().set("name", input["name"].clone());
//!             Ok(input)
//!         })
//!         .step_fn("greet", |_input: Value, ctx: StepContext| async move {
//!             let name = ctx.state().get_string("name")?;
//!             Ok(json!(format!("hello {name}")))
//!         })
//!         .build()?,
//! );
//!
//! let middleware = MiddlewareChain::new()
//!     .with(LoggingMiddleware::new())
//!     .with(RetryMiddleware::new(RetryPolicy::new(3)));
//! let runtime = Runtime::new(Arc::new(LocalCheckpointer::new()), middleware);
//!
//! let outcome = runtime
//!     .invoke(&RunContext::new(), chain, json!({"name": "ada"}), InvokeOptions::default())
//!     .await?;
//! assert_eq!(outcome.output(), Some(&json!("hello ada")));
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! The crate emits `tracing` events and spans but never installs a
//! subscriber; applications choose one (for example `tracing-subscriber`).

pub mod chain;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod middleware;
pub mod runnable;
pub mod runtime;
pub mod state;

pub use chain::{Chain, ChainBuilder, ChainStatus, ChainStep, Route, Router, DEFAULT_MAX_STEPS};
pub use config::RuntimeConfig;
pub use error::{ErrorKind, Result, RuntimeError};
pub use interrupt::{
    interrupt, Interrupt, InterruptController, InterruptDescriptor, Resolution, ResumePoint,
};
pub use middleware::MiddlewareChain;
pub use runnable::{FnRunnable, Passthrough, Runnable, StepContext, ValueStream};
pub use runtime::{
    InvokeOptions, RunContext, RunOutcome, RunStatus, RunStream, Runtime, StepEvent,
};
pub use state::{State, StateSnapshot};

pub use waypoint_checkpoint::{
    Checkpoint, CheckpointDraft, CheckpointId, CheckpointMetadata, CheckpointSource,
    Checkpointer, DistributedCheckpointer, DistributedConfig, InMemoryStore, LocalCheckpointer,
};
pub use tokio_util::sync::CancellationToken;
