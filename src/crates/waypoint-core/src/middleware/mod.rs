//! Request/response interception around a unit of work
//!
//! A [`MiddlewareChain`] is an ordered list of [`Middleware`] wrapped around
//! a terminal [`Handler`]. The request travels outer→inner in registration
//! order and the response comes back inner→outer:
//!
//! ```text
//!   execute(req) ──► Logging ──► Timing ──► Retry ──► Cache ──► Handler
//!                       ◄──────────◄──────────◄─────────◄── Response
//! ```
//!
//! Each middleware receives the request and a [`Next`] continuation. It may
//! change the request, answer without calling `next` (cache hit), call
//! `next` several times (retry), or post-process the response (timing).
//!
//! The runtime wraps every chain step in the runtime's middleware chain, so
//! retries, caching and logging apply per step. The chain itself has no
//! notion of steps and can wrap any async work.
//!
//! # Writing a middleware
//!
//! ```rust
//! use async_trait::async_trait;
//! use waypoint_core::middleware::{Middleware, Next, Request, Response};
//!
//! struct Tenant(String);
//!
//! #[async_trait]
//! impl Middleware for Tenant {
//!     fn name(&self) -> &str {
//!         "tenant"
//!     }
//!
//!     async fn handle(&self, request: Request, next: Next<'_>) -> Response {
//!         next.run(request.with_context("tenant", self.0.clone().into())).await
//!     }
//! }
//! ```

pub mod cache;
pub mod logging;
pub mod retry;
pub mod timing;

pub use cache::{fingerprint, CacheConfig, CacheMetrics, CacheMiddleware};
pub use logging::LoggingMiddleware;
pub use retry::{RetryMiddleware, RetryPolicy};
pub use timing::TimingMiddleware;

use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Input envelope flowing through the chain
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// What is being executed, e.g. `"orders.charge"`
    pub target: String,

    /// Input of the unit of work
    pub input: Value,

    /// Context accumulated by outer layers and the caller
    pub context: HashMap<String, Value>,

    /// Zero-based attempt number, set by the retry middleware
    pub attempt: u32,
}

impl Request {
    pub fn new(target: impl Into<String>, input: Value) -> Self {
        Self {
            target: target.into(),
            input,
            context: HashMap::new(),
            attempt: 0,
        }
    }

    /// Add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Facts recorded by middleware about one execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMetadata {
    /// Wall time spent below the timing middleware
    pub latency: Option<Duration>,

    /// Retries performed after the first attempt
    pub retry_count: u32,

    /// Answered from the cache without executing
    pub cache_hit: bool,

    /// Shared the result of a concurrent identical execution
    pub shared: bool,

    /// Custom annotations
    pub extra: HashMap<String, Value>,
}

/// Output envelope flowing back through the chain
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Output or error of the unit of work
    pub result: Result<Value>,

    /// Metadata added on the way out
    pub metadata: ResponseMetadata,
}

impl Response {
    /// Wrap a result with empty metadata
    pub fn from_result(result: Result<Value>) -> Self {
        Self {
            result,
            metadata: ResponseMetadata::default(),
        }
    }

    /// Successful response
    pub fn ok(value: Value) -> Self {
        Self::from_result(Ok(value))
    }

    /// Failed response
    pub fn err(error: crate::RuntimeError) -> Self {
        Self::from_result(Err(error))
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Take the result, dropping metadata
    pub fn into_result(self) -> Result<Value> {
        self.result
    }
}

/// Terminal unit of work at the bottom of the chain
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: Request) -> Result<Value>;
}

/// Adapter turning an async closure into a [`Handler`]
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, request: Request) -> Result<Value> {
        (self.0)(request).await
    }
}

/// One interception layer
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Handle a request, usually by delegating to `next`
    async fn handle(&self, request: Request, next: Next<'_>) -> Response;
}

/// Continuation to the remaining layers and the handler
///
/// `Next` is `Copy`: a middleware may run it any number of times.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Pass the request to the next layer, or to the handler after the last
    pub fn run(self, request: Request) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            match self.layers.split_first() {
                Some((layer, rest)) => {
                    let next = Next {
                        layers: rest,
                        handler: self.handler,
                    };
                    layer.handle(request, next).await
                }
                None => Response::from_result(self.handler.call(request).await),
            }
        })
    }
}

/// Ordered middleware layers
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl MiddlewareChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer; earlier layers run outermost
    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Append a shared layer
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.layers.push(middleware);
    }

    /// Layer names, outermost first
    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run a request through every layer and the handler
    pub async fn execute(&self, request: Request, handler: &dyn Handler) -> Response {
        Next {
            layers: &self.layers,
            handler,
        }
        .run(request)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeError;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, request: Request, next: Next<'_>) -> Response {
            self.log.lock().push(format!("{}:in", self.name));
            let response = next.run(request).await;
            self.log.lock().push(format!("{}:out", self.name));
            response
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        fn name(&self) -> &str {
            "short"
        }

        async fn handle(&self, _request: Request, _next: Next<'_>) -> Response {
            Response::ok(json!("short-circuited"))
        }
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(Recorder {
                name: "outer".into(),
                log: log.clone(),
            })
            .with(Recorder {
                name: "inner".into(),
                log: log.clone(),
            });

        let handler_log = log.clone();
        let handler = handler_fn(move |req: Request| {
            let log = handler_log.clone();
            async move {
                log.lock().push("handler".to_string());
                Ok(req.input)
            }
        });

        let response = chain.execute(Request::new("t", json!(1)), &handler).await;

        assert_eq!(response.result, Ok(json!(1)));
        assert_eq!(
            *log.lock(),
            vec!["outer:in", "inner:in", "handler", "inner:out", "outer:out"]
        );
        assert_eq!(chain.names(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let chain = MiddlewareChain::new().with(ShortCircuit);
        let handler = handler_fn(|_req: Request| async {
            Err::<Value, _>(RuntimeError::validation("must not run"))
        });

        let response = chain.execute(Request::new("t", json!(null)), &handler).await;
        assert_eq!(response.result, Ok(json!("short-circuited")));
    }

    #[tokio::test]
    async fn test_empty_chain_calls_handler() {
        let chain = MiddlewareChain::new();
        let handler = handler_fn(|req: Request| async move { Ok(json!({"echo": req.target})) });

        let response = chain.execute(Request::new("echo", json!(null)), &handler).await;
        assert_eq!(response.result, Ok(json!({"echo": "echo"})));
        assert_eq!(response.metadata, ResponseMetadata::default());
    }
}
