//! Structured request/response logging

use super::{Middleware, Next, Request, Response};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Emits a `tracing` event before and after every request
///
/// Side-effect only: the request and response pass through untouched.
/// Inputs and outputs are logged at `debug` level when enabled with
/// [`with_payloads`](Self::with_payloads).
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware {
    payloads: bool,
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log request inputs and response outputs
    pub fn with_payloads(mut self, payloads: bool) -> Self {
        self.payloads = payloads;
        self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, request: Request, next: Next<'_>) -> Response {
        let target = request.target.clone();
        if self.payloads {
            debug!(
                request = %target,
                attempt = request.attempt,
                input = %request.input,
                "Request started"
            );
        } else {
            debug!(request = %target, attempt = request.attempt, "Request started");
        }

        let response = next.run(request).await;

        match &response.result {
            Ok(output) => {
                if self.payloads {
                    debug!(request = %target, output = %output, "Request output");
                }
                info!(
                    request = %target,
                    retry_count = response.metadata.retry_count,
                    cache_hit = response.metadata.cache_hit,
                    "Request completed"
                );
            }
            Err(err) if err.is_interrupt() => {
                info!(request = %target, "Request paused on interrupt");
            }
            Err(err) => {
                warn!(request = %target, error = %err, kind = ?err.kind(), "Request failed");
            }
        }

        response
    }
}
