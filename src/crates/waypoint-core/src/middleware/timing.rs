//! Latency measurement

use super::{Middleware, Next, Request, Response};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::warn;

/// Records the elapsed time of everything below it in
/// [`ResponseMetadata::latency`](super::ResponseMetadata::latency)
///
/// Place it outside the retry middleware to measure the total including
/// backoff, inside to measure the final attempt only.
#[derive(Debug, Clone, Default)]
pub struct TimingMiddleware {
    slow_threshold: Option<Duration>,
}

impl TimingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warn when a request takes longer than `threshold`
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = Some(threshold);
        self
    }
}

#[async_trait]
impl Middleware for TimingMiddleware {
    fn name(&self) -> &str {
        "timing"
    }

    async fn handle(&self, request: Request, next: Next<'_>) -> Response {
        let target = request.target.clone();
        let started = Instant::now();

        let mut response = next.run(request).await;

        let elapsed = started.elapsed();
        response.metadata.latency = Some(elapsed);
        if let Some(threshold) = self.slow_threshold {
            if elapsed > threshold {
                warn!(
                    request = %target,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "Slow request"
                );
            }
        }
        response
    }
}
