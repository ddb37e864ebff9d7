//! Retry with exponential backoff for transient failures
//!
//! [`RetryMiddleware`] re-runs the rest of the chain while the response
//! carries an error its [`RetryPolicy`] classifies as retryable:
//!
//! - [`RuntimeError::Retryable`] is always retried;
//! - [`RuntimeError::Timeout`] only when `retry_on_timeout` is set;
//! - everything else (validation, lease and version conflicts, interrupts,
//!   cancellation, permanent step failures) is returned immediately.
//!
//! After `max_attempts` attempts the last error is surfaced. The number of
//! retries performed is reported in
//! [`ResponseMetadata::retry_count`](super::ResponseMetadata::retry_count).
//!
//! # Backoff
//!
//! ```text
//! delay = initial_interval × backoff_factor^attempt
//! delay = min(delay, max_interval)
//! if jitter: delay ×= random(0.5..=1.5)
//! ```
//!
//! ```rust
//! use waypoint_core::middleware::RetryPolicy;
//!
//! let policy = RetryPolicy::new(5)
//!     .with_initial_interval(0.2)
//!     .with_backoff_factor(3.0)
//!     .with_max_interval(10.0)
//!     .with_jitter(false);
//!
//! assert_eq!(policy.calculate_delay(0).as_millis(), 200);
//! assert_eq!(policy.calculate_delay(1).as_millis(), 600);
//! ```

use super::{Middleware, Next, Request, Response};
use crate::error::{ErrorKind, RuntimeError};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Initial interval between retries in seconds
    pub initial_interval: f64,

    /// Multiplier for the interval after each retry
    pub backoff_factor: f64,

    /// Maximum interval between retries in seconds
    pub max_interval: f64,

    /// Whether to add random jitter to intervals
    pub jitter: bool,

    /// Whether timeouts count as retryable
    #[serde(default)]
    pub retry_on_timeout: bool,
}

impl RetryPolicy {
    /// Create a retry policy with the given maximum attempts
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
            retry_on_timeout: false,
        }
    }

    /// Set the initial interval in seconds
    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the maximum interval in seconds
    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Treat timeouts as retryable
    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Calculate the delay before retry number `attempt + 1`
    ///
    /// Uses exponential backoff: `initial_interval * (backoff_factor ^ attempt)`,
    /// capped at `max_interval`, with optional jitter.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::from_secs(0);
        }

        let base_delay = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_interval);

        let final_delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped_delay * rng.gen_range(0.5..=1.5)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay.max(0.0))
    }

    /// Check if another attempt is allowed after `attempts` attempts
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Whether this policy retries the error
    pub fn is_retryable(&self, error: &RuntimeError) -> bool {
        match error.kind() {
            ErrorKind::Retryable => true,
            ErrorKind::Timeout => self.retry_on_timeout,
            _ => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Retries the rest of the chain according to a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn handle(&self, request: Request, next: Next<'_>) -> Response {
        let mut attempt = 0u32;

        loop {
            let mut current = request.clone();
            current.attempt = attempt;
            let mut response = next.run(current).await;

            let retry = match &response.result {
                Err(err) if self.policy.is_retryable(err) => self.policy.should_retry(attempt + 1),
                _ => false,
            };

            if !retry {
                if attempt > 0 {
                    if let Err(err) = &response.result {
                        if self.policy.is_retryable(err) {
                            warn!(
                                request = %request.target,
                                attempts = attempt + 1,
                                error = %err,
                                "Retries exhausted"
                            );
                        }
                    }
                }
                response.metadata.retry_count = attempt;
                return response;
            }

            let delay = self.policy.calculate_delay(attempt);
            debug!(
                request = %request.target,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
