//! Runtime configuration
//!
//! [`RuntimeConfig`] holds the defaults a [`Runtime`](crate::Runtime) applies
//! when [`InvokeOptions`](crate::InvokeOptions) leave a value unset, plus the
//! lease settings for distributed deployments.
//!
//! Configuration can be built in code, loaded from YAML, or read from
//! environment variables with a prefix:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `WAYPOINT_RUN_TIMEOUT_MS` | `run_timeout_ms` |
//! | `WAYPOINT_STEP_TIMEOUT_MS` | `step_timeout_ms` |
//! | `WAYPOINT_MAX_STEPS` | `max_steps` |
//! | `WAYPOINT_STREAM_HISTORY` | `stream_history` |
//! | `WAYPOINT_LEASE_TTL_MS` | `lease_ttl_ms` |
//! | `WAYPOINT_LEASE_RENEW_INTERVAL_MS` | `lease_renew_interval_ms` |
//! | `WAYPOINT_WORKER_ID` | `worker_id` |
//!
//! ```rust
//! use waypoint_core::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_yaml_str(
//!     "max_steps: 50\nstep_timeout_ms: 2000\n",
//! ).unwrap();
//! assert_eq!(config.max_steps, 50);
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use waypoint_checkpoint::DistributedConfig;

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "WAYPOINT_";

/// Load an environment variable as a string
///
/// Returns `Ok(None)` if the variable is not set and an error if it holds
/// invalid UTF-8.
pub fn get_env(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(RuntimeError::Configuration(format!(
            "Environment variable {} contains invalid UTF-8",
            key
        ))),
    }
}

/// Load and parse an environment variable
pub fn get_env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_env(key)? {
        Some(val) => {
            let parsed = val.trim().parse::<T>().map_err(|e| {
                RuntimeError::Configuration(format!(
                    "Failed to parse environment variable {}: {}",
                    key, e
                ))
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn build_env_key(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name.to_uppercase())
}

/// Runtime-wide defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Deadline for a whole invocation, in milliseconds
    pub run_timeout_ms: Option<u64>,

    /// Deadline for a single step attempt, in milliseconds
    pub step_timeout_ms: Option<u64>,

    /// Steps one invocation may execute before failing with `StepLimit`
    pub max_steps: usize,

    /// Stream events retained for inspection; 0 keeps none
    pub stream_history: usize,

    /// Lease TTL for distributed checkpointers, in milliseconds
    pub lease_ttl_ms: u64,

    /// How often a running invocation renews its lease, in milliseconds
    pub lease_renew_interval_ms: u64,

    /// Worker identity; a random one is generated when unset
    pub worker_id: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_timeout_ms: None,
            step_timeout_ms: None,
            max_steps: 100,
            stream_history: 0,
            lease_ttl_ms: 30_000,
            lease_renew_interval_ms: 10_000,
            worker_id: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables with the default prefix
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_prefix(ENV_PREFIX)
    }

    /// Load from environment variables; unset variables keep their defaults
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        let key = |name: &str| build_env_key(prefix, name);
        let mut config = Self::default();

        if let Some(ms) = get_env_parse(&key("run_timeout_ms"))? {
            config.run_timeout_ms = Some(ms);
        }
        if let Some(ms) = get_env_parse(&key("step_timeout_ms"))? {
            config.step_timeout_ms = Some(ms);
        }
        if let Some(n) = get_env_parse(&key("max_steps"))? {
            config.max_steps = n;
        }
        if let Some(n) = get_env_parse(&key("stream_history"))? {
            config.stream_history = n;
        }
        if let Some(ms) = get_env_parse(&key("lease_ttl_ms"))? {
            config.lease_ttl_ms = ms;
        }
        if let Some(ms) = get_env_parse(&key("lease_renew_interval_ms"))? {
            config.lease_renew_interval_ms = ms;
        }
        if let Some(id) = get_env(&key("worker_id"))? {
            config.worker_id = Some(id);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(RuntimeError::Configuration(
                "max_steps must be at least 1".to_string(),
            ));
        }
        if self.lease_ttl_ms == 0 {
            return Err(RuntimeError::Configuration(
                "lease_ttl_ms must be positive".to_string(),
            ));
        }
        if self.lease_renew_interval_ms == 0 || self.lease_renew_interval_ms >= self.lease_ttl_ms
        {
            return Err(RuntimeError::Configuration(format!(
                "lease_renew_interval_ms ({}) must be positive and shorter than lease_ttl_ms ({})",
                self.lease_renew_interval_ms, self.lease_ttl_ms
            )));
        }
        if matches!(self.run_timeout_ms, Some(0)) || matches!(self.step_timeout_ms, Some(0)) {
            return Err(RuntimeError::Configuration(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_stream_history(mut self, events: usize) -> Self {
        self.stream_history = events;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }

    /// Settings for a [`DistributedCheckpointer`](waypoint_checkpoint::DistributedCheckpointer)
    pub fn distributed_config(&self) -> DistributedConfig {
        let config = DistributedConfig::new().with_lease_ttl(self.lease_ttl());
        match &self.worker_id {
            Some(id) => config.with_worker_id(id.clone()),
            None => config,
        }
    }
}
