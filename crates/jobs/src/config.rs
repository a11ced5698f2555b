//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobgate_core::{CoreError, EnvLookup, process_env};

use crate::error::SchedulerError;
use crate::types::Priority;

/// Scheduler configuration and per-job defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum concurrently running attempts
    pub max_concurrent: usize,
    /// Upper bound on how long the dispatch loop sleeps between scans
    pub poll_interval: Duration,
    pub default_priority: Priority,
    pub default_max_retries: u32,
    pub default_retry_base_delay: Duration,
    pub default_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "job-scheduler".to_string(),
            max_concurrent: 3,
            poll_interval: Duration::from_secs(1),
            default_priority: Priority::Normal,
            default_max_retries: 3,
            default_retry_base_delay: Duration::from_secs(1),
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_default_retry_base_delay(mut self, delay: Duration) -> Self {
        self.default_retry_base_delay = delay;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_concurrent == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "default_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(&process_env)
    }

    /// Read `JOBGATE_*` overrides from `env`; unset variables keep defaults.
    pub fn from_lookup(env: &impl EnvLookup) -> Result<Self, CoreError> {
        let mut config = Self::default();

        if let Some(name) = env.get("JOBGATE_SCHEDULER_NAME") {
            config.name = name;
        }
        if let Some(max) = env.parse("JOBGATE_MAX_CONCURRENT")? {
            config.max_concurrent = max;
        }
        if let Some(interval) = env.parse_millis("JOBGATE_POLL_INTERVAL_MS")? {
            config.poll_interval = interval;
        }
        if let Some(priority) = env.parse::<Priority>("JOBGATE_DEFAULT_PRIORITY")? {
            config.default_priority = priority;
        }
        if let Some(retries) = env.parse("JOBGATE_DEFAULT_MAX_RETRIES")? {
            config.default_max_retries = retries;
        }
        if let Some(delay) = env.parse_millis("JOBGATE_DEFAULT_RETRY_DELAY_MS")? {
            config.default_retry_base_delay = delay;
        }
        if let Some(timeout) = env.parse_millis("JOBGATE_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout = timeout;
        }

        config
            .validate()
            .map_err(|e| CoreError::invalid_config("JOBGATE_*", e.to_string()))?;
        Ok(config)
    }
}
