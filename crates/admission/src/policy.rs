//! Quota policies, check outcomes, and controller settings.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobgate_core::{CoreError, EnvLookup, process_env};

use crate::error::AdmissionError;

/// Rate-limit algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter reset at window boundaries.
    FixedWindow,
    /// Timestamps within the trailing window.
    SlidingWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
        }
    }
}

/// `quota` admitted calls per identity per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    pub quota: u32,
    pub window: Duration,
}

impl AdmissionPolicy {
    pub fn new(quota: u32, window: Duration) -> Self {
        Self { quota, window }
    }

    pub fn per_second(quota: u32) -> Self {
        Self::new(quota, Duration::from_secs(1))
    }

    pub fn per_minute(quota: u32) -> Self {
        Self::new(quota, Duration::from_secs(60))
    }

    pub fn per_hour(quota: u32) -> Self {
        Self::new(quota, Duration::from_secs(3600))
    }

    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.quota == 0 {
            return Err(AdmissionError::InvalidPolicy(
                "quota must be greater than zero".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(AdmissionError::InvalidPolicy(
                "window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    /// Quota left in the current window after this call.
    pub remaining: u32,
    /// When the window frees up (fixed: window end; sliding: oldest hit expiry).
    pub reset_at: DateTime<Utc>,
    /// Whole seconds (rounded up) until a unit becomes available. `None` when allowed.
    pub retry_after: Option<Duration>,
}

impl Decision {
    pub(crate) fn allow(remaining: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            retry_after: None,
        }
    }

    pub(crate) fn deny(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after: Some(ceil_secs(reset_at - now)),
        }
    }
}

/// Round a time span up to whole seconds (negative spans become zero).
pub(crate) fn ceil_secs(span: chrono::Duration) -> Duration {
    let micros = span.num_microseconds().unwrap_or(i64::MAX).max(0) as u64;
    Duration::from_secs(micros.div_ceil(1_000_000))
}

/// Controller-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSettings {
    /// Upper bound on tracked `(scope, identity)` windows per algorithm.
    pub max_tracked_keys: usize,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            max_tracked_keys: 10_000,
        }
    }
}

impl AdmissionSettings {
    pub fn with_max_tracked_keys(mut self, max: usize) -> Self {
        self.max_tracked_keys = max;
        self
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(&process_env)
    }

    /// Read overrides (`JOBGATE_ADMISSION_MAX_KEYS`) from `env`.
    pub fn from_lookup(env: &impl EnvLookup) -> Result<Self, CoreError> {
        let mut settings = Self::default();
        if let Some(max) = env.parse::<usize>("JOBGATE_ADMISSION_MAX_KEYS")? {
            if max == 0 {
                return Err(CoreError::invalid_config(
                    "JOBGATE_ADMISSION_MAX_KEYS",
                    "must be greater than zero",
                ));
            }
            settings.max_tracked_keys = max;
        }
        Ok(settings)
    }
}
