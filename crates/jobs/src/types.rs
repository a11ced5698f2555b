//! Job record, priorities, and the lifecycle state machine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobgate_core::{CoreError, JobId, to_chrono};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// Priority tier. Variants are declared highest first, so `Ord` sorts
/// `Critical` before `Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::invalid_config("priority", format!("unknown priority `{s}`")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for a slot (or for its retry time)
    Pending,
    /// An attempt is executing
    Running,
    Completed,
    /// Exhausted retries
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state-machine transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("job {id} is {status} and can no longer change")]
    Terminal { id: JobId, status: JobStatus },
    #[error("job {id} cannot {action} while {status}")]
    InvalidState {
        id: JobId,
        action: &'static str,
        status: JobStatus,
    },
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::TimedOut => "timed_out",
        }
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What happened after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Back to pending, eligible again at `at`.
    Retry { at: DateTime<Utc>, delay: Duration },
    /// Retries exhausted; the job is now `failed`.
    Exhausted,
}

/// Backoff before the next attempt: `base × 2^(attempt-1)`, saturating at
/// `Duration::MAX` rather than wrapping.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 || base.is_zero() {
        return Duration::ZERO;
    }
    match 2u32.checked_pow(attempt - 1) {
        Some(factor) => base.saturating_mul(factor),
        None => Duration::MAX,
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Name of the processor that handles this job
    pub job_type: String,
    /// Opaque payload handed to the processor
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Per-attempt time limit
    pub timeout: Duration,
    /// Earliest time the job may be dispatched
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    /// 0-100
    pub progress: u8,
    /// Dispatch attempts so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Execution history (one entry per finished attempt)
    pub history: Vec<AttemptRecord>,
}

impl Job {
    /// Create a pending job with default options, eligible immediately.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            priority: defaults.default_priority,
            max_retries: defaults.default_max_retries,
            retry_base_delay: defaults.default_retry_base_delay,
            timeout: defaults.default_timeout,
            scheduled_at: now,
            status: JobStatus::Pending,
            progress: 0,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            history: Vec::new(),
        }
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    fn guard(&self, action: &'static str, allowed: &[JobStatus]) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id,
                status: self.status,
            });
        }
        if !allowed.contains(&self.status) {
            return Err(TransitionError::InvalidState {
                id: self.id,
                action,
                status: self.status,
            });
        }
        Ok(())
    }

    fn push_attempt(
        &mut self,
        outcome: AttemptOutcome,
        error: Option<String>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            outcome,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// pending → running. Returns the new attempt number.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) -> Result<u32, TransitionError> {
        self.guard("start", &[JobStatus::Pending])?;
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at.get_or_insert(now);
        Ok(self.attempts)
    }

    /// running → completed.
    pub fn complete(
        &mut self,
        result: serde_json::Value,
        attempt_started: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.guard("complete", &[JobStatus::Running])?;
        self.push_attempt(AttemptOutcome::Succeeded, None, attempt_started, now);
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.completed_at = Some(now);
        self.result = Some(result);
        Ok(())
    }

    /// running → pending (retry with backoff) or running → failed.
    pub fn fail_attempt(
        &mut self,
        error: String,
        outcome: AttemptOutcome,
        attempt_started: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RetryDisposition, TransitionError> {
        self.guard("fail", &[JobStatus::Running])?;
        self.push_attempt(outcome, Some(error.clone()), attempt_started, now);

        if self.can_retry() {
            let delay = retry_delay(self.retry_base_delay, self.attempts);
            let at = now + to_chrono(delay);
            self.scheduled_at = at;
            self.status = JobStatus::Pending;
            Ok(RetryDisposition::Retry { at, delay })
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            self.error = Some(error);
            Ok(RetryDisposition::Exhausted)
        }
    }

    /// pending|running → cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard("cancel", &[JobStatus::Pending, JobStatus::Running])?;
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Record progress for the running attempt, clamped to 0-100.
    pub fn set_progress(&mut self, value: i64) -> Result<(), TransitionError> {
        self.guard("report progress", &[JobStatus::Running])?;
        self.progress = value.clamp(0, 100) as u8;
        Ok(())
    }
}

/// Per-job overrides of the scheduler defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub priority: Option<Priority>,
    pub max_retries: Option<u32>,
    pub retry_base_delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = Some(delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Not eligible before `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Not eligible until `delay` after enqueue.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Build a pending job, filling unset options from `defaults`.
    pub(crate) fn into_job(
        self,
        job_type: String,
        payload: serde_json::Value,
        defaults: &SchedulerConfig,
        now: DateTime<Utc>,
    ) -> Result<Job, SchedulerError> {
        let timeout = self.timeout.unwrap_or(defaults.default_timeout);
        if timeout.is_zero() {
            return Err(SchedulerError::InvalidOptions(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.scheduled_at.is_some() && self.delay.is_some() {
            return Err(SchedulerError::InvalidOptions(
                "set either scheduled_at or a delay, not both".to_string(),
            ));
        }

        let scheduled_at = match (self.scheduled_at, self.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => now + to_chrono(delay),
            (None, None) => now,
        };

        let mut job = Job::new(job_type, payload, now);
        job.priority = self.priority.unwrap_or(defaults.default_priority);
        job.max_retries = self.max_retries.unwrap_or(defaults.default_max_retries);
        job.retry_base_delay = self
            .retry_base_delay
            .unwrap_or(defaults.default_retry_base_delay);
        job.timeout = timeout;
        job.scheduled_at = scheduled_at;
        Ok(job)
    }
}
