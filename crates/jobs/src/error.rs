//! Scheduler errors (caller errors surfaced at the API boundary).
//!
//! Processor failures are not errors here: they end up in the job record.

use jobgate_core::JobId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// No processor is registered for the requested job type.
    #[error("no processor registered for job type: {0}")]
    UnknownJobType(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid job options: {0}")]
    InvalidOptions(String),
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
    #[error("scheduler already started")]
    AlreadyStarted,
    /// `start` must be called from within a tokio runtime.
    #[error("no tokio runtime available to run the scheduler")]
    NoRuntime,
}
