//! Enqueue gated by the admission controller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use jobgate_admission::{AdmissionController, AdmissionError};
use jobgate_core::JobId;

use crate::error::SchedulerError;
use crate::scheduler::JobScheduler;
use crate::types::JobOptions;

/// Outcome of an admitted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Accepted(JobId),
    /// Over quota: try again after `retry_after`.
    Throttled {
        retry_after: Duration,
        reset_at: DateTime<Utc>,
    },
}

impl Submission {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Accepted(id) => Some(*id),
            Self::Throttled { .. } => None,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl JobScheduler {
    /// Check `identity` against the fixed-window policy of `scope`, then enqueue.
    ///
    /// Unknown job types and invalid options are rejected before any quota
    /// is consumed.
    pub fn submit_admitted(
        &self,
        admission: &AdmissionController,
        scope: &str,
        identity: &str,
        job_type: impl Into<String>,
        payload: Value,
        options: JobOptions,
    ) -> Result<Submission, SubmitError> {
        let job = self.prepare(job_type.into(), payload, options)?;

        let decision = admission.check(scope, identity)?;
        if !decision.allowed {
            debug!(scope, identity, job_type = %job.job_type, "submission throttled");
            return Ok(Submission::Throttled {
                retry_after: decision.retry_after.unwrap_or_default(),
                reset_at: decision.reset_at,
            });
        }

        Ok(Submission::Accepted(self.insert(job)))
    }
}
