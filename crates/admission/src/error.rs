//! Admission errors.
//!
//! A denied check is not an error; see [`crate::Decision`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// `check` was called for a scope that was never configured.
    #[error("rate limit configuration not found for scope: {0}")]
    NotConfigured(String),

    /// Quota and window must both be strictly positive.
    #[error("invalid admission policy: {0}")]
    InvalidPolicy(String),
}
