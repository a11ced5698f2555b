//! Core error model.

use thiserror::Error;

/// Result type used by the core helpers.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures raised while parsing identifiers or configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A configuration value could not be parsed or is out of range.
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
