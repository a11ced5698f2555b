//! Tracing subscriber initialization.

use std::str::FromStr;

use jobgate_core::{CoreError, EnvLookup};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, for local development.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(CoreError::invalid_config(
                "JOBGATE_LOG_FORMAT",
                format!("unknown log format `{other}`"),
            )),
        }
    }
}

impl LogFormat {
    /// Resolve the format from `JOBGATE_LOG_FORMAT`, defaulting to JSON.
    pub fn from_lookup(env: &impl EnvLookup) -> Result<Self, CoreError> {
        Ok(env.parse::<LogFormat>("JOBGATE_LOG_FORMAT")?.unwrap_or_default())
    }
}

/// Initialize tracing for the process with the given format.
///
/// The filter comes from `RUST_LOG` (default `info`). Safe to call multiple
/// times (subsequent calls are no-ops).
pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .try_init(),
    };
}
