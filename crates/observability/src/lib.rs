//! Logging and metrics (shared setup).

/// Initialize process-wide logging with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    logging::init_with(logging::LogFormat::Json);
}

/// Subscriber configuration (filters, output format).
pub mod logging;

/// Metrics sink interface and built-in sinks.
pub mod metrics;

pub use metrics::{
    InMemoryMetricsSink, MetricCategory, MetricKind, MetricRecord, MetricsError, MetricsSink,
    NullMetricsSink, TracingMetricsSink, emit,
};
