//! Metrics sink interface.
//!
//! The engine reports one [`MetricRecord`] per admission decision and per job
//! lifecycle transition. Storage, aggregation and alerting belong to whoever
//! implements [`MetricsSink`]; emission is fire-and-forget through [`emit`].

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broad bucket a metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Performance,
    Business,
    Error,
}

impl MetricCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricCategory::Performance => "performance",
            MetricCategory::Business => "business",
            MetricCategory::Error => "error",
        }
    }
}

/// How the value should be aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic count (value is the increment).
    Counter,
    /// Distribution sample (e.g. a duration in milliseconds).
    Histogram,
}

/// A single metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    pub kind: MetricKind,
    pub category: MetricCategory,
    pub tags: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl MetricRecord {
    /// Counter increment of one.
    pub fn counter(name: impl Into<String>, category: MetricCategory) -> Self {
        Self {
            name: name.into(),
            value: 1.0,
            kind: MetricKind::Counter,
            category,
            tags: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn histogram(name: impl Into<String>, value: f64, category: MetricCategory) -> Self {
        Self {
            name: name.into(),
            value,
            kind: MetricKind::Histogram,
            category,
            tags: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Sink failure. Never surfaced to job or admission callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics sink unavailable: {0}")]
    Unavailable(String),
    #[error("metrics sink rejected record: {0}")]
    Rejected(String),
}

/// Outbound metrics interface.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: MetricRecord) -> Result<(), MetricsError>;
}

impl<T: MetricsSink + ?Sized> MetricsSink for Arc<T> {
    fn record(&self, record: MetricRecord) -> Result<(), MetricsError> {
        (**self).record(record)
    }
}

/// Hand a record to the sink, swallowing errors and panics.
pub fn emit(sink: &dyn MetricsSink, record: MetricRecord) {
    let name = record.name.clone();
    match panic::catch_unwind(AssertUnwindSafe(|| sink.record(record))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(metric = %name, error = %e, "metric emission failed"),
        Err(_) => tracing::warn!(metric = %name, "metrics sink panicked"),
    }
}

/// Drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record(&self, _record: MetricRecord) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Writes each record as a `tracing` event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, record: MetricRecord) -> Result<(), MetricsError> {
        tracing::debug!(
            metric = %record.name,
            value = record.value,
            kind = ?record.kind,
            category = record.category.as_str(),
            tags = ?record.tags,
            "metric"
        );
        Ok(())
    }
}

/// Bounded in-memory sink for tests/dev.
///
/// Once `capacity` records are held the oldest record is dropped.
#[derive(Debug)]
pub struct InMemoryMetricsSink {
    records: Mutex<VecDeque<MetricRecord>>,
    capacity: usize,
}

impl InMemoryMetricsSink {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of everything recorded so far, oldest first.
    pub fn records(&self) -> Vec<MetricRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Records with the given name.
    pub fn named(&self, name: &str) -> Vec<MetricRecord> {
        self.lock().iter().filter(|r| r.name == name).cloned().collect()
    }

    /// Number of records with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.lock().iter().filter(|r| r.name == name).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<MetricRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, record: MetricRecord) -> Result<(), MetricsError> {
        let mut records = self.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }
}
