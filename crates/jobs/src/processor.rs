//! Processor registry and the contract handlers implement.
//!
//! Handlers belong to the surrounding application. The engine only sees
//! [`JobProcessor`]: a JSON payload in, a JSON result (or an error) out.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use jobgate_core::JobId;

/// Executes jobs of one type.
///
/// Returning `Err` fails the attempt (and may trigger a retry). Long-running
/// handlers should check [`JobContext::is_cancelled`] between steps.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, payload: Value, ctx: JobContext) -> anyhow::Result<Value>;
}

/// A processor with typed input and output.
///
/// Wrap with [`typed`] to register it; payloads that fail to deserialize fail
/// the attempt.
#[async_trait]
pub trait TypedProcessor: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    async fn process(&self, payload: Self::Payload, ctx: JobContext)
    -> anyhow::Result<Self::Output>;
}

/// Adapter from [`TypedProcessor`] to [`JobProcessor`].
#[derive(Debug, Clone)]
pub struct Typed<P>(P);

pub fn typed<P: TypedProcessor>(processor: P) -> Typed<P> {
    Typed(processor)
}

#[async_trait]
impl<P: TypedProcessor> JobProcessor for Typed<P> {
    async fn process(&self, payload: Value, ctx: JobContext) -> anyhow::Result<Value> {
        let payload: P::Payload = serde_json::from_value(payload).context("invalid job payload")?;
        let output = TypedProcessor::process(&self.0, payload, ctx).await?;
        serde_json::to_value(output).context("failed to serialize job result")
    }
}

/// Processor backed by an async closure.
#[derive(Clone)]
pub struct FnProcessor<F>(F);

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnProcessor")
    }
}

pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnProcessor(f)
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn process(&self, payload: Value, ctx: JobContext) -> anyhow::Result<Value> {
        (self.0)(payload, ctx).await
    }
}

/// Callback that records progress for one attempt.
#[derive(Clone)]
pub struct ProgressReporter {
    report: Arc<dyn Fn(i64) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(report: impl Fn(i64) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    /// Reporter that discards updates (for exercising handlers in isolation).
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, value: i64) {
        (self.report)(value)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}

/// Per-attempt handle passed to processors.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    job_type: Arc<str>,
    attempt: u32,
    progress: ProgressReporter,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        job_type: impl Into<Arc<str>>,
        attempt: u32,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            attempt,
            progress,
            cancel,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report progress; values outside 0-100 are clamped by the engine.
    pub fn report_progress(&self, value: i64) {
        self.progress.report(value)
    }

    /// True once the job was cancelled or the attempt timed out.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the attempt should stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Job type name → processor. Last registration wins.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn JobProcessor>>,
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor, returning the one it replaced.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        processor: Arc<dyn JobProcessor>,
    ) -> Option<Arc<dyn JobProcessor>> {
        self.processors.insert(job_type.into(), processor)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.processors.contains_key(job_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.processors.keys().cloned().collect();
        types.sort();
        types
    }
}
