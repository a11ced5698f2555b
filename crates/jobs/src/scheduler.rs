//! The job engine: dispatch loop, execution slots, timeout, retry, cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use jobgate_core::{Clock, JobId, SystemClock};
use jobgate_observability::{MetricCategory, MetricRecord, MetricsSink, emit};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::processor::{JobContext, JobProcessor, ProcessorRegistry, ProgressReporter};
use crate::queue::JobQueue;
use crate::types::{AttemptOutcome, Job, JobOptions, JobStatus, RetryDisposition};

/// Smallest pause between dispatch scans.
const MIN_PAUSE: Duration = Duration::from_millis(1);

/// Scheduler statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Jobs waiting in the priority queue
    pub queued: usize,
    /// Execution slots in use (includes cancelled attempts still unwinding)
    pub active_attempts: usize,
    pub max_concurrent: usize,
}

/// Background job engine.
///
/// Cheap to clone; clones share the same queue, records, and slots.
///
/// ```ignore
/// let scheduler = JobScheduler::new(SchedulerConfig::default(), metrics)?;
/// scheduler.register_processor("file_processing", typed(FileProcessor));
/// scheduler.start()?;
/// let id = scheduler.enqueue("file_processing", payload, JobOptions::new())?;
/// ```
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("name", &self.inner.config.name)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

struct Inner {
    config: SchedulerConfig,
    registry: RwLock<ProcessorRegistry>,
    state: Mutex<State>,
    wake: Arc<Notify>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    queue: JobQueue,
    /// Occupied execution slots
    running: usize,
}

struct Entry {
    job: Job,
    /// Cancellation token of the live attempt
    token: Option<CancellationToken>,
}

struct Lifecycle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

/// Everything an attempt needs once it leaves the state lock.
struct Launch {
    id: JobId,
    job_type: String,
    attempt: u32,
    started_at: DateTime<Utc>,
    timeout: Duration,
    payload: Value,
    processor: Option<Arc<dyn JobProcessor>>,
    token: CancellationToken,
}

enum AttemptResult {
    Succeeded(Value),
    Failed(String),
    TimedOut(String),
}

impl AttemptResult {
    fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Succeeded(_) => AttemptOutcome::Succeeded,
            Self::Failed(_) => AttemptOutcome::Failed,
            Self::TimedOut(_) => AttemptOutcome::TimedOut,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self, SchedulerError> {
        Self::with_clock(config, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SchedulerConfig,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry: RwLock::new(ProcessorRegistry::new()),
                state: Mutex::new(State::default()),
                wake: Arc::new(Notify::new()),
                metrics,
                clock,
                lifecycle: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register the processor for a job type. Last registration wins.
    pub fn register_processor(&self, job_type: impl Into<String>, processor: impl JobProcessor) {
        self.register_processor_arc(job_type, Arc::new(processor));
    }

    pub fn register_processor_arc(&self, job_type: impl Into<String>, processor: Arc<dyn JobProcessor>) {
        let job_type = job_type.into();
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if registry.register(job_type.clone(), processor).is_some() {
            debug!(scheduler = %self.inner.config.name, job_type = %job_type, "processor replaced");
        }
    }

    pub fn has_processor(&self, job_type: &str) -> bool {
        self.inner.registry().contains(job_type)
    }

    /// Create a pending job and queue it. Does not wait for execution.
    pub fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobId, SchedulerError> {
        let job = self.prepare(job_type.into(), payload, options)?;
        Ok(self.insert(job))
    }

    /// Validate a submission and build its pending record without queueing it.
    pub(crate) fn prepare(
        &self,
        job_type: String,
        payload: Value,
        options: JobOptions,
    ) -> Result<Job, SchedulerError> {
        if !self.has_processor(&job_type) {
            warn!(scheduler = %self.inner.config.name, job_type = %job_type, "rejected job of unknown type");
            return Err(SchedulerError::UnknownJobType(job_type));
        }
        options.into_job(job_type, payload, &self.inner.config, self.inner.clock.now())
    }

    /// Queue a record built by [`Self::prepare`].
    pub(crate) fn insert(&self, job: Job) -> JobId {
        let (id, priority) = (job.id, job.priority);
        let record = MetricRecord::counter("job_enqueued", MetricCategory::Business)
            .with_tag("job_type", &job.job_type)
            .with_tag("priority", priority);

        debug!(
            scheduler = %self.inner.config.name,
            job_id = %id,
            job_type = %job.job_type,
            priority = %priority,
            scheduled_at = %job.scheduled_at,
            "job enqueued"
        );

        {
            let mut state = self.inner.state();
            state.queue.push(id, priority, job.scheduled_at);
            state.jobs.insert(id, Entry { job, token: None });
        }

        emit(self.inner.metrics.as_ref(), record);
        self.inner.wake.notify_one();
        id
    }

    /// Snapshot of a job record.
    pub fn status(&self, id: JobId) -> Result<Job, SchedulerError> {
        self.inner
            .state()
            .jobs
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Cancel a pending or running job.
    ///
    /// Returns `false` for unknown or already finished jobs. A running attempt
    /// is only signalled; its slot frees up once the processor returns.
    pub fn cancel(&self, id: JobId) -> bool {
        let now = self.inner.clock.now();
        let record = {
            let mut state = self.inner.state();
            let State { jobs, queue, .. } = &mut *state;
            let Some(entry) = jobs.get_mut(&id) else {
                return false;
            };
            let was = entry.job.status;
            if let Err(err) = entry.job.cancel(now) {
                debug!(job_id = %id, error = %err, "cancel ignored");
                return false;
            }
            queue.remove(id);
            if let Some(token) = entry.token.take() {
                token.cancel();
            }
            info!(job_id = %id, job_type = %entry.job.job_type, was = %was, "job cancelled");
            MetricRecord::counter("job_cancelled", MetricCategory::Business)
                .with_tag("job_type", &entry.job.job_type)
                .with_tag("was", was)
        };

        emit(self.inner.metrics.as_ref(), record);
        true
    }

    /// Start the dispatch loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let shutdown = CancellationToken::new();
        let join = runtime.spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.wake),
            shutdown.clone(),
            self.inner.config.poll_interval,
        ));
        *lifecycle = Some(Lifecycle { shutdown, join });

        info!(
            scheduler = %self.inner.config.name,
            max_concurrent = self.inner.config.max_concurrent,
            "job scheduler started"
        );
        Ok(())
    }

    /// Stop dispatching. Attempts already running finish and are recorded;
    /// queued jobs stay queued until the next `start`.
    pub async fn stop(&self) {
        let lifecycle = lock(&self.inner.lifecycle).take();
        let Some(Lifecycle { shutdown, join }) = lifecycle else {
            return;
        };
        shutdown.cancel();
        if let Err(err) = join.await {
            warn!(scheduler = %self.inner.config.name, error = %err, "dispatch loop ended abnormally");
        }
        info!(scheduler = %self.inner.config.name, "job scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.lifecycle).is_some()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state();
        let mut stats = SchedulerStats {
            queued: state.queue.len(),
            active_attempts: state.running,
            max_concurrent: self.inner.config.max_concurrent,
            ..SchedulerStats::default()
        };
        for entry in state.jobs.values() {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Drop records of finished jobs. Returns how many were removed.
    pub fn purge_finished(&self) -> usize {
        let mut state = self.inner.state();
        let before = state.jobs.len();
        state.jobs.retain(|_, entry| !entry.job.status.is_terminal());
        let purged = before - state.jobs.len();
        if purged > 0 {
            debug!(scheduler = %self.inner.config.name, purged, "purged finished jobs");
        }
        purged
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state().queue.len()
    }

    #[cfg(test)]
    fn dispatch_now(&self) -> Duration {
        self.inner.dispatch_ready()
    }
}

async fn dispatch_loop(
    inner: Weak<Inner>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    poll_interval: Duration,
) {
    loop {
        let pause = match inner.upgrade() {
            Some(inner) => inner.dispatch_ready(),
            None => break,
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(pause.min(poll_interval)) => {}
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn registry(&self) -> RwLockReadGuard<'_, ProcessorRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start every eligible job that fits in a free slot. Returns how long the
    /// loop may sleep before something becomes eligible.
    fn dispatch_ready(self: &Arc<Self>) -> Duration {
        let now = self.clock.now();
        let mut launches = Vec::new();

        let pause = {
            let mut state = self.state();
            let State { jobs, queue, running } = &mut *state;

            while *running < self.config.max_concurrent {
                let Some(id) = queue.pop_eligible(now) else {
                    break;
                };
                let Some(entry) = jobs.get_mut(&id) else {
                    continue;
                };
                let attempt = match entry.job.start_attempt(now) {
                    Ok(attempt) => attempt,
                    Err(err) => {
                        warn!(job_id = %id, error = %err, "skipped queued job");
                        continue;
                    }
                };

                let token = CancellationToken::new();
                entry.token = Some(token.clone());
                *running += 1;
                launches.push(Launch {
                    id,
                    job_type: entry.job.job_type.clone(),
                    attempt,
                    started_at: now,
                    timeout: entry.job.timeout,
                    payload: entry.job.payload.clone(),
                    processor: self.registry().get(&entry.job.job_type),
                    token,
                });
            }

            match queue.next_eligible_at() {
                Some(at) if *running < self.config.max_concurrent => {
                    (at - now).to_std().unwrap_or(Duration::ZERO).max(MIN_PAUSE)
                }
                _ => self.config.poll_interval,
            }
        };

        for launch in launches {
            debug!(
                job_id = %launch.id,
                job_type = %launch.job_type,
                attempt = launch.attempt,
                "dispatching job"
            );
            emit(
                self.metrics.as_ref(),
                MetricRecord::counter("job_attempt_started", MetricCategory::Performance)
                    .with_tag("job_type", &launch.job_type)
                    .with_tag("attempt", launch.attempt),
            );
            self.spawn_attempt(launch);
        }

        pause
    }

    fn spawn_attempt(self: &Arc<Self>, mut launch: Launch) {
        let weak = Arc::downgrade(self);
        let (id, attempt) = (launch.id, launch.attempt);
        let progress = ProgressReporter::new(move |value| {
            if let Some(inner) = weak.upgrade() {
                inner.record_progress(id, attempt, value);
            }
        });
        let ctx = JobContext::new(
            launch.id,
            launch.job_type.as_str(),
            launch.attempt,
            progress,
            launch.token.clone(),
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let payload = std::mem::take(&mut launch.payload);
            let result = execute(&launch, payload, ctx).await;
            inner.finish_attempt(launch, result);
        });
    }

    fn finish_attempt(&self, launch: Launch, result: AttemptResult) {
        let now = self.clock.now();
        let outcome = result.outcome();
        let tag = |record: MetricRecord| record.with_tag("job_type", &launch.job_type);
        let mut records = Vec::new();

        {
            let mut state = self.state();
            let State { jobs, queue, running } = &mut *state;
            *running = running.saturating_sub(1);

            match jobs.get_mut(&launch.id) {
                Some(entry)
                    if entry.job.status == JobStatus::Running
                        && entry.job.attempts == launch.attempt =>
                {
                    entry.token = None;
                    let duration = (now - launch.started_at).num_milliseconds().max(0) as f64;
                    records.push(tag(
                        MetricRecord::histogram("job_attempt_duration", duration, MetricCategory::Performance)
                            .with_tag("outcome", outcome.as_str()),
                    ));

                    let transition = match result {
                        AttemptResult::Succeeded(value) => entry
                            .job
                            .complete(value, launch.started_at, now)
                            .map(|()| {
                                debug!(job_id = %launch.id, attempt = launch.attempt, "job completed");
                                records.push(tag(MetricRecord::counter("job_completed", MetricCategory::Business)));
                            }),
                        AttemptResult::Failed(error) | AttemptResult::TimedOut(error) => {
                            if outcome == AttemptOutcome::TimedOut {
                                records.push(tag(MetricRecord::counter("job_timed_out", MetricCategory::Error)));
                            }
                            entry
                                .job
                                .fail_attempt(error.clone(), outcome, launch.started_at, now)
                                .map(|disposition| match disposition {
                                    RetryDisposition::Retry { at, delay } => {
                                        queue.push(launch.id, entry.job.priority, at);
                                        debug!(
                                            job_id = %launch.id,
                                            attempt = launch.attempt,
                                            delay_ms = delay.as_millis() as u64,
                                            error = %error,
                                            "job attempt failed, retry scheduled"
                                        );
                                        records.push(tag(
                                            MetricRecord::counter("job_retried", MetricCategory::Business)
                                                .with_tag("attempt", launch.attempt),
                                        ));
                                    }
                                    RetryDisposition::Exhausted => {
                                        info!(
                                            job_id = %launch.id,
                                            job_type = %launch.job_type,
                                            attempts = launch.attempt,
                                            error = %error,
                                            "job failed"
                                        );
                                        records.push(tag(
                                            MetricRecord::counter("job_failed", MetricCategory::Error)
                                                .with_tag("outcome", outcome.as_str()),
                                        ));
                                    }
                                })
                        }
                    };
                    if let Err(err) = transition {
                        warn!(job_id = %launch.id, error = %err, "could not record attempt result");
                    }
                }
                _ => {
                    debug!(
                        job_id = %launch.id,
                        attempt = launch.attempt,
                        outcome = outcome.as_str(),
                        "discarded result of stale attempt"
                    );
                    records.push(tag(
                        MetricRecord::counter("job_result_discarded", MetricCategory::Performance)
                            .with_tag("outcome", outcome.as_str()),
                    ));
                }
            }
        }

        self.wake.notify_one();
        for record in records {
            emit(self.metrics.as_ref(), record);
        }
    }

    fn record_progress(&self, id: JobId, attempt: u32, value: i64) {
        let mut state = self.state();
        let Some(entry) = state.jobs.get_mut(&id) else {
            return;
        };
        if entry.job.attempts != attempt {
            return;
        }
        match entry.job.set_progress(value) {
            Ok(()) => trace!(job_id = %id, progress = entry.job.progress, "job progress"),
            Err(err) => trace!(job_id = %id, error = %err, "progress ignored"),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(lifecycle) = lifecycle {
            lifecycle.shutdown.cancel();
        }
    }
}

/// Run one attempt in its own task, racing it against the job's timeout.
async fn execute(launch: &Launch, payload: Value, ctx: JobContext) -> AttemptResult {
    let Some(processor) = launch.processor.clone() else {
        return AttemptResult::Failed(format!(
            "no processor registered for job type: {}",
            launch.job_type
        ));
    };

    let mut task = tokio::spawn(async move { processor.process(payload, ctx).await });
    match tokio::time::timeout(launch.timeout, &mut task).await {
        Ok(Ok(Ok(value))) => AttemptResult::Succeeded(value),
        Ok(Ok(Err(err))) => AttemptResult::Failed(format!("{err:#}")),
        Ok(Err(join_err)) if join_err.is_panic() => AttemptResult::Failed("processor panicked".to_string()),
        Ok(Err(join_err)) => AttemptResult::Failed(format!("processor task ended: {join_err}")),
        Err(_) => {
            launch.token.cancel();
            task.abort();
            AttemptResult::TimedOut(format!(
                "job timed out after {}ms",
                launch.timeout.as_millis()
            ))
        }
    }
}
