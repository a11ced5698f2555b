use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use jobgate_jobs::{
    AttemptOutcome, JobContext, JobOptions, JobScheduler, JobStatus, Priority, SchedulerConfig,
    SchedulerError, TypedProcessor, processor_fn, retry_delay, typed,
};
use jobgate_observability::InMemoryMetricsSink;

fn scheduler(max_concurrent: usize) -> (JobScheduler, Arc<InMemoryMetricsSink>) {
    let metrics = InMemoryMetricsSink::arc();
    let config = SchedulerConfig::default()
        .with_name("test-scheduler")
        .with_max_concurrent(max_concurrent)
        .with_poll_interval(Duration::from_millis(10));
    let scheduler = JobScheduler::new(config, metrics.clone()).unwrap();
    (scheduler, metrics)
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn status_of(scheduler: &JobScheduler, id: jobgate_jobs::JobId) -> JobStatus {
    scheduler.status(id).unwrap().status
}

/// Processor that waits for `gate` and counts its invocations.
fn gated(gate: CancellationToken, calls: Arc<AtomicU32>) -> impl jobgate_jobs::JobProcessor {
    processor_fn(move |payload, _ctx: JobContext| {
        let gate = gate.clone();
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            gate.cancelled().await;
            Ok(payload)
        }
    })
}

#[tokio::test]
async fn unknown_job_type_leaves_queue_unchanged() {
    let (scheduler, _) = scheduler(3);
    scheduler.register_processor("known", processor_fn(|p, _| async move { Ok(p) }));
    scheduler.enqueue("known", Value::Null, JobOptions::new()).unwrap();

    let err = scheduler
        .enqueue("does_not_exist", Value::Null, JobOptions::new())
        .unwrap_err();

    assert_eq!(err, SchedulerError::UnknownJobType("does_not_exist".to_string()));
    assert_eq!(scheduler.queue_len(), 1);
}

#[tokio::test]
async fn failing_job_is_retried_then_fails() {
    let (scheduler, metrics) = scheduler(3);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    scheduler.register_processor(
        "flaky",
        processor_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("upstream unavailable")) }
        }),
    );
    scheduler.start().unwrap();

    let id = scheduler
        .enqueue(
            "flaky",
            Value::Null,
            JobOptions::new()
                .max_retries(2)
                .retry_base_delay(Duration::from_millis(20)),
        )
        .unwrap();

    wait_for("job to fail", || status_of(&scheduler, id) == JobStatus::Failed).await;
    let job = scheduler.status(id).unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(job.error.as_deref(), Some("upstream unavailable"));
    assert_eq!(job.history.len(), 3);
    assert!(job.history.iter().all(|a| a.outcome == AttemptOutcome::Failed));
    for (k, pair) in job.history.windows(2).enumerate() {
        let backoff = retry_delay(Duration::from_millis(20), k as u32 + 1);
        let earliest = pair[0].finished_at + chrono::Duration::from_std(backoff).unwrap();
        assert!(
            pair[1].started_at >= earliest,
            "attempt {} started before its backoff elapsed",
            k + 2
        );
    }
    assert!(job.completed_at.is_some());
    assert_eq!(metrics.count("job_retried"), 2);
    assert_eq!(metrics.count("job_failed"), 1);

    scheduler.stop().await;
}

#[tokio::test]
async fn timed_out_attempt_fails_and_late_result_is_ignored() {
    let (scheduler, metrics) = scheduler(3);
    scheduler.register_processor(
        "slow",
        processor_fn(|_, _| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!("late"))
        }),
    );
    scheduler.start().unwrap();

    let id = scheduler
        .enqueue(
            "slow",
            Value::Null,
            JobOptions::new()
                .timeout(Duration::from_millis(100))
                .max_retries(0),
        )
        .unwrap();

    wait_for("job to time out", || status_of(&scheduler, id) == JobStatus::Failed).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let job = scheduler.status(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result.is_none());
    assert!(job.error.unwrap().contains("timed out"));
    assert_eq!(job.history[0].outcome, AttemptOutcome::TimedOut);
    assert_eq!(metrics.count("job_timed_out"), 1);
    assert_eq!(metrics.count("job_completed"), 0);

    scheduler.stop().await;
}

#[tokio::test]
async fn timeout_counts_as_a_failed_attempt_for_retry() {
    let (scheduler, _) = scheduler(3);
    scheduler.register_processor(
        "warming",
        processor_fn(|_, ctx: JobContext| async move {
            if ctx.attempt() == 1 {
                ctx.cancelled().await;
            }
            Ok(json!({"attempt": ctx.attempt()}))
        }),
    );
    scheduler.start().unwrap();

    let id = scheduler
        .enqueue(
            "warming",
            Value::Null,
            JobOptions::new()
                .timeout(Duration::from_millis(50))
                .max_retries(1)
                .retry_base_delay(Duration::from_millis(10)),
        )
        .unwrap();

    wait_for("retry to complete", || status_of(&scheduler, id) == JobStatus::Completed).await;
    let job = scheduler.status(id).unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.result, Some(json!({"attempt": 2})));
    assert_eq!(job.history[0].outcome, AttemptOutcome::TimedOut);
    assert_eq!(job.history[1].outcome, AttemptOutcome::Succeeded);

    scheduler.stop().await;
}

#[tokio::test]
async fn pending_job_cancelled_before_dispatch_never_runs() {
    let (scheduler, metrics) = scheduler(1);
    let gate = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    scheduler.register_processor("gated", gated(gate.clone(), calls.clone()));
    scheduler.start().unwrap();

    let first = scheduler.enqueue("gated", json!(1), JobOptions::new()).unwrap();
    wait_for("first job to start", || status_of(&scheduler, first) == JobStatus::Running).await;

    let second = scheduler.enqueue("gated", json!(2), JobOptions::new()).unwrap();
    assert!(scheduler.cancel(second));
    assert_eq!(status_of(&scheduler, second), JobStatus::Cancelled);

    gate.cancel();
    wait_for("first job to finish", || status_of(&scheduler, first) == JobStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.status(second).unwrap().attempts, 0);
    assert_eq!(metrics.count("job_cancelled"), 1);

    scheduler.stop().await;
}

#[tokio::test]
async fn running_job_is_cancelled_cooperatively() {
    let (scheduler, metrics) = scheduler(1);
    scheduler.register_processor(
        "long",
        processor_fn(|_, ctx: JobContext| async move {
            for step in 0..1000 {
                if ctx.is_cancelled() {
                    return Ok(json!({"stopped_at": step}));
                }
                ctx.report_progress(step / 10);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(json!("finished"))
        }),
    );
    scheduler.start().unwrap();

    let id = scheduler.enqueue("long", Value::Null, JobOptions::new()).unwrap();
    wait_for("progress", || scheduler.status(id).unwrap().progress > 0).await;

    assert!(scheduler.cancel(id));
    assert_eq!(status_of(&scheduler, id), JobStatus::Cancelled);

    wait_for("slot to free", || scheduler.stats().active_attempts == 0).await;
    let job = scheduler.status(id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result.is_none());
    assert_eq!(metrics.count("job_result_discarded"), 1);

    scheduler.stop().await;
}

#[tokio::test]
async fn higher_priority_jobs_run_first() {
    let (scheduler, _) = scheduler(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    scheduler.register_processor(
        "record",
        processor_fn(move |payload: Value, _| {
            seen.lock().unwrap().push(payload.as_str().unwrap_or_default().to_string());
            async { Ok(Value::Null) }
        }),
    );

    for priority in [Priority::Low, Priority::Normal, Priority::Critical, Priority::High] {
        scheduler
            .enqueue("record", json!(priority.as_str()), JobOptions::new().priority(priority))
            .unwrap();
    }
    scheduler.start().unwrap();

    wait_for("all jobs", || scheduler.stats().completed == 4).await;
    assert_eq!(*order.lock().unwrap(), vec!["critical", "high", "normal", "low"]);

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_attempts_never_exceed_the_limit() {
    let (scheduler, _) = scheduler(2);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (cur, max) = (current.clone(), peak.clone());
    scheduler.register_processor(
        "work",
        processor_fn(move |_, _| {
            let (cur, max) = (cur.clone(), max.clone());
            async move {
                let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                cur.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
    );
    scheduler.start().unwrap();

    for _ in 0..8 {
        scheduler.enqueue("work", Value::Null, JobOptions::new()).unwrap();
    }
    wait_for("all jobs", || scheduler.stats().completed == 8).await;

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    scheduler.stop().await;
}

#[tokio::test]
async fn delayed_job_does_not_block_eligible_work() {
    let (scheduler, _) = scheduler(1);
    scheduler.register_processor("noop", processor_fn(|p, _| async move { Ok(p) }));
    scheduler.start().unwrap();

    let later = scheduler
        .enqueue(
            "noop",
            Value::Null,
            JobOptions::new()
                .priority(Priority::Critical)
                .delayed(Duration::from_secs(3600)),
        )
        .unwrap();
    let now = scheduler.enqueue("noop", Value::Null, JobOptions::new()).unwrap();

    wait_for("eligible job", || status_of(&scheduler, now) == JobStatus::Completed).await;
    assert_eq!(status_of(&scheduler, later), JobStatus::Pending);

    scheduler.stop().await;
}

#[tokio::test]
async fn progress_is_clamped_and_completion_sets_100() {
    let (scheduler, _) = scheduler(1);
    let gate = CancellationToken::new();
    let release = gate.clone();
    scheduler.register_processor(
        "steps",
        processor_fn(move |_, ctx: JobContext| {
            let gate = release.clone();
            async move {
                ctx.report_progress(-20);
                ctx.report_progress(42);
                gate.cancelled().await;
                ctx.report_progress(250);
                Ok(Value::Null)
            }
        }),
    );
    scheduler.start().unwrap();

    let id = scheduler.enqueue("steps", Value::Null, JobOptions::new()).unwrap();
    wait_for("progress 42", || scheduler.status(id).unwrap().progress == 42).await;

    gate.cancel();
    wait_for("completion", || status_of(&scheduler, id) == JobStatus::Completed).await;
    let job = scheduler.status(id).unwrap();
    assert_eq!(job.progress, 100);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    scheduler.stop().await;
}

#[tokio::test]
async fn finished_jobs_are_immutable() {
    let (scheduler, _) = scheduler(1);
    scheduler.register_processor("echo", processor_fn(|p, _| async move { Ok(p) }));
    scheduler.start().unwrap();

    let id = scheduler.enqueue("echo", json!({"k": "v"}), JobOptions::new()).unwrap();
    wait_for("completion", || status_of(&scheduler, id) == JobStatus::Completed).await;
    let snapshot = scheduler.status(id).unwrap();

    assert!(!scheduler.cancel(id));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(scheduler.status(id).unwrap(), snapshot);
    assert_eq!(snapshot.result, Some(json!({"k": "v"})));

    scheduler.stop().await;
}

#[tokio::test]
async fn stopped_scheduler_keeps_jobs_queued_until_restart() {
    let (scheduler, _) = scheduler(1);
    scheduler.register_processor("echo", processor_fn(|p, _| async move { Ok(p) }));

    let id = scheduler.enqueue("echo", Value::Null, JobOptions::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(status_of(&scheduler, id), JobStatus::Pending);

    scheduler.start().unwrap();
    wait_for("completion", || status_of(&scheduler, id) == JobStatus::Completed).await;
    scheduler.stop().await;

    let queued = scheduler.enqueue("echo", Value::Null, JobOptions::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(status_of(&scheduler, queued), JobStatus::Pending);
    assert_eq!(scheduler.queue_len(), 1);
}

#[derive(Deserialize)]
struct Resize {
    width: u32,
    height: u32,
}

#[derive(Serialize)]
struct Resized {
    pixels: u64,
}

struct ResizeProcessor;

#[async_trait]
impl TypedProcessor for ResizeProcessor {
    type Payload = Resize;
    type Output = Resized;

    async fn process(&self, payload: Resize, _ctx: JobContext) -> anyhow::Result<Resized> {
        Ok(Resized {
            pixels: u64::from(payload.width) * u64::from(payload.height),
        })
    }
}

#[tokio::test]
async fn typed_processors_run_end_to_end() {
    let (scheduler, metrics) = scheduler(2);
    scheduler.register_processor("resize", typed(ResizeProcessor));
    scheduler.start().unwrap();

    let ok = scheduler
        .enqueue("resize", json!({"width": 4, "height": 3}), JobOptions::new())
        .unwrap();
    let bad = scheduler
        .enqueue("resize", json!({"width": "wide"}), JobOptions::new().max_retries(0))
        .unwrap();

    wait_for("both jobs", || {
        status_of(&scheduler, ok).is_terminal() && status_of(&scheduler, bad).is_terminal()
    })
    .await;

    assert_eq!(scheduler.status(ok).unwrap().result, Some(json!({"pixels": 12})));
    let failed = scheduler.status(bad).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("invalid job payload"));

    assert_eq!(metrics.count("job_enqueued"), 2);
    assert_eq!(metrics.count("job_attempt_started"), 2);
    assert_eq!(metrics.count("job_attempt_duration"), 2);
    assert_eq!(metrics.count("job_completed"), 1);
    assert_eq!(metrics.count("job_failed"), 1);

    scheduler.stop().await;
}
