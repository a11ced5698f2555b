//! Background job engine with priorities, timeouts, retry, and cancellation.
//!
//! ## Design
//!
//! - Jobs are typed by name and routed to a registered processor
//! - Pending jobs wait in a priority queue (tier, then eligibility time, then FIFO)
//! - A dispatch loop fills a bounded number of execution slots
//! - Each attempt races its processor against the job's timeout
//! - Failed attempts are retried with exponential backoff
//! - Cancellation is cooperative through a token handed to the processor
//!
//! ## Components
//!
//! - `Job`: the record and its state machine
//! - `JobQueue`: ordering of pending jobs
//! - `ProcessorRegistry` / `JobProcessor`: job-type handlers
//! - `JobScheduler`: the engine instance (enqueue, status, cancel, start/stop)

pub mod config;
pub mod error;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod submit;
pub mod types;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use processor::{
    FnProcessor, JobContext, JobProcessor, ProcessorRegistry, ProgressReporter, Typed,
    TypedProcessor, processor_fn, typed,
};
pub use queue::JobQueue;
pub use scheduler::{JobScheduler, SchedulerStats};
pub use submit::{SubmitError, Submission};
pub use types::{
    AttemptOutcome, AttemptRecord, Job, JobOptions, JobStatus, Priority, RetryDisposition,
    TransitionError, retry_delay,
};

pub use jobgate_core::JobId;
