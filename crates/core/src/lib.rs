//! `jobgate-core`: foundation building blocks shared by the admission and job crates.
//!
//! This crate holds no engine logic: identifiers, time, configuration parsing.

pub mod clock;
pub mod config;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock, to_chrono};
pub use config::{EnvLookup, process_env};
pub use error::{CoreError, CoreResult};
pub use id::JobId;
