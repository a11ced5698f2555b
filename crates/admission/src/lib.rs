//! Admission control: per-identity rate limiting for incoming work.
//!
//! ## Design
//!
//! - Policies are registered per scope (e.g. `"file_upload"`)
//! - Usage is tracked per `(scope, identity)` pair
//! - Two algorithms: fixed window and sliding window
//! - A granted check consumes one unit of quota atomically
//! - Denial is a normal outcome carrying a `retry_after` hint
//!
//! ## Components
//!
//! - `AdmissionController`: the public entry point
//! - `AdmissionPolicy` / `Decision`: quota configuration and check outcome
//! - `FixedWindow` / `SlidingWindow`: per-identity usage state
//! - `WindowTable`: bounded map of windows with garbage collection

pub mod controller;
pub mod error;
pub mod policy;
mod table;
pub mod window;

pub use controller::{AdmissionController, AdmissionStats};
pub use error::AdmissionError;
pub use policy::{AdmissionPolicy, AdmissionSettings, Algorithm, Decision};
pub use window::{FixedWindow, SlidingWindow};
