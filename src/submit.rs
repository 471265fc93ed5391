//! Submission Layer
//!
//! Forwards batches from the result channel to the metrics backend:
//! - **Submitter**: dedicated OS thread draining the [`ResultReceiver`](crate::channel::ResultReceiver)
//! - **SubmitClient**: pluggable transport; [`HttpSubmitClient`] posts collectd
//!   `write_http` JSON
//!
//! Delivery is best effort. A failed submission is logged and the batch is
//! dropped; the worker keeps draining.

mod actor;
mod client;
mod error;

pub use actor::{SubmitStats, Submitter, DEFAULT_POLL_INTERVAL};
pub use client::{HttpSubmitClient, SubmitClient, encode_batch};
pub use error::SubmissionError;
