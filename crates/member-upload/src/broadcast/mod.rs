//! Event streaming for job progress.
//!
//! Subscribers get every status transition and row-count update of every
//! job. Nothing is buffered for late subscribers; the job store is the
//! source of truth for anything missed.

pub mod job_progress;

pub use job_progress::{JobPhase, JobProgressBroadcaster, JobProgressEvent};
