//! Durable job state and report artifacts.

pub mod job_store;
pub mod report;

pub use job_store::{JobPage, JobQuery, JobStore};
pub use report::{Report, ReportError, ReportRow, RowCategory};
