pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod intake;
pub mod pipeline;
pub mod sanitize;
pub mod service;
pub mod store;
pub mod verify;
pub mod worker;

pub use broadcast::{JobPhase, JobProgressBroadcaster, JobProgressEvent};
pub use config::UploadConfig;
pub use error::{ConfigError, IntakeError, Result, UploadError, WorkerError};
pub use service::{
    ReportDownload, RetentionSweep, SubmitRequest, UploadService, UploadServiceBuilder,
};
pub use store::{JobQuery, JobStore, Report};
pub use verify::{RateLimitStatus, RateLimiter, VerificationClient};
pub use worker::{Job, JobCounts, JobStatus, WatcherStatus};
