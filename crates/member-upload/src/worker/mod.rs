pub mod job;
pub mod pool;
pub mod queue;
pub mod scanner;

pub use job::{Interrupt, Job, JobCounts, JobHandle, JobResult, JobStatus};
pub use pool::WorkerPool;
pub use queue::{JobQueue, SubmitRequest, Submission};
pub use scanner::{DirectoryWatcher, WatcherStatus};

// Re-export crossbeam_channel for use in the daemon
pub use crossbeam_channel;
