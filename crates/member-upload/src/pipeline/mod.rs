pub mod config;
pub mod context;
pub mod error;
pub mod persist;
pub mod progress;
pub mod runner;

pub use config::PipelineConfig;
pub use context::{JobContext, PersistOutcome, RecordOutcome};
pub use error::PipelineError;
pub use progress::{NoopProgress, ProgressEvent, ProgressReporter, TrackedProgress};
pub use runner::Pipeline;
