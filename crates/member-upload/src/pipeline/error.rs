use std::io::ErrorKind;

use thiserror::Error;

use crate::db::PersistError;
use crate::error::IntakeError;
use crate::store::ReportError;

/// Faults that end a job. Row-level problems never show up here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("File rejected: {0}")]
    Intake(#[from] IntakeError),

    #[error("{0}")]
    StoreUnavailable(PersistError),

    #[error("Report could not be written: {0}")]
    Report(#[from] ReportError),

    #[error("Job stalled: no progress within the stall timeout")]
    Stalled,

    #[error("Job interrupted by shutdown")]
    Shutdown,
}

impl PipelineError {
    /// Infrastructure faults are retryable; a file that cannot be accepted
    /// fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            // The file vanished: nothing left to retry with.
            PipelineError::Intake(IntakeError::Unreadable { source, .. }) => {
                source.kind() != ErrorKind::NotFound && source.kind() != ErrorKind::InvalidInput
            }
            PipelineError::Intake(_) => false,
            PipelineError::StoreUnavailable(_)
            | PipelineError::Report(_)
            | PipelineError::Stalled
            | PipelineError::Shutdown => true,
        }
    }
}
