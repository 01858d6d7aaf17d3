use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("File rejected: {0}")]
    Intake(#[from] IntakeError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Report error: {0}")]
    Report(#[from] crate::store::ReportError),

    #[error("Verification error: {0}")]
    Verify(#[from] crate::verify::VerifyError),

    #[error("Verification service saturated, budget resets in {resets_in_secs}s")]
    Saturated { resets_in_secs: u64 },

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Environment variable {0} is not valid unicode")]
    NotUnicode(String),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// File-level rejection. Raised before any row is looked at.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Failed to read '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Unsupported file type: {0}")]
    UnsupportedFormat(String),

    #[error("Could not parse file as a table: {0}")]
    Unparsable(String),

    #[error("Missing required column(s): {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("File contains no data rows")]
    Empty,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Job {0} is already active")]
    AlreadyActive(String),

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Directory scan failed for '{path}': {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

pub type Result<T> = std::result::Result<T, UploadError>;
