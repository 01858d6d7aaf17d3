use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::JobPhase;

/// `Pending → Processing → {Completed, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category row counters for one attempt of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCounts {
    /// Non-blank data rows in the file.
    pub total: u64,
    /// Rows whose outcome is final.
    pub processed: u64,
    pub valid: u64,
    pub validation_failed: u64,
    pub duplicate: u64,
    pub matched: u64,
    pub not_found: u64,
    pub verification_failed: u64,
    /// Persisted without verification (verification disabled).
    pub unverified: u64,
    pub inserted: u64,
    pub updated: u64,
    pub persist_failed: u64,
    /// Valid rows deliberately not persisted (policy).
    pub skipped: u64,
}

impl JobCounts {
    pub fn succeeded(&self) -> u64 {
        self.inserted + self.updated
    }

    pub fn failed(&self) -> u64 {
        self.validation_failed + self.verification_failed + self.persist_failed
    }

    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.processed.min(self.total) * 100) / self.total) as u8
    }
}

/// One submitted file and its processing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub filename: String,
    pub source_path: PathBuf,
    pub byte_size: u64,
    pub submitted_by: String,
    pub status: JobStatus,
    pub stage: JobPhase,
    pub message: Option<String>,
    pub error: Option<String>,
    /// Failure came from infrastructure, not from the file itself.
    pub retryable: bool,
    /// Processing attempts since submission or the last manual retry.
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub counts: JobCounts,
    pub report_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: String, source_path: PathBuf, byte_size: u64, submitted_by: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            filename: file_name(&source_path),
            source_path,
            byte_size,
            submitted_by,
            status: JobStatus::Pending,
            stage: JobPhase::Queued,
            message: Some("Waiting for a free worker".to_string()),
            error: None,
            retryable: false,
            attempts: 0,
            next_attempt_at: None,
            counts: JobCounts::default(),
            report_path: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Puts a job back to `Pending` for another attempt. Counters and
    /// per-attempt fields are cleared; `attempts` is left to the caller.
    pub fn reset_for_retry(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Pending;
        self.stage = JobPhase::Queued;
        self.message = Some("Queued for retry".to_string());
        self.error = None;
        self.retryable = false;
        self.next_attempt_at = None;
        self.counts = JobCounts::default();
        self.report_path = None;
        self.started_at = None;
        self.finished_at = None;
        self.updated_at = now;
    }
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// What the orchestrator hands back to its worker.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    pub counts: JobCounts,
    pub error: Option<String>,
    pub retryable: bool,
    pub report_path: Option<PathBuf>,
}

impl JobResult {
    pub fn completed(job_id: &str, counts: JobCounts, report_path: PathBuf) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Completed,
            counts,
            error: None,
            retryable: false,
            report_path: Some(report_path),
        }
    }

    pub fn failed(
        job_id: &str,
        counts: JobCounts,
        error: String,
        retryable: bool,
        report_path: Option<PathBuf>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            counts,
            error: Some(error),
            retryable,
            report_path,
        }
    }

    pub fn cancelled(job_id: &str, counts: JobCounts) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Cancelled,
            counts,
            error: None,
            retryable: false,
            report_path: None,
        }
    }
}

/// Out-of-band request to stop a running job at its next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancel,
    /// No progress within the stall timeout.
    Stalled,
    /// The pool is shutting down.
    Shutdown,
}

impl Interrupt {
    fn to_u8(self) -> u8 {
        match self {
            Interrupt::Cancel => 1,
            Interrupt::Stalled => 2,
            Interrupt::Shutdown => 3,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Interrupt::Cancel),
            2 => Some(Interrupt::Stalled),
            3 => Some(Interrupt::Shutdown),
            _ => None,
        }
    }
}

/// Live, shared state of a non-terminal job.
///
/// The record itself sits behind a per-job mutex, so one job's updates
/// never contend with another's. The interrupt flag and the progress
/// heartbeat are plain atomics that readers can poll without the lock.
pub struct JobHandle {
    job: Mutex<Job>,
    interrupt: AtomicU8,
    last_progress_ms: AtomicI64,
}

impl JobHandle {
    pub fn new(job: Job) -> Self {
        Self {
            job: Mutex::new(job),
            interrupt: AtomicU8::new(0),
            last_progress_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn id(&self) -> String {
        self.with(|job| job.id.clone())
    }

    pub fn snapshot(&self) -> Job {
        self.with(|job| job.clone())
    }

    pub fn status(&self) -> JobStatus {
        self.with(|job| job.status)
    }

    /// Runs `f` with the record locked.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Job) -> R,
    {
        let mut guard = match self.job.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job handle lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        f(&mut guard)
    }

    /// Raises `interrupt` unless a cancel is already pending. Returns whether
    /// the flag changed.
    pub fn request_interrupt(&self, interrupt: Interrupt) -> bool {
        let next = interrupt.to_u8();
        let mut current = self.interrupt.load(Ordering::Acquire);
        loop {
            if current == next || current == Interrupt::Cancel.to_u8() {
                return false;
            }
            match self.interrupt.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn interrupt(&self) -> Option<Interrupt> {
        Interrupt::from_u8(self.interrupt.load(Ordering::Acquire))
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(0, Ordering::Release);
    }

    /// Records a progress heartbeat.
    pub fn touch(&self) {
        self.last_progress_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_progress_ms.load(Ordering::Acquire);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last);
        Duration::from_millis(elapsed.max(0) as u64)
    }
}
