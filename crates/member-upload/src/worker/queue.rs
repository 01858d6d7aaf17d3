//! Job registry and FIFO dispatch.
//!
//! Every non-terminal job has a [`JobHandle`] in the registry; the channel
//! carries job ids in submission order. A job leaves the registry when it
//! reaches a terminal state, after which the store is the only record.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::{JobPhase, JobProgressBroadcaster, JobProgressEvent};
use crate::config::{IntakeConfig, QueueConfig};
use crate::error::{IntakeError, Result, UploadError, WorkerError};
use crate::intake::{self, FileCheck};
use crate::sanitize;
use crate::store::JobStore;

use super::job::{Interrupt, Job, JobHandle, JobResult, JobStatus};

/// A file handed to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub path: PathBuf,
    pub submitted_by: String,
    /// Idempotency key. Generated when absent.
    #[serde(default)]
    pub job_id: Option<String>,
}

impl SubmitRequest {
    pub fn new<P: Into<PathBuf>>(path: P, submitted_by: &str) -> Self {
        Self {
            path: path.into(),
            submitted_by: submitted_by.to_string(),
            job_id: None,
        }
    }

    pub fn with_job_id(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }
}

/// Outcome of a submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: String,
    /// `false` when the id was already known and nothing new was queued.
    pub created: bool,
}

pub struct JobQueue {
    handles: RwLock<HashMap<String, Arc<JobHandle>>>,
    sender: Sender<String>,
    receiver: Receiver<String>,
    store: Arc<JobStore>,
    broadcaster: JobProgressBroadcaster,
    intake: IntakeConfig,
    config: QueueConfig,
    file_check: FileCheckFn,
}

type FileCheckFn = fn(&Path, &IntakeConfig) -> std::result::Result<FileCheck, IntakeError>;

impl JobQueue {
    pub fn new(
        store: Arc<JobStore>,
        broadcaster: JobProgressBroadcaster,
        intake: IntakeConfig,
        config: QueueConfig,
    ) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            handles: RwLock::new(HashMap::new()),
            sender,
            receiver,
            store,
            broadcaster,
            intake,
            config,
            file_check: intake::check_file,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &JobProgressBroadcaster {
        &self.broadcaster
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn receiver(&self) -> Receiver<String> {
        self.receiver.clone()
    }

    fn read_handles(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<JobHandle>>> {
        match self.handles.read() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_handles(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<JobHandle>>> {
        match self.handles.write() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn handle(&self, job_id: &str) -> Option<Arc<JobHandle>> {
        self.read_handles().get(job_id).cloned()
    }

    fn is_known(&self, job_id: &str) -> Result<bool> {
        if self.read_handles().contains_key(job_id) {
            return Ok(true);
        }
        Ok(self.store.exists(job_id)?)
    }

    /// Jobs not yet terminal.
    pub fn active_count(&self) -> usize {
        self.read_handles().len()
    }

    /// Accepts a file as a new `Pending` job.
    ///
    /// A known job id returns the existing job untouched, whatever its state.
    /// The file-level checks run before anything is recorded, so a rejected
    /// file leaves no job behind. Parsing happens outside the registry lock.
    pub fn submit_file(&self, request: SubmitRequest) -> Result<Submission> {
        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.is_known(&job_id)? {
            debug!("Job {} already submitted", job_id);
            return Ok(Submission {
                job_id,
                created: false,
            });
        }

        let check = (self.file_check)(&request.path, &self.intake)?;
        let job = Job::new(
            job_id.clone(),
            request.path,
            check.byte_size,
            request.submitted_by,
        );

        let mut handles = self.write_handles();
        // A concurrent submit of the same id may have won while we parsed.
        if handles.contains_key(&job_id) || self.store.exists(&job_id)? {
            debug!("Job {} already submitted", job_id);
            return Ok(Submission {
                job_id,
                created: false,
            });
        }
        self.store.save(&job)?;
        handles.insert(job_id.clone(), Arc::new(JobHandle::new(job.clone())));
        drop(handles);

        self.sender
            .send(job_id.clone())
            .map_err(|_| WorkerError::ChannelClosed)?;
        self.broadcaster.send_job(&job);

        info!(
            "Job {} queued: {} ({} rows, {} bytes)",
            job_id,
            sanitize::redact_path(&job.source_path),
            check.data_rows,
            check.byte_size
        );
        Ok(Submission {
            job_id,
            created: true,
        })
    }

    /// Live record first, then the store.
    pub fn status(&self, job_id: &str) -> Result<Job> {
        if let Some(handle) = self.handle(job_id) {
            return Ok(handle.snapshot());
        }
        self.store
            .load(job_id)?
            .ok_or_else(|| UploadError::JobNotFound(job_id.to_string()))
    }

    /// Moves a dequeued job from `Pending` to `Processing`. Returns `None`
    /// if the job is gone or no longer pending (cancelled while queued).
    pub fn claim(&self, job_id: &str) -> Option<Arc<JobHandle>> {
        let handle = self.handle(job_id)?;
        let claimed = handle.with(|job| {
            if job.status != JobStatus::Pending {
                return None;
            }
            let now = Utc::now();
            job.status = JobStatus::Processing;
            job.stage = JobPhase::Validating;
            job.message = Some("Processing started".to_string());
            job.attempts += 1;
            job.started_at = Some(now);
            job.updated_at = now;
            Some(job.clone())
        })?;

        handle.touch();
        if let Err(e) = self.store.save(&claimed) {
            warn!("Failed to persist claim of job {}: {}", job_id, e);
        }
        self.broadcaster.send_job(&claimed);
        Some(handle)
    }

    /// Cancels a pending job at once, or asks a running one to stop at its
    /// next checkpoint. Terminal jobs cannot be cancelled.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let Some(handle) = self.handle(job_id) else {
            return match self.store.load(job_id)? {
                Some(_) => Ok(false),
                None => Err(UploadError::JobNotFound(job_id.to_string())),
            };
        };

        let cancelled = handle.with(|job| match job.status {
            JobStatus::Pending => {
                let now = Utc::now();
                job.status = JobStatus::Cancelled;
                job.stage = JobPhase::Cancelled;
                job.message = Some("Cancelled before processing started".to_string());
                job.finished_at = Some(now);
                job.updated_at = now;
                Some(Some(job.clone()))
            }
            JobStatus::Processing => {
                job.message = Some("Cancellation requested".to_string());
                Some(None)
            }
            _ => None,
        });

        match cancelled {
            Some(Some(job)) => {
                self.settle(&job)?;
                self.broadcaster.send_job(&job);
                info!("Job {} cancelled while pending", job_id);
                Ok(true)
            }
            Some(None) => {
                handle.request_interrupt(Interrupt::Cancel);
                info!("Cancellation requested for running job {}", job_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Puts a `Failed` job back to `Pending` with a fresh attempt counter.
    pub fn retry(&self, job_id: &str) -> Result<bool> {
        if self.handle(job_id).is_some() {
            return Ok(false);
        }
        let mut job = self
            .store
            .load(job_id)?
            .ok_or_else(|| UploadError::JobNotFound(job_id.to_string()))?;
        if job.status != JobStatus::Failed {
            return Ok(false);
        }
        if !job.source_path.exists() {
            warn!("Cannot retry job {}: source file is gone", job_id);
            return Ok(false);
        }

        job.attempts = 0;
        self.requeue(job)
    }

    fn requeue(&self, mut job: Job) -> Result<bool> {
        let mut handles = self.write_handles();
        if handles.contains_key(&job.id) {
            return Ok(false);
        }

        job.reset_for_retry();
        // A new attempt writes its own report.
        self.store.remove_report(&job.id);
        self.store.save(&job)?;
        handles.insert(job.id.clone(), Arc::new(JobHandle::new(job.clone())));
        drop(handles);

        self.sender
            .send(job.id.clone())
            .map_err(|_| WorkerError::ChannelClosed)?;
        self.broadcaster.send_job(&job);
        info!("Job {} re-queued (attempt {})", job.id, job.attempts + 1);
        Ok(true)
    }

    /// Re-queues retryable failed jobs whose backoff has elapsed.
    pub fn requeue_due(&self) -> Result<usize> {
        let due = self
            .store
            .find_retry_due(Utc::now(), self.config.max_attempts)?;

        let mut requeued = 0;
        for mut job in due {
            if !job.source_path.exists() {
                warn!("Job {} cannot be retried: source file is gone", job.id);
                job.retryable = false;
                job.next_attempt_at = None;
                job.message = Some("Source file is gone, not retrying".to_string());
                job.updated_at = Utc::now();
                self.store.save(&job)?;
                continue;
            }
            if self.requeue(job)? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Flags running jobs without progress for longer than the stall timeout
    /// and asks them to stop. Returns how many were newly flagged.
    pub fn flag_stalled(&self) -> usize {
        let timeout = self.config.stall_timeout();
        let handles: Vec<Arc<JobHandle>> = self.read_handles().values().cloned().collect();

        let mut flagged = 0;
        for handle in handles {
            if handle.status() != JobStatus::Processing || handle.idle_for() < timeout {
                continue;
            }
            if handle.request_interrupt(Interrupt::Stalled) {
                let job = handle.snapshot();
                warn!(
                    "Job {} stalled: no progress for {}s",
                    job.id,
                    handle.idle_for().as_secs()
                );
                self.broadcaster.send(JobProgressEvent::with_phase(
                    &job,
                    JobPhase::Stalled,
                    "No progress within the stall timeout",
                ));
                flagged += 1;
            }
        }
        flagged
    }

    pub fn interrupt_all(&self, interrupt: Interrupt) {
        for handle in self.read_handles().values() {
            handle.request_interrupt(interrupt);
        }
    }

    /// Picks up where a previous process left off: pending jobs are queued
    /// again, jobs caught mid-processing become retryable failures.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = 0;

        for job in self.store.find_by_status(JobStatus::Pending)? {
            let mut handles = self.write_handles();
            if handles.contains_key(&job.id) {
                continue;
            }
            handles.insert(job.id.clone(), Arc::new(JobHandle::new(job.clone())));
            drop(handles);
            self.sender
                .send(job.id.clone())
                .map_err(|_| WorkerError::ChannelClosed)?;
            recovered += 1;
        }

        for mut job in self.store.find_by_status(JobStatus::Processing)? {
            if self.handle(&job.id).is_some() {
                continue;
            }
            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.stage = JobPhase::Failed;
            job.error = Some("Interrupted: the process stopped while the job was running".to_string());
            job.retryable = true;
            job.next_attempt_at = Some(now);
            job.finished_at = Some(now);
            job.updated_at = now;
            self.store.save(&job)?;
            recovered += 1;
        }

        if recovered > 0 {
            info!("Recovered {} job(s) from a previous run", recovered);
        }
        Ok(recovered)
    }

    /// Records the terminal result of the job held by `handle`.
    pub fn finish(&self, handle: &JobHandle, result: JobResult) -> Job {
        let now = Utc::now();
        let max_attempts = self.config.max_attempts;
        let retry_delay = self.config.retry_delay(handle.with(|job| job.attempts));

        let job = handle.with(|job| {
            job.status = result.status;
            job.counts = result.counts;
            job.error = result.error.clone();
            job.retryable = result.retryable;
            job.report_path = result.report_path.clone();
            job.finished_at = Some(now);
            job.updated_at = now;
            job.next_attempt_at = None;

            let (stage, message) = match result.status {
                JobStatus::Completed => (
                    JobPhase::Completed,
                    format!(
                        "Completed: {} saved, {} failed, {} duplicate",
                        result.counts.succeeded(),
                        result.counts.failed(),
                        result.counts.duplicate
                    ),
                ),
                JobStatus::Cancelled => (
                    JobPhase::Cancelled,
                    format!(
                        "Cancelled after {} of {} rows",
                        result.counts.processed, result.counts.total
                    ),
                ),
                _ if result.retryable && job.attempts < max_attempts => {
                    let delay = chrono::Duration::from_std(retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    job.next_attempt_at = Some(now + delay);
                    (
                        JobPhase::Failed,
                        format!("Failed, retrying in {}s", retry_delay.as_secs()),
                    )
                }
                _ if result.retryable => (
                    JobPhase::Failed,
                    format!("Failed after {} attempts", job.attempts),
                ),
                _ => (JobPhase::Failed, "Failed".to_string()),
            };
            job.stage = stage;
            job.message = Some(message);
            job.clone()
        });

        if let Err(e) = self.settle(&job) {
            log::error!(
                "Failed to persist final state of job {}, will retry: {}",
                job.id,
                e
            );
        }

        self.broadcaster.send_job(&job);
        info!("Job {} finished: {}", job.id, job.status);
        job
    }

    /// Writes a terminal job to the store and only then drops it from the
    /// registry. When the write fails the handle stays, still answering
    /// `status`, until [`JobQueue::settle_unsaved`] gets it through.
    fn settle(&self, job: &Job) -> Result<()> {
        self.store.save(job)?;
        self.write_handles().remove(&job.id);

        // A retryable failure keeps its input for the next attempt.
        if !(job.status == JobStatus::Failed && job.retryable) {
            remove_source(&job.source_path);
        }
        Ok(())
    }

    /// Retries the store write for terminal jobs still in the registry.
    /// Returns how many were written.
    pub fn settle_unsaved(&self) -> usize {
        let unsaved: Vec<Job> = self
            .read_handles()
            .values()
            .filter(|handle| handle.status().is_terminal())
            .map(|handle| handle.snapshot())
            .collect();

        let mut settled = 0;
        for job in unsaved {
            match self.settle(&job) {
                Ok(()) => {
                    info!("Persisted final state of job {}", job.id);
                    settled += 1;
                }
                Err(e) => debug!("Job {} still unsaved: {}", job.id, e),
            }
        }
        settled
    }
}

fn remove_source(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed source {}", sanitize::redact_path(path)),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Failed to remove source {}: {}",
            sanitize::redact_path(path),
            e
        ),
    }
}
