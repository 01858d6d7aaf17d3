//! Job progress broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::worker::{Job, JobCounts, JobStatus};

/// Finer-grained stage of a job than its [`JobStatus`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Validating,
    Verifying,
    Persisting,
    /// Second pass over rows the verification budget turned away.
    RetryingDeferred,
    Reporting,
    Completed,
    Failed,
    Cancelled,
    /// Flagged by the supervisor for lack of progress.
    Stalled,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Queued => "queued",
            JobPhase::Validating => "validating",
            JobPhase::Verifying => "verifying",
            JobPhase::Persisting => "persisting",
            JobPhase::RetryingDeferred => "retrying_deferred",
            JobPhase::Reporting => "reporting",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
            JobPhase::Cancelled => "cancelled",
            JobPhase::Stalled => "stalled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobPhase::Queued),
            "validating" => Some(JobPhase::Validating),
            "verifying" => Some(JobPhase::Verifying),
            "persisting" => Some(JobPhase::Persisting),
            "retrying_deferred" => Some(JobPhase::RetryingDeferred),
            "reporting" => Some(JobPhase::Reporting),
            "completed" => Some(JobPhase::Completed),
            "failed" => Some(JobPhase::Failed),
            "cancelled" => Some(JobPhase::Cancelled),
            "stalled" => Some(JobPhase::Stalled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => write!(f, "Queued"),
            JobPhase::Validating => write!(f, "Validating rows"),
            JobPhase::Verifying => write!(f, "Verifying against the registry"),
            JobPhase::Persisting => write!(f, "Saving members"),
            JobPhase::RetryingDeferred => write!(f, "Retrying rate-limited rows"),
            JobPhase::Reporting => write!(f, "Writing report"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
            JobPhase::Cancelled => write!(f, "Cancelled"),
            JobPhase::Stalled => write!(f, "Stalled"),
        }
    }
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub filename: String,
    pub phase: JobPhase,
    pub status: JobStatus,
    /// Human-readable description of the current activity.
    pub message: String,
    /// 0..=100, derived from processed over total rows.
    pub percentage: u8,
    pub counts: JobCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

impl JobProgressEvent {
    /// Snapshot of `job` as an event.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            filename: job.filename.clone(),
            phase: job.stage,
            status: job.status,
            message: job
                .message
                .clone()
                .unwrap_or_else(|| job.stage.to_string()),
            percentage: job.counts.percentage(),
            counts: job.counts,
            error: job.error.clone(),
            retryable: job.retryable,
            timestamp: Utc::now(),
        }
    }

    /// Same snapshot with the phase overridden, for transient phases that are
    /// not persisted on the job.
    pub fn with_phase(job: &Job, phase: JobPhase, message: &str) -> Self {
        let mut event = Self::from_job(job);
        event.phase = phase;
        event.message = message.to_string();
        event
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn send_job(&self, job: &Job) {
        self.send(JobProgressEvent::from_job(job));
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn job() -> Job {
        Job::new(
            "job-1".to_string(),
            PathBuf::from("/drop/members.csv"),
            10,
            "tester".to_string(),
        )
    }

    #[test]
    fn test_send_without_subscribers_is_silent() {
        let broadcaster = JobProgressBroadcaster::new(4);
        broadcaster.send_job(&job());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_broadcaster_send_receive() {
        let broadcaster = JobProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        let mut job = job();
        job.counts.total = 4;
        job.counts.processed = 1;
        broadcaster.send_job(&job);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.job_id, "job-1");
        assert_eq!(received.filename, "members.csv");
        assert_eq!(received.phase, JobPhase::Queued);
        assert_eq!(received.status, JobStatus::Pending);
        assert_eq!(received.percentage, 25);
    }

    #[test]
    fn test_with_phase_overrides_message() {
        let event = JobProgressEvent::with_phase(&job(), JobPhase::Stalled, "No progress");
        assert_eq!(event.phase, JobPhase::Stalled);
        assert_eq!(event.message, "No progress");
        assert_eq!(event.status, JobStatus::Pending);
    }

    #[test]
    fn test_phase_parse_round_trip() {
        for phase in [
            JobPhase::Queued,
            JobPhase::Validating,
            JobPhase::Verifying,
            JobPhase::Persisting,
            JobPhase::RetryingDeferred,
            JobPhase::Reporting,
            JobPhase::Completed,
            JobPhase::Failed,
            JobPhase::Cancelled,
            JobPhase::Stalled,
        ] {
            assert_eq!(JobPhase::parse(phase.as_str()), Some(phase));
        }
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let json = serde_json::to_value(JobProgressEvent::from_job(&job())).unwrap();
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["phase"], "queued");
        assert!(json.get("error").is_none());
    }
}
