use std::sync::Arc;

use chrono::Utc;

use crate::broadcast::{JobPhase, JobProgressBroadcaster};
use crate::store::JobStore;
use crate::worker::{Interrupt, JobCounts, JobHandle};

/// Events emitted by the pipeline during processing.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A new stage started.
    Stage { phase: JobPhase, message: String },
    /// Row counters moved.
    Rows { counts: JobCounts, message: String },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);

    /// Polled between batches and before each row's verification.
    fn interrupted(&self) -> Option<Interrupt> {
        None
    }
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Folds pipeline events into the live job record, persists the record and
/// broadcasts it, so status queries and subscribers see the same state.
pub struct TrackedProgress {
    handle: Arc<JobHandle>,
    store: Arc<JobStore>,
    broadcaster: JobProgressBroadcaster,
}

impl TrackedProgress {
    pub fn new(
        handle: Arc<JobHandle>,
        store: Arc<JobStore>,
        broadcaster: JobProgressBroadcaster,
    ) -> Self {
        Self {
            handle,
            store,
            broadcaster,
        }
    }
}

impl ProgressReporter for TrackedProgress {
    fn report(&self, event: ProgressEvent) {
        self.handle.touch();
        let snapshot = self.handle.with(|job| {
            match event {
                ProgressEvent::Stage { phase, message } => {
                    job.stage = phase;
                    job.message = Some(message);
                }
                ProgressEvent::Rows { counts, message } => {
                    job.counts = counts;
                    job.message = Some(message);
                }
            }
            job.updated_at = Utc::now();
            job.clone()
        });

        if let Err(e) = self.store.save(&snapshot) {
            log::error!("Failed to persist progress for job {}: {}", snapshot.id, e);
        }
        self.broadcaster.send_job(&snapshot);
    }

    fn interrupted(&self) -> Option<Interrupt> {
        self.handle.interrupt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::worker::Job;
    use tempfile::TempDir;

    #[test]
    fn test_tracked_progress_updates_record_store_and_subscribers() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            JobStore::new(Database::open_in_memory().unwrap(), dir.path().join("reports"))
                .unwrap(),
        );
        let broadcaster = JobProgressBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        let handle = Arc::new(JobHandle::new(Job::new(
            "job-1".to_string(),
            dir.path().join("members.csv"),
            10,
            "tester".to_string(),
        )));

        let progress = TrackedProgress::new(Arc::clone(&handle), Arc::clone(&store), broadcaster);
        progress.report(ProgressEvent::Stage {
            phase: JobPhase::Verifying,
            message: "Verifying 10 rows".to_string(),
        });
        progress.report(ProgressEvent::Rows {
            counts: JobCounts {
                total: 10,
                processed: 4,
                ..JobCounts::default()
            },
            message: "4 of 10 rows done".to_string(),
        });

        assert_eq!(handle.snapshot().stage, JobPhase::Verifying);
        assert_eq!(handle.snapshot().counts.processed, 4);
        assert_eq!(store.load("job-1").unwrap().unwrap().counts.processed, 4);

        assert_eq!(rx.try_recv().unwrap().phase, JobPhase::Verifying);
        let last = rx.try_recv().unwrap();
        assert_eq!(last.percentage, 40);
        assert_eq!(last.message, "4 of 10 rows done");

        assert_eq!(progress.interrupted(), None);
        handle.request_interrupt(Interrupt::Cancel);
        assert_eq!(progress.interrupted(), Some(Interrupt::Cancel));
    }
}
