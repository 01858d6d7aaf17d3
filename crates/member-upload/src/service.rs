//! Entry point for callers: the operations an HTTP router or the daemon
//! maps onto the queue, the store and the verification client.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::broadcast::{JobProgressBroadcaster, JobProgressEvent};
use crate::config::UploadConfig;
use crate::db::stats_repo::UploadStats;
use crate::db::{Database, MemberStore, SqliteMemberStore};
use crate::error::{ConfigError, Result, UploadError};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::store::{JobPage, JobQuery, JobStore, Report};
use crate::verify::{HttpRegistry, RateLimitStatus, RateLimiter, RegistryLookup, VerificationClient};
use crate::worker::{DirectoryWatcher, Job, JobQueue, WatcherStatus, WorkerPool};

pub use crate::worker::SubmitRequest;

/// A report rendered for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDownload {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Result of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSweep {
    pub jobs_deleted: usize,
    pub orphans_deleted: usize,
}

/// Assembles an [`UploadService`]. Storage, the member store and the registry
/// transport can be swapped out; everything else comes from the config.
pub struct UploadServiceBuilder {
    config: UploadConfig,
    database: Option<Database>,
    member_store: Option<Arc<dyn MemberStore>>,
    registry: Option<Arc<dyn RegistryLookup>>,
    broadcaster: Option<JobProgressBroadcaster>,
}

impl UploadServiceBuilder {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            database: None,
            member_store: None,
            registry: None,
            broadcaster: None,
        }
    }

    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn member_store(mut self, store: Arc<dyn MemberStore>) -> Self {
        self.member_store = Some(store);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn RegistryLookup>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn broadcaster(mut self, broadcaster: JobProgressBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Opens storage, recovers jobs left over from a previous run and starts
    /// the worker pool.
    pub fn build(self) -> Result<UploadService> {
        let config = self.config;
        config.validate()?;

        let database = match self.database {
            Some(db) => db,
            None => Database::open(&config.database_path())?,
        };
        let store = Arc::new(JobStore::new(database.clone(), config.reports_dir())?);

        let member_store = self
            .member_store
            .unwrap_or_else(|| Arc::new(SqliteMemberStore::new(database.clone())));
        let registry: Arc<dyn RegistryLookup> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(HttpRegistry::new(&config.verify)?),
        };
        let limiter = Arc::new(RateLimiter::from_config(&config.verify));
        let verifier = Arc::new(VerificationClient::new(&config.verify, registry, limiter));

        let broadcaster = self.broadcaster.unwrap_or_default();
        let queue = Arc::new(JobQueue::new(
            Arc::clone(&store),
            broadcaster.clone(),
            config.intake.clone(),
            config.queue.clone(),
        ));

        queue.recover()?;

        let pipeline = Arc::new(Pipeline::new(
            Arc::new(PipelineConfig::from_config(&config)),
            Arc::clone(&verifier),
            member_store,
            Arc::clone(&store),
        ));
        let pool = WorkerPool::start(Arc::clone(&queue), pipeline, &config.queue)?;

        info!(
            "Upload service ready ({} worker(s), verification {})",
            config.queue.worker_count,
            if verifier.is_enabled() { "on" } else { "off" }
        );

        Ok(UploadService {
            config,
            store,
            queue,
            verifier,
            broadcaster,
            pool: Mutex::new(Some(pool)),
            watcher: Mutex::new(None),
        })
    }
}

pub struct UploadService {
    config: UploadConfig,
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    verifier: Arc<VerificationClient>,
    broadcaster: JobProgressBroadcaster,
    pool: Mutex<Option<WorkerPool>>,
    watcher: Mutex<Option<DirectoryWatcher>>,
}

impl UploadService {
    pub fn builder(config: UploadConfig) -> UploadServiceBuilder {
        UploadServiceBuilder::new(config)
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn verification(&self) -> &Arc<VerificationClient> {
        &self.verifier
    }

    /// Queues a file and returns its job id.
    ///
    /// A known job id is returned as-is without touching the file. New
    /// uploads are refused with [`UploadError::Saturated`] while the
    /// verification budget is spent.
    pub fn submit(&self, request: SubmitRequest) -> Result<String> {
        if let Some(job_id) = &request.job_id {
            if self.queue.handle(job_id).is_some() || self.store.exists(job_id)? {
                return Ok(job_id.clone());
            }
        }

        if self.verifier.is_enabled() && self.config.queue.precheck_rate_limit {
            let budget = self.verifier.rate_limit_status();
            if budget.remaining == 0 {
                return Err(UploadError::Saturated {
                    resets_in_secs: budget.resets_in_secs,
                });
            }
        }

        Ok(self.queue.submit_file(request)?.job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<Job> {
        self.queue.status(job_id)
    }

    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        self.queue.cancel(job_id)
    }

    pub fn retry(&self, job_id: &str) -> Result<bool> {
        self.queue.retry(job_id)
    }

    pub fn list_history(&self, query: &JobQuery) -> Result<JobPage> {
        Ok(self.store.query(query)?)
    }

    pub fn stats(&self) -> Result<UploadStats> {
        Ok(self.store.stats()?)
    }

    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.verifier.rate_limit_status()
    }

    pub fn report(&self, job_id: &str) -> Result<Report> {
        if !self.store.exists(job_id)? {
            return Err(UploadError::JobNotFound(job_id.to_string()));
        }
        Ok(self.store.load_report(job_id)?)
    }

    /// The job's report as CSV, with the file name it should be saved under.
    pub fn report_download(&self, job_id: &str) -> Result<ReportDownload> {
        let report = self.report(job_id)?;
        Ok(ReportDownload {
            file_name: report.download_name(),
            content_type: "text/csv",
            bytes: report.to_csv()?,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.broadcaster.subscribe()
    }

    /// Starts watching `directory`, or the configured drop folder when `None`.
    /// A watcher on another folder is stopped first.
    pub fn start_watcher(&self, directory: Option<PathBuf>) -> Result<WatcherStatus> {
        let directory = directory
            .or_else(|| self.config.watch.directory.clone())
            .ok_or_else(|| ConfigError::Validation {
                message: "no watch directory configured".to_string(),
            })?;

        let mut slot = lock(&self.watcher);
        if let Some(existing) = slot.as_ref() {
            if existing.directory() == directory.as_path() {
                existing.start()?;
                return Ok(existing.status());
            }
        }
        if let Some(previous) = slot.take() {
            previous.stop();
        }

        let watcher =
            DirectoryWatcher::new(directory, &self.config.watch, Arc::clone(&self.queue))?;
        watcher.start()?;
        let status = watcher.status();
        *slot = Some(watcher);
        Ok(status)
    }

    /// Stops the watcher. Jobs it already submitted keep running.
    pub fn stop_watcher(&self) -> bool {
        match lock(&self.watcher).take() {
            Some(watcher) => {
                watcher.stop();
                true
            }
            None => false,
        }
    }

    pub fn watcher_status(&self) -> WatcherStatus {
        lock(&self.watcher)
            .as_ref()
            .map(|w| w.status())
            .unwrap_or_default()
    }

    /// Deletes expired terminal jobs with their reports, then any report
    /// file nothing points to.
    pub fn run_retention(&self) -> Result<RetentionSweep> {
        let jobs_deleted = self.store.delete_older_than(self.config.retention.retention())?;
        let orphans_deleted = self.store.delete_orphaned(self.store.reports_dir())?;
        Ok(RetentionSweep {
            jobs_deleted,
            orphans_deleted,
        })
    }

    /// Stops the watcher and the workers, waiting for them to exit. Jobs
    /// interrupted here fail retryably and are picked up on the next start.
    pub fn shutdown(&self) {
        self.stop_watcher();
        let pool = lock(&self.pool).take();
        if let Some(pool) = pool {
            pool.shutdown();
            pool.wait();
            info!("Upload service stopped");
        }
    }
}

impl Drop for UploadService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Service lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
