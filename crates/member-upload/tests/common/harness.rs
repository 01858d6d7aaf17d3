//! Test harness for isolated end-to-end runs.
//!
//! `TestHarness` owns a temp directory, a file-backed database and a running
//! `UploadService` whose registry and member store are test doubles.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::broadcast::error::TryRecvError;

use member_upload::db::{
    BatchError, Database, MemberStore, MemberWrite, PersistError, SqliteMemberStore, UpsertOutcome,
};
use member_upload::verify::{LookupError, RegistryLookup, RegistryRecord};
use member_upload::{Job, JobProgressEvent, SubmitRequest, UploadService};

use super::builders::{ConfigBuilder, SheetBuilder};

/// Registry double. Every identifier is registered unless scripted
/// otherwise; lookups can be held at a gate to freeze a job mid-batch.
#[derive(Default)]
pub struct ScriptedRegistry {
    rate_limited: Mutex<HashMap<String, u32>>,
    unregistered: Mutex<HashSet<String>>,
    calls: AtomicU32,
    held: Mutex<bool>,
    released: Condvar,
}

impl ScriptedRegistry {
    /// Answer 429 for the next `times` lookups of `id`.
    pub fn rate_limit(&self, id: &str, times: u32) {
        self.rate_limited
            .lock()
            .unwrap()
            .insert(id.to_string(), times);
    }

    pub fn unregister(&self, id: &str) {
        self.unregistered.lock().unwrap().insert(id.to_string());
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Blocks every lookup until `release`.
    pub fn hold(&self) {
        *self.held.lock().unwrap() = true;
    }

    pub fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.released.notify_all();
    }
}

impl RegistryLookup for ScriptedRegistry {
    fn lookup(&self, id_number: &str) -> Result<RegistryRecord, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.released.wait(held).unwrap();
        }
        drop(held);

        if let Some(remaining) = self.rate_limited.lock().unwrap().get_mut(id_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LookupError::RateLimited);
            }
        }

        Ok(RegistryRecord {
            registered: !self.unregistered.lock().unwrap().contains(id_number),
            ward_code: Some("79700001".to_string()),
            voting_district: Some("97090001".to_string()),
        })
    }
}

/// SQLite member store that goes "unavailable" once it has written a set
/// number of rows, until healed.
pub struct FlakyStore {
    inner: SqliteMemberStore,
    /// (rows allowed, rows written since the limit was set)
    limit: Mutex<Option<(usize, usize)>>,
}

impl FlakyStore {
    pub fn new(db: Database) -> Self {
        Self {
            inner: SqliteMemberStore::new(db),
            limit: Mutex::new(None),
        }
    }

    pub fn fail_after(&self, rows: usize) {
        *self.limit.lock().unwrap() = Some((rows, 0));
    }

    pub fn heal(&self) {
        *self.limit.lock().unwrap() = None;
    }

    fn unavailable() -> PersistError {
        PersistError::Unavailable("database connection lost".to_string())
    }
}

impl MemberStore for FlakyStore {
    fn upsert_batch(
        &self,
        job_id: &str,
        batch: &[MemberWrite],
    ) -> Result<Vec<UpsertOutcome>, BatchError> {
        let mut limit = self.limit.lock().unwrap();
        if let Some((allowed, written)) = *limit {
            if written + batch.len() > allowed {
                return Err(BatchError {
                    index: allowed.saturating_sub(written),
                    error: Self::unavailable(),
                });
            }
        }
        let outcomes = self.inner.upsert_batch(job_id, batch)?;
        if let Some((_, written)) = limit.as_mut() {
            *written += outcomes.len();
        }
        Ok(outcomes)
    }

    fn upsert_one(&self, job_id: &str, write: &MemberWrite) -> Result<UpsertOutcome, PersistError> {
        let mut limit = self.limit.lock().unwrap();
        if let Some((allowed, written)) = *limit {
            if written >= allowed {
                return Err(Self::unavailable());
            }
        }
        let outcome = self.inner.upsert_one(job_id, write)?;
        if let Some((_, written)) = limit.as_mut() {
            *written += 1;
        }
        Ok(outcome)
    }
}

/// Fields drop in order: the service stops before the temp dir goes away.
pub struct TestHarness {
    pub service: UploadService,
    pub registry: Arc<ScriptedRegistry>,
    pub members: Arc<FlakyStore>,
    /// Where test sheets are written before submission.
    pub upload_dir: PathBuf,
    /// Drop folder for watcher tests.
    pub drop_dir: PathBuf,
    temp_dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|c| c)
    }

    pub fn with_config(configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        Self::with_registry(Arc::new(ScriptedRegistry::default()), configure)
    }

    /// Lets a test script the registry before any job can reach it.
    pub fn with_registry(
        registry: Arc<ScriptedRegistry>,
        configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let upload_dir = base.join("uploads");
        let drop_dir = base.join("drop");
        std::fs::create_dir_all(&upload_dir).expect("Failed to create upload dir");
        std::fs::create_dir_all(&drop_dir).expect("Failed to create drop dir");

        let config = configure(ConfigBuilder::new(&base.join("data"))).build();
        let db = Database::open(&config.database_path()).expect("Failed to open database");
        let members = Arc::new(FlakyStore::new(db.clone()));

        let service = UploadService::builder(config)
            .database(db)
            .member_store(members.clone())
            .registry(registry.clone())
            .build()
            .expect("Failed to build service");

        Self {
            service,
            registry,
            members,
            upload_dir,
            drop_dir,
            temp_dir,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn write_sheet(&self, name: &str, sheet: &SheetBuilder) -> PathBuf {
        sheet.write_to(&self.upload_dir, name)
    }

    pub fn submit(&self, path: &Path) -> String {
        self.service
            .submit(SubmitRequest::new(path, "organiser@ward42"))
            .expect("Submit failed")
    }

    /// Polls until `predicate` holds for the job, or panics after 15s.
    pub fn wait_for(&self, job_id: &str, predicate: impl Fn(&Job) -> bool) -> Job {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let job = self.service.status(job_id).expect("Unknown job");
            if predicate(&job) {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "Timed out waiting on job {} (status {}, stage {})",
                job_id,
                job.status,
                job.stage
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn wait_for_terminal(&self, job_id: &str) -> Job {
        self.wait_for(job_id, |j| j.is_terminal())
    }

    /// Waits until `n` registry lookups have started.
    pub fn wait_for_calls(&self, n: u32) {
        let deadline = Instant::now() + Duration::from_secs(15);
        while self.registry.calls() < n {
            assert!(Instant::now() < deadline, "Timed out waiting on registry calls");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn member_count(&self) -> u64 {
        self.service.stats().expect("Stats failed").members
    }

    /// Collects events until `job_id` reports a terminal status. The final
    /// event is broadcast after the job is saved, so polling status alone
    /// can return before it arrives.
    pub fn events_until_terminal(
        rx: &mut tokio::sync::broadcast::Receiver<JobProgressEvent>,
        job_id: &str,
    ) -> Vec<JobProgressEvent> {
        let deadline = Instant::now() + Duration::from_secs(15);
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    let done = event.job_id == job_id && event.status.is_terminal();
                    events.push(event);
                    if done {
                        return events;
                    }
                }
                Err(TryRecvError::Empty) => {
                    assert!(Instant::now() < deadline, "Timed out waiting on events");
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("Event stream broke: {}", e),
            }
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        // Held lookups would keep the workers from shutting down.
        self.registry.release();
    }
}
