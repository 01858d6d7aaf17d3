use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, UNIX_EPOCH};

use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use notify::{Config as NotifyConfig, PollWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer_opt, Config as DebouncerConfig, DebouncedEventKind};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::error::WorkerError;
use crate::intake::SheetFormat;
use crate::sanitize;

use super::queue::{JobQueue, SubmitRequest};

/// Snapshot of the watcher for status queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStatus {
    pub running: bool,
    pub directory: Option<PathBuf>,
    pub files_seen: u64,
    pub files_submitted: u64,
    pub last_error: Option<String>,
}

/// State shared between the watcher handle and its thread.
struct Shared {
    queue: Arc<JobQueue>,
    directory: PathBuf,
    include: Vec<glob::Pattern>,
    submitter: String,
    seen: Mutex<HashSet<(PathBuf, u128)>>,
    files_seen: AtomicU64,
    files_submitted: AtomicU64,
    last_error: Mutex<Option<String>>,
    running: AtomicBool,
}

/// Watches a drop folder and submits new spreadsheets to the queue.
///
/// The same (path, mtime) pair is only ever submitted once. The job id is
/// derived from that pair too, so the queue's idempotent submit catches
/// anything that slips past the in-memory set.
pub struct DirectoryWatcher {
    shared: Arc<Shared>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryWatcher {
    pub fn new(directory: PathBuf, config: &WatchConfig, queue: Arc<JobQueue>) -> Result<Self, WorkerError> {
        let include = config
            .include
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| WorkerError::WatchError(format!("bad include pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let submitter = config.submitter.clone().unwrap_or_else(|| {
            format!(
                "watcher:{}",
                directory
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "drop".to_string())
            )
        });

        Ok(Self {
            shared: Arc::new(Shared {
                queue,
                directory,
                include,
                submitter,
                seen: Mutex::new(HashSet::new()),
                files_seen: AtomicU64::new(0),
                files_submitted: AtomicU64::new(0),
                last_error: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            poll_interval: config.poll_interval(),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    /// Scans what is already in the folder, then keeps watching on a
    /// background thread. Returns once the watch is established.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut thread_slot = lock(&self.thread);
        if thread_slot.is_some() {
            return Ok(());
        }
        if !self.shared.directory.is_dir() {
            return Err(WorkerError::WatchError(format!(
                "{} is not a directory",
                self.shared.directory.display()
            )));
        }

        self.shutdown.store(false, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shutdown);
        let poll_interval = self.poll_interval;
        let (ready_tx, ready_rx) = bounded::<Result<(), WorkerError>>(1);

        let handle = thread::Builder::new()
            .name("upload-watcher".to_string())
            .spawn(move || watch_loop(shared, shutdown, poll_interval, ready_tx))
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *thread_slot = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(WorkerError::WatchError("watcher thread exited during start".to_string()))
            }
        }
    }

    /// Stops watching. Jobs already submitted are not affected.
    pub fn stop(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            self.shutdown.store(true, Ordering::Relaxed);
            if handle.join().is_err() {
                error!("Watcher thread panicked");
            }
            info!("Stopped watching {}", self.shared.directory.display());
        }
    }

    pub fn status(&self) -> WatcherStatus {
        WatcherStatus {
            running: self.shared.running.load(Ordering::Relaxed),
            directory: Some(self.shared.directory.clone()),
            files_seen: self.shared.files_seen.load(Ordering::Relaxed),
            files_submitted: self.shared.files_submitted.load(Ordering::Relaxed),
            last_error: lock(&self.shared.last_error).clone(),
        }
    }

    /// One pass over the top level of the folder. Used at start and by tests.
    pub fn scan(&self) -> Result<usize, WorkerError> {
        scan_directory(&self.shared)
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            warn!("Watcher lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn watch_loop(
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    ready: crossbeam_channel::Sender<Result<(), WorkerError>>,
) {
    // Use PollWatcher for Docker/NFS compatibility
    let poll_config = NotifyConfig::default().with_poll_interval(poll_interval);
    let debouncer_config = DebouncerConfig::default()
        .with_timeout(Duration::from_millis(500))
        .with_notify_config(poll_config);

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = match new_debouncer_opt::<_, PollWatcher>(debouncer_config, tx) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready.send(Err(WorkerError::WatchError(e.to_string())));
            return;
        }
    };
    if let Err(e) = debouncer
        .watcher()
        .watch(&shared.directory, RecursiveMode::NonRecursive)
    {
        let _ = ready.send(Err(WorkerError::WatchError(e.to_string())));
        return;
    }

    shared.running.store(true, Ordering::Relaxed);
    let _ = ready.send(Ok(()));
    info!("Watching directory: {}", shared.directory.display());

    if let Err(e) = scan_directory(&shared) {
        record_error(&shared, e.to_string());
    }

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Watch mode shutting down...");
            break;
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(events)) => {
                for event in events {
                    if matches!(event.kind, DebouncedEventKind::Any) {
                        consider(&shared, &event.path);
                    }
                }
                prune_seen(&shared);
            }
            Ok(Err(e)) => {
                warn!("Watch error: {:?}", e);
                record_error(&shared, e.to_string());
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                error!("Watch channel disconnected");
                record_error(&shared, "watch channel disconnected".to_string());
                break;
            }
        }
    }

    shared.running.store(false, Ordering::Relaxed);
}

fn scan_directory(shared: &Shared) -> Result<usize, WorkerError> {
    let mut submitted = 0;
    for entry in WalkDir::new(&shared.directory)
        .min_depth(1)
        .max_depth(1) // Only the top level
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| WorkerError::ScanFailed {
            path: shared.directory.clone(),
            source: e,
        })?;
        if consider(shared, entry.path()) {
            submitted += 1;
        }
    }
    debug!("Initial scan of {} submitted {} file(s)", shared.directory.display(), submitted);
    Ok(submitted)
}

/// Whether a file name looks like an upload, rather than a temp, hidden or
/// partially copied file.
fn is_candidate(path: &Path, include: &[glob::Pattern]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.starts_with("~$") || name.ends_with(".part") {
        return false;
    }
    if SheetFormat::from_path(path).is_none() {
        return false;
    }
    include.is_empty() || include.iter().any(|p| p.matches(name))
}

/// Submits `path` unless it was already seen with the same mtime. Returns
/// whether a new job was created.
fn consider(shared: &Shared, path: &Path) -> bool {
    if !path.is_file() || !is_candidate(path, &shared.include) {
        return false;
    }

    let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default(),
        Err(e) => {
            debug!("Skipping {}: {}", sanitize::redact_path(path), e);
            return false;
        }
    };
    // Readability check before anything is recorded.
    if let Err(e) = std::fs::File::open(path) {
        record_error(shared, format!("{}: {}", sanitize::redact_path(path), e));
        return false;
    }

    let key = (path.to_path_buf(), mtime);
    if !lock(&shared.seen).insert(key) {
        return false;
    }
    shared.files_seen.fetch_add(1, Ordering::Relaxed);

    let request = SubmitRequest {
        path: path.to_path_buf(),
        submitted_by: shared.submitter.clone(),
        job_id: Some(sanitize::hash_path_with(path, mtime)),
    };
    match shared.queue.submit_file(request) {
        Ok(submission) if submission.created => {
            info!("New upload detected: {}", sanitize::redact_path(path));
            shared.files_submitted.fetch_add(1, Ordering::Relaxed);
            true
        }
        Ok(_) => false,
        Err(e) => {
            warn!("Rejected {}: {}", sanitize::redact_path(path), e);
            record_error(shared, format!("{}: {}", sanitize::redact_path(path), e));
            false
        }
    }
}

/// Forgets files that are gone, so the set does not grow without bound.
fn prune_seen(shared: &Shared) {
    lock(&shared.seen).retain(|(path, _)| path.exists());
}

fn record_error(shared: &Shared, message: String) {
    *lock(&shared.last_error) = Some(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::JobProgressBroadcaster;
    use crate::config::{IntakeConfig, QueueConfig};
    use crate::db::Database;
    use crate::store::JobStore;
    use tempfile::TempDir;

    const CSV: &str = "id_number,first_name,surname,cell_number,ward_code\n\
                       8001015009087,Thandi,Mokoena,0821234567,79700001\n";

    fn watcher(dir: &Path) -> (DirectoryWatcher, Arc<JobQueue>) {
        let store = Arc::new(
            JobStore::new(Database::open_in_memory().unwrap(), dir.join("reports")).unwrap(),
        );
        let queue = Arc::new(JobQueue::new(
            store,
            JobProgressBroadcaster::default(),
            IntakeConfig::default(),
            QueueConfig::default(),
        ));
        let drop_dir = dir.join("drop");
        std::fs::create_dir_all(&drop_dir).unwrap();
        let config = WatchConfig {
            poll_interval_secs: 1,
            ..WatchConfig::default()
        };
        let watcher = DirectoryWatcher::new(drop_dir, &config, Arc::clone(&queue)).unwrap();
        (watcher, queue)
    }

    #[test]
    fn test_candidate_filter() {
        let include = vec![glob::Pattern::new("*.csv").unwrap()];
        assert!(is_candidate(Path::new("/d/members.csv"), &include));
        assert!(!is_candidate(Path::new("/d/.members.csv"), &include));
        assert!(!is_candidate(Path::new("/d/~$members.xlsx"), &[]));
        assert!(!is_candidate(Path::new("/d/members.csv.part"), &include));
        assert!(!is_candidate(Path::new("/d/members.xlsx"), &include));
        assert!(!is_candidate(Path::new("/d/notes.pdf"), &[]));
    }

    #[test]
    fn test_scan_submits_once_per_path_and_mtime() {
        let dir = TempDir::new().unwrap();
        let (watcher, queue) = watcher(dir.path());
        std::fs::write(watcher.directory().join("a.csv"), CSV).unwrap();
        std::fs::write(watcher.directory().join("b.csv"), CSV).unwrap();
        std::fs::write(watcher.directory().join("ignore.pdf"), "x").unwrap();

        assert_eq!(watcher.scan().unwrap(), 2);
        assert_eq!(watcher.scan().unwrap(), 0);
        assert_eq!(queue.active_count(), 2);

        let status = watcher.status();
        assert_eq!(status.files_seen, 2);
        assert_eq!(status.files_submitted, 2);
        assert!(!status.running);
    }

    #[test]
    fn test_rejected_file_is_recorded() {
        let dir = TempDir::new().unwrap();
        let (watcher, queue) = watcher(dir.path());
        std::fs::write(watcher.directory().join("bad.csv"), "first_name\nThandi\n").unwrap();

        assert_eq!(watcher.scan().unwrap(), 0);
        assert_eq!(queue.active_count(), 0);
        assert!(watcher.status().last_error.unwrap().contains("bad.csv"));
    }

    #[test]
    fn test_start_stop() {
        let dir = TempDir::new().unwrap();
        let (watcher, queue) = watcher(dir.path());
        std::fs::write(watcher.directory().join("a.csv"), CSV).unwrap();

        watcher.start().unwrap();
        assert!(watcher.status().running);
        // Initial scan runs right after the watch is set up.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queue.active_count() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(queue.active_count(), 1);

        watcher.stop();
        assert!(!watcher.status().running);
        // Stopping leaves submitted jobs alone.
        assert_eq!(queue.active_count(), 1);
    }

    #[test]
    fn test_start_rejects_missing_directory() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            JobStore::new(Database::open_in_memory().unwrap(), dir.path().join("r")).unwrap(),
        );
        let queue = Arc::new(JobQueue::new(
            store,
            JobProgressBroadcaster::default(),
            IntakeConfig::default(),
            QueueConfig::default(),
        ));
        let watcher =
            DirectoryWatcher::new(dir.path().join("missing"), &WatchConfig::default(), queue)
                .unwrap();
        assert!(matches!(watcher.start(), Err(WorkerError::WatchError(_))));
    }
}
