use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::WorkerError;
use crate::pipeline::{Pipeline, TrackedProgress};

use super::job::{Interrupt, JobResult};
use super::queue::JobQueue;

const POLL: Duration = Duration::from_millis(100);

/// Fixed set of worker threads draining the queue, plus one supervisor
/// thread for stall detection and automatic retries.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    queue: Arc<JobQueue>,
}

impl WorkerPool {
    pub fn start(
        queue: Arc<JobQueue>,
        pipeline: Arc<Pipeline>,
        config: &QueueConfig,
    ) -> Result<Self, WorkerError> {
        if config.worker_count == 0 {
            return Err(WorkerError::SpawnFailed("worker_count must be > 0".to_string()));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            workers: Vec::with_capacity(config.worker_count),
            supervisor: None,
            shutdown: Arc::clone(&shutdown),
            queue: Arc::clone(&queue),
        };

        for worker_id in 0..config.worker_count {
            let receiver = queue.receiver();
            let worker_queue = Arc::clone(&queue);
            let worker_pipeline = Arc::clone(&pipeline);
            let shutdown_flag = Arc::clone(&shutdown);

            let spawned = thread::Builder::new()
                .name(format!("upload-worker-{}", worker_id))
                .spawn(move || {
                    run_worker(worker_id, receiver, worker_queue, worker_pipeline, shutdown_flag)
                });
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        let supervisor_queue = Arc::clone(&queue);
        let shutdown_flag = Arc::clone(&shutdown);
        let interval = config.supervisor_interval();
        let spawned = thread::Builder::new()
            .name("upload-supervisor".to_string())
            .spawn(move || run_supervisor(supervisor_queue, shutdown_flag, interval));
        match spawned {
            Ok(handle) => pool.supervisor = Some(handle),
            Err(e) => {
                pool.shutdown();
                return Err(WorkerError::SpawnFailed(e.to_string()));
            }
        }

        info!("Started {} workers", config.worker_count);
        Ok(pool)
    }

    /// Stops taking new jobs and asks running jobs to stop at their next
    /// checkpoint. Interrupted jobs end up as retryable failures.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("Shutting down worker pool...");
        self.queue.interrupt_all(Interrupt::Shutdown);
    }

    pub fn wait(mut self) {
        for (i, worker) in self.workers.drain(..).enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        if let Some(supervisor) = self.supervisor.take() {
            if supervisor.join().is_err() {
                error!("Supervisor panicked");
            }
        }
        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn run_worker(
    worker_id: usize,
    receiver: Receiver<String>,
    queue: Arc<JobQueue>,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match receiver.recv_timeout(POLL) {
            Ok(job_id) => {
                let Some(handle) = queue.claim(&job_id) else {
                    debug!("Worker {} skipping job {} (no longer pending)", worker_id, job_id);
                    continue;
                };
                debug!("Worker {} processing job {}", worker_id, job_id);

                let job = handle.snapshot();
                let progress = TrackedProgress::new(
                    Arc::clone(&handle),
                    Arc::clone(queue.store()),
                    queue.broadcaster().clone(),
                );
                let result = panic::catch_unwind(AssertUnwindSafe(|| pipeline.run(&job, &progress)))
                    .unwrap_or_else(|_| {
                        error!("Worker {} panicked while processing job {}", worker_id, job_id);
                        JobResult::failed(
                            &job_id,
                            handle.with(|j| j.counts),
                            "Internal error while processing the job".to_string(),
                            true,
                            None,
                        )
                    });

                queue.finish(&handle, result);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} job channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn run_supervisor(queue: Arc<JobQueue>, shutdown: Arc<AtomicBool>, interval: Duration) {
    let mut last_sweep = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(POLL.min(interval));
        if last_sweep.elapsed() < interval {
            continue;
        }
        last_sweep = Instant::now();

        queue.settle_unsaved();
        queue.flag_stalled();
        match queue.requeue_due() {
            Ok(0) => {}
            Ok(n) => info!("Re-queued {} job(s) for automatic retry", n),
            Err(e) => warn!("Automatic retry sweep failed: {}", e),
        }
    }

    debug!("Supervisor stopped");
}
