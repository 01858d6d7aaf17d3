use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use log::{debug, error, info, warn};
use member_upload::broadcast::JobPhase;
use member_upload::worker::crossbeam_channel::{self, RecvTimeoutError};
use member_upload::{UploadConfig, UploadService};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("MEMBER_UPLOAD_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let installed = if json {
        tracing::subscriber::set_global_default(fmt().json().with_env_filter(filter).finish())
    } else {
        tracing::subscriber::set_global_default(fmt().with_env_filter(filter).finish())
    };
    if let Err(e) = installed {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }

    // Library code logs through the `log` facade
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge log records into tracing: {}", e);
    }
}

/// Mirrors job events into the log until the service goes away.
fn spawn_event_logger(service: &UploadService) {
    let mut events = service.subscribe();
    let spawned = thread::Builder::new()
        .name("upload-events".to_string())
        .spawn(move || loop {
            match events.blocking_recv() {
                Ok(event) => match event.phase {
                    JobPhase::Completed => info!(
                        "Job {} ({}) completed: {} saved, {} failed, {} duplicate",
                        event.job_id,
                        event.filename,
                        event.counts.succeeded(),
                        event.counts.failed(),
                        event.counts.duplicate
                    ),
                    JobPhase::Failed => warn!(
                        "Job {} ({}) failed{}: {}",
                        event.job_id,
                        event.filename,
                        if event.retryable { " (retryable)" } else { "" },
                        event.error.as_deref().unwrap_or("unknown error")
                    ),
                    JobPhase::Stalled => warn!("Job {} stalled: {}", event.job_id, event.message),
                    _ => debug!(
                        "Job {} [{}] {}% {}",
                        event.job_id, event.phase, event.percentage, event.message
                    ),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event logger fell behind, skipped {} event(s)", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        });
    if let Err(e) = spawned {
        warn!("Job events will not be logged: {}", e);
    }
}

fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    match dotenv {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Failed to load .env: {}", e),
    }

    info!("Starting member upload daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = match UploadConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let sweep_interval = config.retention.sweep_interval();

    let service = match UploadService::builder(config).build() {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to start upload service: {}", e);
            return ExitCode::FAILURE;
        }
    };

    spawn_event_logger(&service);

    if service.config().watch.directory.is_some() {
        match service.start_watcher(None) {
            Ok(status) => info!("Drop folder watcher running: {:?}", status.directory),
            Err(e) => error!("Failed to start drop folder watcher: {}", e),
        }
    }

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        error!("Failed to install Ctrl-C handler: {}", e);
        service.shutdown();
        return ExitCode::FAILURE;
    }

    // Dropping the sender ends the retention loop.
    let (retention_stop_tx, retention_stop_rx) = crossbeam_channel::bounded::<()>(0);
    let retention_service = Arc::clone(&service);
    let retention = thread::Builder::new()
        .name("upload-retention".to_string())
        .spawn(move || loop {
            match retention_service.run_retention() {
                Ok(sweep) => info!(
                    "Retention sweep: {} job(s), {} orphaned report(s) removed",
                    sweep.jobs_deleted, sweep.orphans_deleted
                ),
                Err(e) => error!("Retention sweep failed: {}", e),
            }
            if let Ok(next) = chrono::Duration::from_std(sweep_interval) {
                debug!("Next retention sweep at {}", Utc::now() + next);
            }
            match retention_stop_rx.recv_timeout(sweep_interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        });
    let retention = match retention {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Retention sweeps disabled: {}", e);
            None
        }
    };

    let _ = stop_rx.recv();
    info!("Shutting down...");

    drop(retention_stop_tx);
    if let Some(handle) = retention {
        if handle.join().is_err() {
            error!("Retention thread panicked");
        }
    }
    service.shutdown();

    info!("Stopped");
    ExitCode::SUCCESS
}
