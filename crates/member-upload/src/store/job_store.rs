//! Job store with persistent database storage and on-disk reports.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::JobPhase;
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::stats_repo::{self, UploadStats};
use crate::db::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::error::Result;
use crate::worker::{Job, JobCounts, JobStatus};

use super::report::{Report, ReportError};

// ─── Row conversion ─────────────────────────────────────────────────────────

fn job_to_row(job: &Job) -> JobRow {
    JobRow {
        id: job.id.clone(),
        filename: job.filename.clone(),
        source_path: job.source_path.to_string_lossy().to_string(),
        byte_size: job.byte_size as i64,
        submitted_by: job.submitted_by.clone(),
        status: job.status.as_str().to_string(),
        stage: Some(job.stage.as_str().to_string()),
        message: job.message.clone(),
        error: job.error.clone(),
        retryable: job.retryable,
        attempts: i64::from(job.attempts),
        next_attempt_at: job.next_attempt_at.as_ref().map(format_timestamp),
        total_rows: job.counts.total as i64,
        processed_rows: job.counts.processed as i64,
        succeeded_rows: job.counts.succeeded() as i64,
        failed_rows: job.counts.failed() as i64,
        duplicate_rows: job.counts.duplicate as i64,
        counts: serde_json::to_string(&job.counts).ok(),
        report_path: job
            .report_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
        created_at: format_timestamp(&job.created_at),
        started_at: job.started_at.as_ref().map(format_timestamp),
        finished_at: job.finished_at.as_ref().map(format_timestamp),
        updated_at: format_timestamp(&job.updated_at),
    }
}

fn job_from_row(row: JobRow) -> std::result::Result<Job, DatabaseError> {
    let status = JobStatus::parse(&row.status).ok_or_else(|| DatabaseError::InvalidValue {
        column: "status",
        value: row.status.clone(),
    })?;

    let stage = match row.stage.as_deref() {
        None => JobPhase::Queued,
        Some(s) => JobPhase::parse(s).unwrap_or_else(|| {
            log::warn!("Unknown job stage '{}' for job {}, defaulting to Queued", s, row.id);
            JobPhase::Queued
        }),
    };

    let counts: JobCounts = match row.counts.as_deref() {
        Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
            log::warn!("Unreadable counts for job {}: {}", row.id, e);
            fallback_counts(&row)
        }),
        None => fallback_counts(&row),
    };

    let created_at = parse_timestamp(&row.created_at).ok_or_else(|| DatabaseError::InvalidValue {
        column: "created_at",
        value: row.created_at.clone(),
    })?;
    let updated_at = parse_timestamp(&row.updated_at).unwrap_or(created_at);

    Ok(Job {
        id: row.id,
        filename: row.filename,
        source_path: PathBuf::from(row.source_path),
        byte_size: row.byte_size.max(0) as u64,
        submitted_by: row.submitted_by,
        status,
        stage,
        message: row.message,
        error: row.error,
        retryable: row.retryable,
        attempts: row.attempts.clamp(0, i64::from(u32::MAX)) as u32,
        next_attempt_at: row.next_attempt_at.as_deref().and_then(parse_timestamp),
        counts,
        report_path: row.report_path.map(PathBuf::from),
        created_at,
        started_at: row.started_at.as_deref().and_then(parse_timestamp),
        finished_at: row.finished_at.as_deref().and_then(parse_timestamp),
        updated_at,
    })
}

/// Best effort from the aggregate columns when the JSON is missing.
fn fallback_counts(row: &JobRow) -> JobCounts {
    JobCounts {
        total: row.total_rows.max(0) as u64,
        processed: row.processed_rows.max(0) as u64,
        inserted: row.succeeded_rows.max(0) as u64,
        duplicate: row.duplicate_rows.max(0) as u64,
        validation_failed: row.failed_rows.max(0) as u64,
        ..JobCounts::default()
    }
}

fn rows_to_jobs(rows: Vec<JobRow>) -> std::result::Result<Vec<Job>, DatabaseError> {
    rows.into_iter().map(job_from_row).collect()
}

// ─── Query types ────────────────────────────────────────────────────────────

/// Filter for job history listing.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub submitted_by: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// One page of job history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Job records in SQLite, report artifacts as JSON files beside them.
///
/// The database row is the source of truth for a job; the report file is
/// reachable through the row's `report_path` and is deleted together with it.
pub struct JobStore {
    db: Database,
    reports_dir: PathBuf,
}

impl JobStore {
    pub fn new(db: Database, reports_dir: PathBuf) -> std::result::Result<Self, ReportError> {
        fs::create_dir_all(&reports_dir).map_err(|e| ReportError::Io {
            path: reports_dir.clone(),
            source: e,
        })?;
        Ok(Self { db, reports_dir })
    }

    /// Database handle (clone is cheap, inner `Arc`).
    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    pub fn save(&self, job: &Job) -> std::result::Result<(), DatabaseError> {
        job_repo::upsert(&self.db, &job_to_row(job))
    }

    pub fn load(&self, job_id: &str) -> std::result::Result<Option<Job>, DatabaseError> {
        job_repo::find_by_id(&self.db, job_id)?
            .map(job_from_row)
            .transpose()
    }

    pub fn exists(&self, job_id: &str) -> std::result::Result<bool, DatabaseError> {
        job_repo::exists(&self.db, job_id)
    }

    pub fn report_path(&self, job_id: &str) -> PathBuf {
        self.reports_dir.join(format!("{}.json", job_id))
    }

    /// Writes the report for `report.job_id`. Fails with `AlreadyExists`
    /// rather than replacing an existing report.
    pub fn save_report(&self, report: &Report) -> std::result::Result<PathBuf, ReportError> {
        let path = self.report_path(&report.job_id);
        let json = serde_json::to_vec_pretty(report)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ReportError::AlreadyExists(report.job_id.clone()))
            }
            Err(e) => return Err(ReportError::Io { path, source: e }),
        };

        if let Err(e) = file.write_all(&json).and_then(|_| file.sync_all()) {
            // Never leave a truncated report behind.
            let _ = fs::remove_file(&path);
            return Err(ReportError::Io { path, source: e });
        }

        log::debug!("Report written for job {}", report.job_id);
        Ok(path)
    }

    pub fn load_report(&self, job_id: &str) -> std::result::Result<Report, ReportError> {
        let path = self.report_path(job_id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ReportError::NotFound(job_id.to_string()))
            }
            Err(e) => return Err(ReportError::Io { path, source: e }),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Drops the report of a previous attempt before a job is re-queued.
    pub fn remove_report(&self, job_id: &str) -> bool {
        remove_quietly(&self.report_path(job_id))
    }

    /// Most recently created jobs first.
    pub fn list_recent(&self, limit: u64) -> std::result::Result<Vec<Job>, DatabaseError> {
        let filter = JobFilter {
            limit: Some(limit),
            ..JobFilter::default()
        };
        let (rows, _) = job_repo::query(&self.db, &filter)?;
        rows_to_jobs(rows)
    }

    pub fn query(&self, query: &JobQuery) -> std::result::Result<JobPage, DatabaseError> {
        let filter = JobFilter {
            status: query.status.map(|s| s.as_str().to_string()),
            submitted_by: query.submitted_by.clone(),
            from_date: query.from_date.as_ref().map(format_timestamp),
            to_date: query.to_date.as_ref().map(format_timestamp),
            limit: query.limit,
            offset: query.offset,
        };
        let (rows, total) = job_repo::query(&self.db, &filter)?;
        Ok(JobPage {
            jobs: rows_to_jobs(rows)?,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    pub fn find_by_status(&self, status: JobStatus) -> std::result::Result<Vec<Job>, DatabaseError> {
        rows_to_jobs(job_repo::find_by_status(&self.db, status.as_str())?)
    }

    /// Retryable failed jobs whose backoff has elapsed.
    pub fn find_retry_due(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> std::result::Result<Vec<Job>, DatabaseError> {
        rows_to_jobs(job_repo::find_retry_due(
            &self.db,
            &format_timestamp(&now),
            max_attempts,
        )?)
    }

    /// Deletes terminal jobs that finished more than `retention` ago, along
    /// with their reports. Pending and processing jobs are never touched.
    /// Returns the number of jobs deleted.
    pub fn delete_older_than(&self, retention: chrono::Duration) -> Result<usize> {
        let cutoff = format_timestamp(&(Utc::now() - retention));
        let candidates = job_repo::find_terminal_before(&self.db, &cutoff)?;

        let mut deleted = 0;
        for row in candidates {
            // Re-checked in the DELETE itself: a job retried since the SELECT
            // is no longer terminal and stays.
            if !job_repo::delete_if_terminal_before(&self.db, &row.id, &cutoff)? {
                continue;
            }
            deleted += 1;

            let report = row
                .report_path
                .map(PathBuf::from)
                .unwrap_or_else(|| self.report_path(&row.id));
            remove_quietly(&report);
        }

        if deleted > 0 {
            log::info!("Retention removed {} job(s) older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    /// Removes report files in `dir` that no job row points to.
    pub fn delete_orphaned(&self, dir: &Path) -> Result<usize> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(ReportError::Io {
                    path: dir.to_path_buf(),
                    source: e,
                }
                .into())
            }
        };

        let mut deleted = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(job_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if job_repo::exists(&self.db, job_id)? {
                continue;
            }
            if remove_quietly(&path) {
                deleted += 1;
            }
        }

        if deleted > 0 {
            log::info!("Removed {} orphaned report(s)", deleted);
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> std::result::Result<UploadStats, DatabaseError> {
        stats_repo::upload_stats(&self.db)
    }
}

/// Removes a file, treating "already gone" as success.
fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            log::warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}
