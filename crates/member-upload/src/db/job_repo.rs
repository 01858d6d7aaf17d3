//! Job repository: CRUD over the `upload_jobs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

/// A raw job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: String,
    pub filename: String,
    pub source_path: String,
    pub byte_size: i64,
    pub submitted_by: String,
    pub status: String,
    pub stage: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub retryable: bool,
    pub attempts: i64,
    pub next_attempt_at: Option<String>,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub succeeded_rows: i64,
    pub failed_rows: i64,
    pub duplicate_rows: i64,
    /// Full per-category breakdown as JSON.
    pub counts: Option<String>,
    pub report_path: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            filename: row.get("filename")?,
            source_path: row.get("source_path")?,
            byte_size: row.get("byte_size")?,
            submitted_by: row.get("submitted_by")?,
            status: row.get("status")?,
            stage: row.get("stage")?,
            message: row.get("message")?,
            error: row.get("error")?,
            retryable: row.get("retryable")?,
            attempts: row.get("attempts")?,
            next_attempt_at: row.get("next_attempt_at")?,
            total_rows: row.get("total_rows")?,
            processed_rows: row.get("processed_rows")?,
            succeeded_rows: row.get("succeeded_rows")?,
            failed_rows: row.get("failed_rows")?,
            duplicate_rows: row.get("duplicate_rows")?,
            counts: row.get("counts")?,
            report_path: row.get("report_path")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Query filter for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub submitted_by: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts the row, or overwrites every mutable column of an existing one.
/// `created_at` is kept from the first insert.
pub fn upsert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO upload_jobs (id, filename, source_path, byte_size, submitted_by, status,
             stage, message, error, retryable, attempts, next_attempt_at, total_rows,
             processed_rows, succeeded_rows, failed_rows, duplicate_rows, counts, report_path,
             created_at, started_at, finished_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22, ?23)
             ON CONFLICT(id) DO UPDATE SET
               filename = excluded.filename,
               source_path = excluded.source_path,
               byte_size = excluded.byte_size,
               submitted_by = excluded.submitted_by,
               status = excluded.status,
               stage = excluded.stage,
               message = excluded.message,
               error = excluded.error,
               retryable = excluded.retryable,
               attempts = excluded.attempts,
               next_attempt_at = excluded.next_attempt_at,
               total_rows = excluded.total_rows,
               processed_rows = excluded.processed_rows,
               succeeded_rows = excluded.succeeded_rows,
               failed_rows = excluded.failed_rows,
               duplicate_rows = excluded.duplicate_rows,
               counts = excluded.counts,
               report_path = excluded.report_path,
               started_at = excluded.started_at,
               finished_at = excluded.finished_at,
               updated_at = excluded.updated_at",
            params![
                job.id,
                job.filename,
                job.source_path,
                job.byte_size,
                job.submitted_by,
                job.status,
                job.stage,
                job.message,
                job.error,
                job.retryable,
                job.attempts,
                job.next_attempt_at,
                job.total_rows,
                job.processed_rows,
                job.succeeded_rows,
                job.failed_rows,
                job.duplicate_rows,
                job.counts,
                job.report_path,
                job.created_at,
                job.started_at,
                job.finished_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM upload_jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

pub fn exists(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let found: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM upload_jobs WHERE id = ?1)",
            params![id],
            |r| r.get(0),
        )?;
        Ok(found)
    })
}

/// Queries jobs with filters, newest first. Returns (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref submitted_by) = filter.submitted_by {
            conditions.push(format!("submitted_by = ?{}", param_values.len() + 1));
            param_values.push(Box::new(submitted_by.clone()));
        }
        if let Some(ref from_date) = filter.from_date {
            conditions.push(format!("created_at >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(from_date.clone()));
        }
        if let Some(ref to_date) = filter.to_date {
            conditions.push(format!("created_at <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(to_date.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM upload_jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM upload_jobs {} ORDER BY created_at DESC, id LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// All jobs in `status`, oldest first.
pub fn find_by_status(db: &Database, status: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT * FROM upload_jobs WHERE status = ?1 ORDER BY created_at, id")?;
        let rows = stmt
            .query_map(params![status], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Retryable failed jobs whose backoff has elapsed and that still have
/// attempts left.
pub fn find_retry_due(
    db: &Database,
    now: &str,
    max_attempts: u32,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_jobs
             WHERE status = 'failed' AND retryable = 1 AND attempts < ?1
               AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?2
             ORDER BY next_attempt_at, id",
        )?;
        let rows = stmt
            .query_map(params![max_attempts, now], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Terminal jobs that finished before `cutoff`.
pub fn find_terminal_before(db: &Database, cutoff: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT * FROM upload_jobs
             WHERE status IN {} AND finished_at IS NOT NULL AND finished_at < ?1
             ORDER BY finished_at",
            TERMINAL_STATUSES
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![cutoff], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes one job, but only while it is still terminal and older than
/// `cutoff`. A job re-queued in the meantime is left alone.
pub fn delete_if_terminal_before(
    db: &Database,
    id: &str,
    cutoff: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "DELETE FROM upload_jobs
             WHERE id = ?1 AND status IN {} AND finished_at IS NOT NULL AND finished_at < ?2",
            TERMINAL_STATUSES
        );
        let deleted = conn.execute(&sql, params![id, cutoff])?;
        Ok(deleted > 0)
    })
}

/// Returns (status, count) pairs.
pub fn count_by_status(db: &Database) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM upload_jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
