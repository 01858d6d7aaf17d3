//! Aggregate upload statistics.

use serde::Serialize;

use super::{Database, DatabaseError};

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Totals across all retained jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub jobs: StatusCounts,
    pub total_jobs: u64,
    pub total_rows: u64,
    pub succeeded_rows: u64,
    pub failed_rows: u64,
    pub duplicate_rows: u64,
    pub members: u64,
}

pub fn upload_stats(db: &Database) -> Result<UploadStats, DatabaseError> {
    db.with_conn(|conn| {
        let mut stats = UploadStats::default();

        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(total_rows), 0),
                    COALESCE(SUM(succeeded_rows), 0), COALESCE(SUM(failed_rows), 0),
                    COALESCE(SUM(duplicate_rows), 0)
             FROM upload_jobs GROUP BY status",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, u64>(1)?,
                r.get::<_, u64>(2)?,
                r.get::<_, u64>(3)?,
                r.get::<_, u64>(4)?,
                r.get::<_, u64>(5)?,
            ))
        })?;

        for row in rows {
            let (status, jobs, total, succeeded, failed, duplicate) = row?;
            match status.as_str() {
                "pending" => stats.jobs.pending = jobs,
                "processing" => stats.jobs.processing = jobs,
                "completed" => stats.jobs.completed = jobs,
                "failed" => stats.jobs.failed = jobs,
                "cancelled" => stats.jobs.cancelled = jobs,
                other => log::warn!("Unknown job status '{}' in stats", other),
            }
            stats.total_jobs += jobs;
            stats.total_rows += total;
            stats.succeeded_rows += succeeded;
            stats.failed_rows += failed;
            stats.duplicate_rows += duplicate;
        }

        stats.members = conn.query_row("SELECT COUNT(*) FROM members", [], |r| r.get(0))?;
        Ok(stats)
    })
}
