//! Per-job audit report.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::verify::VerificationStatus;
use crate::worker::{JobCounts, JobStatus};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Report I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to render report as CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("A report for job {0} already exists")]
    AlreadyExists(String),

    #[error("No report for job {0}")]
    NotFound(String),
}

/// Why a row did not end up inserted or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowCategory {
    Duplicate,
    ValidationFailed,
    VerificationFailed,
    PersistFailed,
    /// Valid but not persisted by policy.
    Skipped,
}

impl RowCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RowCategory::Duplicate => "duplicate",
            RowCategory::ValidationFailed => "validation_failed",
            RowCategory::VerificationFailed => "verification_failed",
            RowCategory::PersistFailed => "persist_failed",
            RowCategory::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    /// 1-based line in the source file.
    pub line: usize,
    pub id_number: Option<String>,
    pub category: RowCategory,
    /// Machine-readable reason, e.g. `checksum_mismatch` or `rate_limited`.
    pub code: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationStatus>,
}

/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub job_id: String,
    pub filename: String,
    pub generated_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub counts: JobCounts,
    /// Every row that was not inserted or updated, in file order.
    pub rows: Vec<ReportRow>,
}

impl Report {
    pub fn rows_in(&self, category: RowCategory) -> impl Iterator<Item = &ReportRow> {
        self.rows.iter().filter(move |r| r.category == category)
    }

    /// CSV rendering for download.
    pub fn to_csv(&self) -> Result<Vec<u8>, ReportError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["line", "id_number", "category", "code", "reason", "verification"])?;
        for row in &self.rows {
            let line = row.line.to_string();
            writer.write_record([
                line.as_str(),
                row.id_number.as_deref().unwrap_or(""),
                row.category.as_str(),
                row.code.as_str(),
                row.reason.as_str(),
                row.verification.map(|v| v.as_str()).unwrap_or(""),
            ])?;
        }
        writer.flush().map_err(|e| ReportError::Io {
            path: PathBuf::from(self.download_name()),
            source: e,
        })?;
        writer
            .into_inner()
            .map_err(|e| ReportError::Csv(csv::Error::from(e.into_error())))
    }

    /// `member-upload-report-{file stem}-{job id prefix}.csv`
    pub fn download_name(&self) -> String {
        let stem = std::path::Path::new(&self.filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let stem = if stem.is_empty() { "upload".to_string() } else { stem };
        let prefix: String = self.job_id.chars().take(8).collect();
        format!("member-upload-report-{}-{}.csv", stem, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> Report {
        Report {
            job_id: "3f2a9c1e-77aa-4a7e-9a51-2a0f4e0c1d2b".to_string(),
            filename: "Ward 42 members.xlsx".to_string(),
            generated_at: Utc::now(),
            status: JobStatus::Completed,
            error: None,
            counts: JobCounts {
                total: 3,
                processed: 3,
                ..JobCounts::default()
            },
            rows: vec![
                ReportRow {
                    line: 2,
                    id_number: Some("8001015009088".to_string()),
                    category: RowCategory::ValidationFailed,
                    code: "checksum_mismatch".to_string(),
                    reason: "id_number checksum digit is wrong".to_string(),
                    verification: None,
                },
                ReportRow {
                    line: 4,
                    id_number: Some("8001015009087".to_string()),
                    category: RowCategory::Duplicate,
                    code: "duplicate".to_string(),
                    reason: "same id_number as line 3".to_string(),
                    verification: None,
                },
            ],
        }
    }

    #[test]
    fn test_download_name() {
        assert_eq!(
            report().download_name(),
            "member-upload-report-Ward_42_members-3f2a9c1e.csv"
        );
    }

    #[test]
    fn test_csv_rendering() {
        let csv = String::from_utf8(report().to_csv().unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "line,id_number,category,code,reason,verification");
        assert_eq!(
            lines[1],
            "2,8001015009088,validation_failed,checksum_mismatch,id_number checksum digit is wrong,"
        );
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_rows_in_category() {
        let report = report();
        assert_eq!(report.rows_in(RowCategory::Duplicate).count(), 1);
        assert_eq!(report.rows_in(RowCategory::PersistFailed).count(), 0);
    }
}
