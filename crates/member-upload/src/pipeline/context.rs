use crate::intake::{Field, RowValidationError, ValidatedRow, ValidationResult};
use crate::store::{ReportRow, RowCategory};
use crate::verify::{Verification, VerificationStatus};
use crate::worker::{Job, JobCounts};

/// Where a row ended up in the member store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted,
    Updated,
    /// Later occurrence of an id_number already in the file.
    DuplicateSkipped,
    /// Not written by policy (failed verification, or not found with
    /// `persist_not_found` off).
    Skipped,
    Failed(String),
}

/// Validation, verification and persistence result of one row.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub line: usize,
    pub id_number: Option<String>,
    pub validation: Option<RowValidationError>,
    pub duplicate_of: Option<usize>,
    /// `None` until verification ran.
    pub verification: Option<Verification>,
    /// `None` until the row is final.
    pub persistence: Option<PersistOutcome>,
}

impl RecordOutcome {
    pub fn from_validated(row: &ValidatedRow) -> Self {
        let mut outcome = Self {
            line: row.line(),
            id_number: row.raw.get(Field::IdNumber).map(str::to_string),
            validation: None,
            duplicate_of: None,
            verification: None,
            persistence: None,
        };
        match &row.result {
            ValidationResult::Valid(_) => {}
            ValidationResult::Invalid(e) => outcome.validation = Some(e.clone()),
            ValidationResult::Duplicate { first_line } => {
                outcome.duplicate_of = Some(*first_line)
            }
        }
        outcome
    }

    pub fn is_final(&self) -> bool {
        self.validation.is_some() || self.persistence.is_some()
    }

    /// Report line for anything that did not end up inserted or updated.
    pub fn report_row(&self) -> Option<ReportRow> {
        let (category, code, reason) = if let Some(e) = &self.validation {
            (RowCategory::ValidationFailed, e.code().to_string(), e.to_string())
        } else {
            match self.persistence.as_ref()? {
                PersistOutcome::Inserted | PersistOutcome::Updated => return None,
                PersistOutcome::DuplicateSkipped => (
                    RowCategory::Duplicate,
                    "duplicate".to_string(),
                    format!(
                        "same id_number as line {}",
                        self.duplicate_of.unwrap_or_default()
                    ),
                ),
                PersistOutcome::Failed(reason) => (
                    RowCategory::PersistFailed,
                    "persist_failed".to_string(),
                    reason.clone(),
                ),
                PersistOutcome::Skipped => self.skipped_reason(),
            }
        };

        Some(ReportRow {
            line: self.line,
            id_number: self.id_number.clone(),
            category,
            code,
            reason,
            verification: self.verification.as_ref().map(|v| v.status),
        })
    }

    fn skipped_reason(&self) -> (RowCategory, String, String) {
        let status = self.verification.as_ref().map(|v| v.status);
        let details = self.verification.as_ref().and_then(|v| v.details.clone());
        match status {
            Some(VerificationStatus::RateLimited) => (
                RowCategory::VerificationFailed,
                "rate_limited".to_string(),
                details.unwrap_or_else(|| "verification budget exhausted".to_string()),
            ),
            Some(VerificationStatus::Error) => (
                RowCategory::VerificationFailed,
                "verification_error".to_string(),
                details.unwrap_or_else(|| "registry lookup failed".to_string()),
            ),
            Some(VerificationStatus::NotFound) => (
                RowCategory::Skipped,
                "not_found".to_string(),
                "not found in the voter registry".to_string(),
            ),
            _ => (
                RowCategory::Skipped,
                "skipped".to_string(),
                "not persisted".to_string(),
            ),
        }
    }
}

/// Working state of one orchestrator run.
pub struct JobContext {
    pub job: Job,
    pub counts: JobCounts,
    /// One entry per data row, in file order.
    pub outcomes: Vec<RecordOutcome>,
    /// Rows turned away by the rate limiter during the main pass.
    pub deferred: Vec<usize>,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            counts: JobCounts::default(),
            outcomes: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Marks row `index` final with `outcome`, bumping the matching counter.
    pub fn finish_row(&mut self, index: usize, outcome: PersistOutcome) {
        match &outcome {
            PersistOutcome::Inserted => self.counts.inserted += 1,
            PersistOutcome::Updated => self.counts.updated += 1,
            PersistOutcome::Failed(_) => self.counts.persist_failed += 1,
            PersistOutcome::DuplicateSkipped => self.counts.duplicate += 1,
            PersistOutcome::Skipped => {
                let status = self.outcomes[index].verification.as_ref().map(|v| v.status);
                match status {
                    Some(VerificationStatus::RateLimited | VerificationStatus::Error) => {
                        self.counts.verification_failed += 1
                    }
                    _ => self.counts.skipped += 1,
                }
            }
        }
        self.outcomes[index].persistence = Some(outcome);
        self.counts.processed += 1;
    }

    pub fn report_rows(&self) -> Vec<ReportRow> {
        self.outcomes.iter().filter_map(RecordOutcome::report_row).collect()
    }
}
