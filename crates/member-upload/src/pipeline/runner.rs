use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tracing::{debug, info, info_span, warn};

use crate::broadcast::JobPhase;
use crate::db::{MemberStore, MemberWrite};
use crate::intake::{self, MemberRecord, RowValidator, ValidatedRow, ValidationResult};
use crate::sanitize;
use crate::store::{JobStore, Report};
use crate::verify::{AcquireMode, Verification, VerificationClient, VerificationStatus};
use crate::worker::{Interrupt, Job, JobResult, JobStatus};

use super::config::PipelineConfig;
use super::context::{JobContext, PersistOutcome, RecordOutcome};
use super::error::PipelineError;
use super::persist::persist_chunk;
use super::progress::{ProgressEvent, ProgressReporter};

/// How a run that did not fault ended.
enum Finish {
    Completed,
    Cancelled,
}

/// Which pass over the valid rows is running.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Fail-fast verification; rate-limited rows are set aside.
    Main,
    /// Bounded-wait verification of the rows set aside. Last chance.
    Deferred,
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    verifier: Arc<VerificationClient>,
    members: Arc<dyn MemberStore>,
    store: Arc<JobStore>,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        verifier: Arc<VerificationClient>,
        members: Arc<dyn MemberStore>,
        store: Arc<JobStore>,
    ) -> Self {
        Self {
            config,
            verifier,
            members,
            store,
        }
    }

    /// Runs one attempt of `job` to a terminal result.
    ///
    /// Row-level problems end up in the counters and the report. Only
    /// file-level rejections and infrastructure faults fail the job.
    pub fn run(&self, job: &Job, progress: &dyn ProgressReporter) -> JobResult {
        let filename = sanitize::redact_path(&job.source_path);
        let _pipeline_span = info_span!("pipeline",
            job_id = %job.id,
            filename = %filename,
            attempt = job.attempts,
        )
        .entered();

        let mut ctx = JobContext::new(job.clone());
        match self.execute(&mut ctx, progress) {
            Ok(Finish::Completed) => self.complete(&ctx, progress),
            Ok(Finish::Cancelled) => {
                info!(
                    "Job cancelled after {} of {} rows",
                    ctx.counts.processed, ctx.counts.total
                );
                JobResult::cancelled(&job.id, ctx.counts)
            }
            Err(e) => self.fail(&ctx, e),
        }
    }

    fn execute(
        &self,
        ctx: &mut JobContext,
        progress: &dyn ProgressReporter,
    ) -> Result<Finish, PipelineError> {
        // Step 1: File-level checks and validation
        let rows = {
            let _step = info_span!("validate").entered();
            progress.report(ProgressEvent::Stage {
                phase: JobPhase::Validating,
                message: "Reading and validating rows...".to_string(),
            });
            self.step_validate(ctx)?
        };
        progress.report(ProgressEvent::Rows {
            counts: ctx.counts,
            message: format!(
                "Validated {} rows: {} valid, {} invalid, {} duplicate",
                ctx.counts.total,
                ctx.counts.valid,
                ctx.counts.validation_failed,
                ctx.counts.duplicate
            ),
        });

        let valid: Vec<usize> = rows
            .iter()
            .filter(|r| r.result.is_valid())
            .map(|r| r.index)
            .collect();

        // Step 2: Verify and persist, fail-fast on the rate limit
        {
            let _step = info_span!("verify_and_persist", rows = valid.len()).entered();
            progress.report(ProgressEvent::Stage {
                phase: if self.verifier.is_enabled() {
                    JobPhase::Verifying
                } else {
                    JobPhase::Persisting
                },
                message: format!("Processing {} valid rows...", valid.len()),
            });
            if let Some(finish) = self.step_process(ctx, &rows, &valid, Pass::Main, progress)? {
                return Ok(finish);
            }
        }

        // Step 3: One bounded retry for rows the rate limiter turned away
        if !ctx.deferred.is_empty() {
            let deferred = std::mem::take(&mut ctx.deferred);
            let _step = info_span!("retry_deferred", rows = deferred.len()).entered();
            progress.report(ProgressEvent::Stage {
                phase: JobPhase::RetryingDeferred,
                message: format!("Retrying {} rate-limited rows...", deferred.len()),
            });
            if let Some(finish) =
                self.step_process(ctx, &rows, &deferred, Pass::Deferred, progress)?
            {
                return Ok(finish);
            }
        }

        Ok(Finish::Completed)
    }

    fn step_validate(&self, ctx: &mut JobContext) -> Result<Vec<ValidatedRow>, PipelineError> {
        let (table, columns) = intake::load_table(&ctx.job.source_path, &self.config.intake)?;
        let validator = RowValidator::new(&self.config.intake, Utc::now().date_naive());
        let rows = validator.validate_all(&table, &columns);

        ctx.counts.total = rows.len() as u64;
        ctx.outcomes = rows.iter().map(RecordOutcome::from_validated).collect();

        for row in &rows {
            match &row.result {
                ValidationResult::Valid(_) => ctx.counts.valid += 1,
                ValidationResult::Invalid(_) => {
                    ctx.counts.validation_failed += 1;
                    ctx.counts.processed += 1;
                }
                ValidationResult::Duplicate { .. } => {
                    ctx.finish_row(row.index, PersistOutcome::DuplicateSkipped)
                }
            }
        }

        debug!(
            "Validation done: {} valid, {} invalid, {} duplicate",
            ctx.counts.valid, ctx.counts.validation_failed, ctx.counts.duplicate
        );
        Ok(rows)
    }

    /// Verifies and persists `indices` in batch-sized chunks. Returns
    /// `Some(Finish::Cancelled)` if a cancel was honoured at a checkpoint.
    fn step_process(
        &self,
        ctx: &mut JobContext,
        rows: &[ValidatedRow],
        indices: &[usize],
        pass: Pass,
        progress: &dyn ProgressReporter,
    ) -> Result<Option<Finish>, PipelineError> {
        let mode = match pass {
            Pass::Main => AcquireMode::FailFast,
            Pass::Deferred => self.verifier.wait_mode(),
        };

        for chunk in indices.chunks(self.config.batch_size) {
            if let Some(finish) = checkpoint(progress)? {
                return Ok(Some(finish));
            }

            let records: Vec<&MemberRecord> = chunk
                .iter()
                .filter_map(|&i| match &rows[i].result {
                    ValidationResult::Valid(record) => Some(record),
                    _ => None,
                })
                .collect();
            let verifications = self.verify_records(&records, mode, progress);
            let cut_short = verifications.iter().any(Option::is_none);

            let mut writes = Vec::with_capacity(chunk.len());
            let mut write_rows = Vec::with_capacity(chunk.len());
            for ((&index, record), verification) in chunk.iter().zip(records).zip(verifications) {
                // Left untouched by an interrupt: not processed at all.
                let Some(verification) = verification else {
                    continue;
                };
                if let Some(write) = self.classify(ctx, index, record, verification, pass) {
                    writes.push(write);
                    write_rows.push(index);
                }
            }

            let persisted = persist_chunk(self.members.as_ref(), &ctx.job.id, &writes);
            for (&index, outcome) in write_rows.iter().zip(persisted.outcomes) {
                ctx.finish_row(index, outcome);
            }
            if let Some(e) = persisted.abort {
                warn!("Member store unavailable, aborting job: {}", e);
                return Err(PipelineError::StoreUnavailable(e));
            }

            progress.report(ProgressEvent::Rows {
                counts: ctx.counts,
                message: format!(
                    "{} of {} rows processed ({} saved)",
                    ctx.counts.processed,
                    ctx.counts.total,
                    ctx.counts.succeeded()
                ),
            });

            if cut_short {
                if let Some(finish) = checkpoint(progress)? {
                    return Ok(Some(finish));
                }
            }
        }
        Ok(None)
    }

    /// Applies the verification policy to one row. Returns the write to make,
    /// or `None` when the row was finalised (or deferred) without one.
    fn classify(
        &self,
        ctx: &mut JobContext,
        index: usize,
        record: &MemberRecord,
        verification: Verification,
        pass: Pass,
    ) -> Option<MemberWrite> {
        let status = verification.status;
        let voting_district = verification
            .record
            .as_ref()
            .and_then(|r| r.voting_district.clone());
        ctx.outcomes[index].verification = Some(verification);

        match status {
            VerificationStatus::Matched => ctx.counts.matched += 1,
            VerificationStatus::Skipped => ctx.counts.unverified += 1,
            VerificationStatus::NotFound => {
                ctx.counts.not_found += 1;
                if !self.config.persist_not_found {
                    ctx.finish_row(index, PersistOutcome::Skipped);
                    return None;
                }
            }
            VerificationStatus::RateLimited if pass == Pass::Main => {
                ctx.deferred.push(index);
                return None;
            }
            VerificationStatus::RateLimited | VerificationStatus::Error => {
                ctx.finish_row(index, PersistOutcome::Skipped);
                return None;
            }
        }

        Some(MemberWrite {
            record: record.clone(),
            verification: status,
            voting_district,
        })
    }

    /// Verifies `records` in order, spreading the calls over a few scoped
    /// threads. The rate limiter is shared, so this never exceeds the
    /// global budget. Once `progress` reports an interrupt the remaining
    /// rows come back as `None` without a lookup.
    fn verify_records(
        &self,
        records: &[&MemberRecord],
        mode: AcquireMode,
        progress: &dyn ProgressReporter,
    ) -> Vec<Option<Verification>> {
        let verifier = self.verifier.as_ref();
        let verify = |record: &&MemberRecord| match progress.interrupted() {
            Some(_) => None,
            None => Some(verifier.verify(&record.id_number, mode)),
        };

        let parallelism = self.config.verify_parallelism;
        if parallelism <= 1 || records.len() <= 1 || !verifier.is_enabled() {
            return records.iter().map(verify).collect();
        }

        let per_thread = records.len().div_ceil(parallelism);
        thread::scope(|scope| {
            let handles: Vec<_> = records
                .chunks(per_thread)
                .map(|part| {
                    let handle = scope.spawn(move || part.iter().map(verify).collect::<Vec<_>>());
                    (handle, part.len())
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|(handle, len)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!("Verification thread panicked");
                        vec![
                            Some(Verification::new(
                                VerificationStatus::Error,
                                Some("verification thread panicked".to_string()),
                            ));
                            len
                        ]
                    })
                })
                .collect()
        })
    }

    fn complete(&self, ctx: &JobContext, progress: &dyn ProgressReporter) -> JobResult {
        let _step = info_span!("report").entered();
        progress.report(ProgressEvent::Stage {
            phase: JobPhase::Reporting,
            message: "Writing report...".to_string(),
        });

        let report = self.build_report(ctx, JobStatus::Completed, None);
        match self.store.save_report(&report) {
            Ok(path) => {
                info!(
                    "Job completed: {} rows, {} inserted, {} updated, {} failed, {} duplicate",
                    ctx.counts.total,
                    ctx.counts.inserted,
                    ctx.counts.updated,
                    ctx.counts.failed(),
                    ctx.counts.duplicate
                );
                JobResult::completed(&ctx.job.id, ctx.counts, path)
            }
            Err(e) => self.fail(ctx, PipelineError::Report(e)),
        }
    }

    fn fail(&self, ctx: &JobContext, error: PipelineError) -> JobResult {
        let retryable = error.is_retryable();
        let message = error.to_string();
        warn!("Job failed (retryable: {}): {}", retryable, message);

        // A retryable failure gets another attempt, which writes its own report.
        let report_path = if retryable {
            None
        } else {
            let report = self.build_report(ctx, JobStatus::Failed, Some(message.clone()));
            match self.store.save_report(&report) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Failed to write failure report: {}", e);
                    None
                }
            }
        };

        JobResult::failed(&ctx.job.id, ctx.counts, message, retryable, report_path)
    }

    fn build_report(&self, ctx: &JobContext, status: JobStatus, error: Option<String>) -> Report {
        Report {
            job_id: ctx.job.id.clone(),
            filename: ctx.job.filename.clone(),
            generated_at: Utc::now(),
            status,
            error,
            counts: ctx.counts,
            rows: ctx.report_rows(),
        }
    }
}

/// Cancel and shutdown are honoured here, never in the middle of a row.
fn checkpoint(progress: &dyn ProgressReporter) -> Result<Option<Finish>, PipelineError> {
    match progress.interrupted() {
        None => Ok(None),
        Some(Interrupt::Cancel) => Ok(Some(Finish::Cancelled)),
        Some(Interrupt::Stalled) => Err(PipelineError::Stalled),
        Some(Interrupt::Shutdown) => Err(PipelineError::Shutdown),
    }
}
