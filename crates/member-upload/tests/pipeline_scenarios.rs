//! End-to-end runs through the service: intake, verification, persistence
//! and reporting for whole files.

mod common;

use std::sync::Arc;

use common::{id_number, MemberRow, ScriptedRegistry, SheetBuilder, TestHarness};
use member_upload::store::RowCategory;
use member_upload::{JobPhase, JobStatus, UploadError};

#[test]
fn test_mixed_file_completes_with_row_failures_reported() {
    let harness = TestHarness::with_config(|c| c.batch_size(25));
    let mut events = harness.service.subscribe();

    let sheet = SheetBuilder::new()
        .valid_rows(0, 50)
        .row(MemberRow::valid(0))
        .row(MemberRow::valid(200).id("8001015009088"))
        .valid_rows(50, 45)
        .row(MemberRow::valid(1))
        .row(MemberRow::valid(2))
        .row(MemberRow::valid(201).surname(""));
    assert_eq!(sheet.len(), 100);

    let path = harness.write_sheet("ward-42.csv", &sheet);
    let job_id = harness.submit(&path);
    let job = harness.wait_for_terminal(&job_id);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counts.total, 100);
    assert_eq!(job.counts.processed, 100);
    assert_eq!(job.counts.valid, 95);
    assert_eq!(job.counts.duplicate, 3);
    assert_eq!(job.counts.validation_failed, 2);
    assert_eq!(job.counts.matched, 95);
    assert_eq!(job.counts.inserted, 95);
    assert_eq!(harness.member_count(), 95);

    // Source is removed once the job is terminal.
    assert!(!path.exists());

    let report = harness.service.report(&job_id).unwrap();
    let malformed: Vec<_> = report.rows_in(RowCategory::ValidationFailed).collect();
    assert_eq!(malformed.len(), 2);
    assert_eq!(malformed[0].line, 53);
    assert_eq!(malformed[0].code, "checksum_mismatch");
    assert_eq!(malformed[1].line, 101);
    assert_eq!(malformed[1].code, "missing_field");
    assert!(!malformed[1].reason.is_empty());

    let duplicates: Vec<_> = report.rows_in(RowCategory::Duplicate).collect();
    assert_eq!(duplicates.len(), 3);
    assert_eq!(duplicates[0].reason, "same id_number as line 2");

    // Every event along the way stays within the row total, and the last
    // one agrees with the stored job.
    let events = TestHarness::events_until_terminal(&mut events, &job_id);
    let mine: Vec<_> = events.iter().filter(|e| e.job_id == job_id).collect();
    assert!(mine.iter().all(|e| e.counts.processed <= e.counts.total));
    let last = mine.last().unwrap();
    assert_eq!(last.phase, JobPhase::Completed);
    assert_eq!(last.counts, job.counts);
    assert!(mine.iter().any(|e| e.phase == JobPhase::Reporting));
}

#[test]
fn test_rate_limited_rows_retried_once_then_reported() {
    let registry = Arc::new(ScriptedRegistry::default());
    for seq in 0..10 {
        registry.rate_limit(&id_number(seq), 2);
    }
    let harness = TestHarness::with_registry(registry, |c| c);

    let path = harness.write_sheet("batch.csv", &SheetBuilder::new().valid_rows(0, 50));
    let job_id = harness.submit(&path);
    let job = harness.wait_for_terminal(&job_id);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counts.processed, 50);
    assert_eq!(job.counts.matched, 40);
    assert_eq!(job.counts.inserted, 40);
    assert_eq!(job.counts.verification_failed, 10);
    // 50 in the main pass, 10 more in the deferred pass, no further retries.
    assert_eq!(harness.registry.calls(), 60);

    let report = harness.service.report(&job_id).unwrap();
    let failed: Vec<_> = report.rows_in(RowCategory::VerificationFailed).collect();
    assert_eq!(failed.len(), 10);
    assert!(failed.iter().all(|r| r.code == "rate_limited"));
    assert_eq!(harness.member_count(), 40);
}

#[test]
fn test_rate_limited_rows_recovered_by_deferred_pass() {
    let registry = Arc::new(ScriptedRegistry::default());
    for seq in 0..10 {
        registry.rate_limit(&id_number(seq), 1);
    }
    let harness = TestHarness::with_registry(registry, |c| c);

    let path = harness.write_sheet("batch.csv", &SheetBuilder::new().valid_rows(0, 50));
    let job = harness.wait_for_terminal(&harness.submit(&path));

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counts.matched, 50);
    assert_eq!(job.counts.inserted, 50);
    assert_eq!(job.counts.verification_failed, 0);
}

#[test]
fn test_store_outage_fails_retryably_and_retry_is_idempotent() {
    let harness = TestHarness::with_config(|c| c.batch_size(20));
    harness.members.fail_after(40);

    let path = harness.write_sheet("ward-7.csv", &SheetBuilder::new().valid_rows(0, 100));
    let job_id = harness.submit(&path);
    let job = harness.wait_for_terminal(&job_id);

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.retryable);
    assert!(job.error.is_some());
    assert_eq!(job.counts.inserted, 40);
    assert_eq!(harness.member_count(), 40);
    // Kept for the retry, and no report for a retryable failure.
    assert!(path.exists());
    assert!(harness.service.report(&job_id).is_err());

    harness.members.heal();
    assert!(harness.service.retry(&job_id).unwrap());
    let job = harness.wait_for_terminal(&job_id);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counts.updated, 40);
    assert_eq!(job.counts.inserted, 60);
    assert_eq!(job.counts.processed, 100);
    assert_eq!(harness.member_count(), 100);
    assert!(!path.exists());
}

#[test]
fn test_not_found_rows_persisted_as_unverified() {
    let registry = Arc::new(ScriptedRegistry::default());
    registry.unregister(&id_number(3));
    let harness = TestHarness::with_registry(registry, |c| c);

    let path = harness.write_sheet("a.csv", &SheetBuilder::new().valid_rows(0, 5));
    let job = harness.wait_for_terminal(&harness.submit(&path));

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counts.not_found, 1);
    assert_eq!(job.counts.inserted, 5);
}

#[test]
fn test_not_found_rows_skipped_when_policy_says_so() {
    let registry = Arc::new(ScriptedRegistry::default());
    registry.unregister(&id_number(3));
    let harness = TestHarness::with_registry(registry, |c| c.persist_not_found(false));

    let path = harness.write_sheet("a.csv", &SheetBuilder::new().valid_rows(0, 5));
    let job_id = harness.submit(&path);
    let job = harness.wait_for_terminal(&job_id);

    assert_eq!(job.counts.inserted, 4);
    assert_eq!(job.counts.skipped, 1);
    let report = harness.service.report(&job_id).unwrap();
    assert_eq!(report.rows_in(RowCategory::Skipped).count(), 1);
}

#[test]
fn test_invalid_rows_never_reach_registry() {
    let harness = TestHarness::new();
    let sheet = SheetBuilder::new()
        .valid_rows(0, 3)
        .row(MemberRow::valid(10).cell("12345"))
        .row(MemberRow::valid(11).email("not-an-email"));

    let job = harness.wait_for_terminal(&harness.submit(&harness.write_sheet("a.csv", &sheet)));

    assert_eq!(job.counts.validation_failed, 2);
    assert_eq!(harness.registry.calls(), 3);
}

#[test]
fn test_verification_disabled_persists_everything_unverified() {
    let harness = TestHarness::with_config(|c| c.verification(false));
    let path = harness.write_sheet("a.csv", &SheetBuilder::new().valid_rows(0, 4));
    let job = harness.wait_for_terminal(&harness.submit(&path));

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counts.unverified, 4);
    assert_eq!(job.counts.inserted, 4);
    assert_eq!(harness.registry.calls(), 0);
}

#[test]
fn test_file_level_rejection_at_submit() {
    let harness = TestHarness::new();
    let path = harness.upload_dir.join("no-ids.csv");
    std::fs::write(&path, "first_name,surname\nThandi,Mokoena\n").unwrap();

    let err = harness
        .service
        .submit(member_upload::SubmitRequest::new(&path, "organiser"))
        .unwrap_err();
    assert!(matches!(err, UploadError::Intake(_)));
    assert_eq!(harness.service.stats().unwrap().total_jobs, 0);
}
