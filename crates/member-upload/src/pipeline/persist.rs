//! Batched member writes with per-row fallback.

use log::{debug, warn};

use crate::db::{MemberStore, MemberWrite, PersistError, UpsertOutcome};

use super::context::PersistOutcome;

/// Result of writing one chunk. `outcomes` covers a prefix of the chunk;
/// when `abort` is set the store went away and the rest was not attempted.
#[derive(Debug, Default)]
pub struct ChunkPersist {
    pub outcomes: Vec<PersistOutcome>,
    pub abort: Option<PersistError>,
}

fn from_upsert(outcome: UpsertOutcome) -> PersistOutcome {
    match outcome {
        UpsertOutcome::Inserted => PersistOutcome::Inserted,
        UpsertOutcome::Updated => PersistOutcome::Updated,
    }
}

/// Writes `writes` as one transaction. If the batch fails on a bad or busy
/// row, every row is retried once in its own transaction so one row cannot
/// take the rest of the batch down with it.
pub fn persist_chunk(store: &dyn MemberStore, job_id: &str, writes: &[MemberWrite]) -> ChunkPersist {
    if writes.is_empty() {
        return ChunkPersist::default();
    }

    let failed_at = match store.upsert_batch(job_id, writes) {
        Ok(outcomes) => {
            return ChunkPersist {
                outcomes: outcomes.into_iter().map(from_upsert).collect(),
                abort: None,
            }
        }
        Err(e) if e.error.is_unavailable() => {
            return ChunkPersist {
                outcomes: Vec::new(),
                abort: Some(e.error),
            }
        }
        Err(e) => e,
    };

    debug!(
        "Batch of {} rolled back at row {} ({}), retrying rows individually",
        writes.len(),
        failed_at.index,
        failed_at.error
    );

    let mut result = ChunkPersist::default();
    for write in writes {
        match store.upsert_one(job_id, write) {
            Ok(outcome) => result.outcomes.push(from_upsert(outcome)),
            Err(e) if e.is_unavailable() => {
                result.abort = Some(e);
                break;
            }
            Err(e) => {
                warn!("Row rejected by member store: {}", e);
                result.outcomes.push(PersistOutcome::Failed(e.to_string()));
            }
        }
    }
    result
}
