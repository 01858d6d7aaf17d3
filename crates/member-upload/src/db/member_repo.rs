//! Member persistence: idempotent upserts keyed by `id_number`.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::intake::MemberRecord;
use crate::verify::VerificationStatus;

use super::{format_timestamp, Database, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// How a write failed, which decides what the orchestrator does next.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    /// Busy/locked. Worth one more try outside the batch.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The row itself is unacceptable (constraint violation and the like).
    #[error("row rejected by store: {0}")]
    Rejected(String),

    /// The store cannot be used at all. Aborts the job.
    #[error("member store unavailable: {0}")]
    Unavailable(String),
}

impl PersistError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PersistError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for PersistError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                PersistError::Transient(e.to_string())
            }
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::PermissionDenied
                | ErrorCode::OutOfMemory,
            ) => PersistError::Unavailable(e.to_string()),
            _ => PersistError::Rejected(e.to_string()),
        }
    }
}

impl From<DatabaseError> for PersistError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Sqlite(e) => e.into(),
            other => PersistError::Unavailable(other.to_string()),
        }
    }
}

/// A batch failed at `index`; nothing from the batch was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchError {
    pub index: usize,
    pub error: PersistError,
}

/// One validated row on its way to the store.
#[derive(Debug, Clone)]
pub struct MemberWrite {
    pub record: MemberRecord,
    pub verification: VerificationStatus,
    pub voting_district: Option<String>,
}

/// Destination for validated members.
pub trait MemberStore: Send + Sync {
    /// Applies the whole batch in one transaction, or nothing.
    fn upsert_batch(
        &self,
        job_id: &str,
        batch: &[MemberWrite],
    ) -> Result<Vec<UpsertOutcome>, BatchError>;

    /// Applies a single write in its own transaction.
    fn upsert_one(&self, job_id: &str, write: &MemberWrite) -> Result<UpsertOutcome, PersistError>;
}

pub struct SqliteMemberStore {
    db: Database,
}

impl SqliteMemberStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl MemberStore for SqliteMemberStore {
    fn upsert_batch(
        &self,
        job_id: &str,
        batch: &[MemberWrite],
    ) -> Result<Vec<UpsertOutcome>, BatchError> {
        let outer = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut outcomes = Vec::with_capacity(batch.len());
            for (index, write) in batch.iter().enumerate() {
                match upsert_in(&tx, job_id, write) {
                    Ok(outcome) => outcomes.push(outcome),
                    // Dropping `tx` rolls back.
                    Err(e) => return Ok(Err(BatchError { index, error: e.into() })),
                }
            }
            tx.commit()?;
            Ok(Ok(outcomes))
        });

        match outer {
            Ok(inner) => inner,
            Err(e) => Err(BatchError {
                index: 0,
                error: e.into(),
            }),
        }
    }

    fn upsert_one(&self, job_id: &str, write: &MemberWrite) -> Result<UpsertOutcome, PersistError> {
        let outer = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let outcome = match upsert_in(&tx, job_id, write) {
                Ok(outcome) => outcome,
                Err(e) => return Ok(Err(PersistError::from(e))),
            };
            tx.commit()?;
            Ok(Ok(outcome))
        });
        outer?
    }
}

fn upsert_in(
    conn: &Connection,
    job_id: &str,
    write: &MemberWrite,
) -> Result<UpsertOutcome, rusqlite::Error> {
    let m = &write.record;
    let now = format_timestamp(&Utc::now());

    let existing: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM members WHERE id_number = ?1",
            params![m.id_number],
            |r| r.get(0),
        )
        .optional()?;

    if existing.is_some() {
        // date_joined and created_at belong to the first registration.
        conn.execute(
            "UPDATE members SET first_name = ?2, surname = ?3, date_of_birth = ?4, gender = ?5,
             cell_number = ?6, email = ?7, ward_code = ?8, membership_type = ?9,
             verification_status = ?10, voting_district = ?11, source_job_id = ?12,
             updated_at = ?13
             WHERE id_number = ?1",
            params![
                m.id_number,
                m.first_name,
                m.surname,
                m.date_of_birth.to_string(),
                m.gender.map(|g| g.as_str()),
                m.cell_number,
                m.email,
                m.ward_code,
                m.membership_type.as_str(),
                write.verification.as_str(),
                write.voting_district,
                job_id,
                now,
            ],
        )?;
        Ok(UpsertOutcome::Updated)
    } else {
        conn.execute(
            "INSERT INTO members (id_number, first_name, surname, date_of_birth, gender,
             cell_number, email, ward_code, date_joined, membership_type, verification_status,
             voting_district, source_job_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                m.id_number,
                m.first_name,
                m.surname,
                m.date_of_birth.to_string(),
                m.gender.map(|g| g.as_str()),
                m.cell_number,
                m.email,
                m.ward_code,
                m.date_joined.to_string(),
                m.membership_type.as_str(),
                write.verification.as_str(),
                write.voting_district,
                job_id,
                now,
            ],
        )?;
        Ok(UpsertOutcome::Inserted)
    }
}

/// Stored member, as read back for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct MemberRow {
    pub id_number: String,
    pub first_name: String,
    pub surname: String,
    pub cell_number: String,
    pub ward_code: String,
    pub date_joined: String,
    pub verification_status: String,
    pub source_job_id: Option<String>,
}

pub fn find(db: &Database, id_number: &str) -> Result<Option<MemberRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT id_number, first_name, surname, cell_number, ward_code, date_joined,
                 verification_status, source_job_id
                 FROM members WHERE id_number = ?1",
                params![id_number],
                |r| {
                    Ok(MemberRow {
                        id_number: r.get(0)?,
                        first_name: r.get(1)?,
                        surname: r.get(2)?,
                        cell_number: r.get(3)?,
                        ward_code: r.get(4)?,
                        date_joined: r.get(5)?,
                        verification_status: r.get(6)?,
                        source_job_id: r.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}

pub fn count(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM members", [], |r| r.get(0))?;
        Ok(count)
    })
}
