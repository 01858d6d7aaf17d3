//! Intake: turns an uploaded spreadsheet into validated member records.
//!
//! Two layers:
//! - [`check_file`] / [`load_table`]: file-level checks that accept or reject
//!   the whole file before any row is considered.
//! - [`RowValidator`]: per-row validation and intra-file duplicate detection.

pub mod delimited;
pub mod format;
pub mod record;
pub mod validator;
pub mod xlsx;

use std::path::Path;

use log::debug;

use crate::config::IntakeConfig;
use crate::error::IntakeError;
use crate::sanitize;

pub use format::{RawRow, SheetFormat, Table};
pub use record::{ColumnMap, Field, Gender, MemberRecord, MembershipType, RawRecord};
pub use validator::{
    luhn_check_digit, RowValidationError, RowValidator, ValidatedRow, ValidationResult,
};

/// Summary of a file that passed the file-level checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCheck {
    pub format: SheetFormat,
    pub byte_size: u64,
    pub data_rows: usize,
}

/// Fast synchronous accept/reject for a file, independent of row validity.
pub fn check_file(path: &Path, limits: &IntakeConfig) -> Result<FileCheck, IntakeError> {
    let (table, _columns, byte_size) = load_checked(path, limits)?;
    Ok(FileCheck {
        format: table.format,
        byte_size,
        data_rows: table.rows.len(),
    })
}

/// Runs the file-level checks and returns the parsed table with its column map.
pub fn load_table(path: &Path, limits: &IntakeConfig) -> Result<(Table, ColumnMap), IntakeError> {
    let (table, columns, _) = load_checked(path, limits)?;
    Ok((table, columns))
}

fn load_checked(
    path: &Path,
    limits: &IntakeConfig,
) -> Result<(Table, ColumnMap, u64), IntakeError> {
    let metadata = std::fs::metadata(path).map_err(|e| IntakeError::Unreadable {
        path: path.to_path_buf(),
        source: e,
    })?;

    if !metadata.is_file() {
        return Err(IntakeError::Unreadable {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        });
    }

    let byte_size = metadata.len();
    if byte_size > limits.max_file_bytes {
        return Err(IntakeError::TooLarge {
            size: byte_size,
            limit: limits.max_file_bytes,
        });
    }

    let format = SheetFormat::from_path(path).ok_or_else(|| {
        IntakeError::UnsupportedFormat(
            path.extension()
                .and_then(|e| e.to_str())
                .unwrap_or("<none>")
                .to_string(),
        )
    })?;

    let table = format::read_table(path, format)?;
    let columns = ColumnMap::from_headers(&table.headers)?;

    if table.rows.is_empty() {
        return Err(IntakeError::Empty);
    }

    debug!(
        "Intake accepted {} ({} rows, {} bytes)",
        sanitize::redact_path(path),
        table.rows.len(),
        byte_size
    );

    Ok((table, columns, byte_size))
}
