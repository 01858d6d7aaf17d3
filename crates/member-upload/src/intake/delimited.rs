//! CSV / semicolon-separated reader.

use std::path::Path;

use crate::error::IntakeError;

use super::format::{RawRow, SheetFormat, Table, TableReader};

pub struct DelimitedReader;

impl TableReader for DelimitedReader {
    fn read(&self, path: &Path) -> Result<Table, IntakeError> {
        let bytes = std::fs::read(path).map_err(|e| IntakeError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
        parse_delimited(&bytes)
    }

    fn supports(&self, format: SheetFormat) -> bool {
        matches!(format, SheetFormat::Csv)
    }
}

/// Spreadsheet exports in some locales use `;` because `,` is the decimal mark.
fn detect_delimiter(bytes: &[u8]) -> u8 {
    let first_line = bytes
        .split(|b| *b == b'\n')
        .find(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .unwrap_or(&[]);

    [b',', b';', b'\t']
        .into_iter()
        .max_by_key(|d| first_line.iter().filter(|b| *b == d).count())
        .filter(|d| first_line.contains(d))
        .unwrap_or(b',')
}

pub(crate) fn parse_delimited(bytes: &[u8]) -> Result<Table, IntakeError> {
    if bytes.contains(&0) {
        return Err(IntakeError::Unparsable(
            "file contains binary data".to_string(),
        ));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(detect_delimiter(bytes))
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record.map_err(|e| IntakeError::Unparsable(e.to_string()))?;
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(rows.len() + 1);
        let cells = record
            .iter()
            .map(|field| String::from_utf8_lossy(field).trim().to_string())
            .collect();
        rows.push(RawRow { line, cells });
    }

    Table::from_rows(SheetFormat::Csv, rows)
}
