use std::path::Path;

use crate::error::IntakeError;

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetFormat {
    Csv,
    Xlsx,
}

impl SheetFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "txt" => Some(SheetFormat::Csv),
            "xlsx" => Some(SheetFormat::Xlsx),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// One data row as it appeared in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based line (CSV) or row number (XLSX) in the source file.
    pub line: usize,
    pub cells: Vec<String>,
}

impl RawRow {
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|c| c.trim().is_empty())
    }
}

/// A decoded sheet: header row plus non-blank data rows in file order.
#[derive(Debug, Clone)]
pub struct Table {
    pub format: SheetFormat,
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl Table {
    /// Splits decoded rows into header and data. The first non-blank row is
    /// the header; blank data rows are dropped.
    pub(crate) fn from_rows(format: SheetFormat, rows: Vec<RawRow>) -> Result<Self, IntakeError> {
        let mut iter = rows.into_iter().skip_while(RawRow::is_blank);
        let header = iter
            .next()
            .ok_or_else(|| IntakeError::Unparsable("no header row found".to_string()))?;

        let headers = header
            .cells
            .into_iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        Ok(Self {
            format,
            headers,
            rows: iter.filter(|r| !r.is_blank()).collect(),
        })
    }
}

pub trait TableReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<Table, IntakeError>;
    fn supports(&self, format: SheetFormat) -> bool;
}

/// Reads `path` with the reader registered for `format`.
pub fn read_table(path: &Path, format: SheetFormat) -> Result<Table, IntakeError> {
    let readers: [&dyn TableReader; 2] = [
        &super::delimited::DelimitedReader,
        &super::xlsx::XlsxReader,
    ];

    readers
        .iter()
        .find(|r| r.supports(format))
        .ok_or_else(|| IntakeError::UnsupportedFormat(format!("{:?}", format)))?
        .read(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(line: usize, cells: &[&str]) -> RawRow {
        RawRow {
            line,
            cells: cells.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(SheetFormat::from_extension("CSV"), Some(SheetFormat::Csv));
        assert_eq!(SheetFormat::from_extension("txt"), Some(SheetFormat::Csv));
        assert_eq!(SheetFormat::from_extension("xlsx"), Some(SheetFormat::Xlsx));
        assert_eq!(SheetFormat::from_extension("xls"), None);
    }

    #[test]
    fn test_table_skips_leading_and_blank_rows() {
        let table = Table::from_rows(
            SheetFormat::Csv,
            vec![
                row(1, &["", ""]),
                row(2, &["\u{feff}id_number", " surname "]),
                row(3, &["8001015009087", "Mokoena"]),
                row(4, &[" ", ""]),
                row(5, &["8501015009082", "Dlamini"]),
            ],
        )
        .unwrap();

        assert_eq!(table.headers, vec!["id_number", "surname"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1].line, 5);
    }

    #[test]
    fn test_table_without_header_is_unparsable() {
        let err = Table::from_rows(SheetFormat::Csv, vec![row(1, &[""])]).unwrap_err();
        assert!(matches!(err, IntakeError::Unparsable(_)));
    }
}
