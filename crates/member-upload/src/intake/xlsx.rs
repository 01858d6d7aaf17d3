//! Minimal XLSX reader: first worksheet in workbook order, shared and
//! inline strings.

use std::io::{Read, Seek};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use log::warn;
use quick_xml::Reader;

use crate::error::IntakeError;

use super::format::{RawRow, SheetFormat, Table, TableReader};

pub struct XlsxReader;

impl TableReader for XlsxReader {
    fn read(&self, path: &Path) -> Result<Table, IntakeError> {
        let file = std::fs::File::open(path).map_err(|e| IntakeError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| IntakeError::Unparsable(format!("Failed to open XLSX: {}", e)))?;

        let shared = match read_entry(&mut archive, "xl/sharedStrings.xml")? {
            Some(xml) => parse_shared_strings(&xml)?,
            None => Vec::new(),
        };

        let sheet_name = first_sheet_path(&mut archive)?
            .ok_or_else(|| IntakeError::Unparsable("workbook has no worksheets".to_string()))?;
        let sheet = read_entry(&mut archive, &sheet_name)?
            .ok_or_else(|| IntakeError::Unparsable(format!("missing {}", sheet_name)))?;

        let rows = parse_sheet(&sheet, &shared)?;
        Table::from_rows(SheetFormat::Xlsx, rows)
    }

    fn supports(&self, format: SheetFormat) -> bool {
        matches!(format, SheetFormat::Xlsx)
    }
}

fn read_entry<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<Option<String>, IntakeError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(IntakeError::Unparsable(format!("{}: {}", name, e))),
    };

    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|e| IntakeError::Unparsable(format!("Failed to read {}: {}", name, e)))?;
    Ok(Some(content))
}

/// Archive path of the first `<sheet>` in `xl/workbook.xml`, resolved
/// through the workbook relationships. Workbooks without that metadata fall
/// back to the lowest-numbered `xl/worksheets/sheetN.xml`.
fn first_sheet_path<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<Option<String>, IntakeError> {
    let workbook = read_entry(archive, "xl/workbook.xml")?;
    let rels = read_entry(archive, "xl/_rels/workbook.xml.rels")?;

    if let (Some(workbook), Some(rels)) = (workbook, rels) {
        if let Some(rel_id) = first_sheet_rel_id(&workbook)? {
            match relationship_target(&rels, &rel_id)? {
                Some(target) => return Ok(Some(resolve_target(&target))),
                None => warn!("Workbook sheet {} has no relationship target", rel_id),
            }
        }
    }
    Ok(lowest_numbered_sheet(archive))
}

fn first_sheet_rel_id(workbook: &str) -> Result<Option<String>, IntakeError> {
    let mut reader = Reader::from_str(workbook);
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"sheet" => {
                // `r:id`, matched by local name so the prefix does not matter.
                return Ok(e
                    .attributes()
                    .flatten()
                    .find(|a| a.key.local_name().as_ref() == b"id")
                    .map(|a| String::from_utf8_lossy(a.value.as_ref()).into_owned()));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn relationship_target(rels: &str, rel_id: &str) -> Result<Option<String>, IntakeError> {
    let mut reader = Reader::from_str(rels);
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) | Event::Empty(ref e)
                if e.local_name().as_ref() == b"Relationship"
                    && attr(e, b"Id").as_deref() == Some(rel_id) =>
            {
                return Ok(attr(e, b"Target"));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Targets are relative to `xl/` unless they start with `/`.
fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

fn lowest_numbered_sheet<R: Read + Seek>(archive: &zip::ZipArchive<R>) -> Option<String> {
    archive
        .file_names()
        .filter_map(|name| {
            let n = name
                .strip_prefix("xl/worksheets/sheet")?
                .strip_suffix(".xml")?
                .parse::<u32>()
                .ok()?;
            Some((n, name.to_string()))
        })
        .min_by_key(|(n, _)| *n)
        .map(|(_, name)| name)
}

fn xml_error(e: quick_xml::Error) -> IntakeError {
    IntakeError::Unparsable(format!("XML parsing error: {}", e))
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>, IntakeError> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_item = false;
    let mut in_text = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"si" => {
                    in_item = true;
                    current.clear();
                }
                b"t" => in_text = in_item,
                _ => {}
            },
            Event::End(ref e) => match e.local_name().as_ref() {
                b"si" => {
                    strings.push(std::mem::take(&mut current));
                    in_item = false;
                }
                b"t" => in_text = false,
                _ => {}
            },
            Event::Empty(ref e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(e) if in_text => {
                current.push_str(&e.unescape().unwrap_or_default());
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(strings)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Shared,
    Inline,
    Plain,
}

struct OpenCell {
    column: usize,
    kind: CellKind,
    value: String,
}

fn parse_sheet(xml: &str, shared: &[String]) -> Result<Vec<RawRow>, IntakeError> {
    let mut reader = Reader::from_str(xml);
    let mut rows = Vec::new();
    let mut current: Option<RawRow> = None;
    let mut cell: Option<OpenCell> = None;
    let mut in_value = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"row" => {
                    let line = attr(e, b"r")
                        .and_then(|r| r.parse().ok())
                        .unwrap_or(rows.len() + 1);
                    current = Some(RawRow {
                        line,
                        cells: Vec::new(),
                    });
                }
                b"c" => {
                    let column = match attr(e, b"r") {
                        Some(reference) => column_index(&reference)?,
                        None => current.as_ref().map(|r| r.cells.len()).unwrap_or(0),
                    };
                    let kind = match attr(e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        _ => CellKind::Plain,
                    };
                    cell = Some(OpenCell {
                        column,
                        kind,
                        value: String::new(),
                    });
                }
                b"v" | b"t" => in_value = cell.is_some(),
                _ => {}
            },
            Event::End(ref e) => match e.local_name().as_ref() {
                b"c" => {
                    if let (Some(open), Some(row)) = (cell.take(), current.as_mut()) {
                        let text = resolve_cell(open.kind, open.value, shared)?;
                        if row.cells.len() <= open.column {
                            row.cells.resize(open.column + 1, String::new());
                        }
                        row.cells[open.column] = text;
                    }
                }
                b"row" => {
                    if let Some(row) = current.take() {
                        rows.push(row);
                    }
                }
                b"v" | b"t" => in_value = false,
                _ => {}
            },
            Event::Text(e) if in_value => {
                if let Some(open) = cell.as_mut() {
                    open.value.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(rows)
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .map(|a| String::from_utf8_lossy(a.value.as_ref()).into_owned())
}

/// `"C7"` → 2, `"AA3"` → 26.
fn column_index(reference: &str) -> Result<usize, IntakeError> {
    let letters: String = reference
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return Err(IntakeError::Unparsable(format!(
            "invalid cell reference '{}'",
            reference
        )));
    }
    let index = letters
        .to_ascii_uppercase()
        .bytes()
        .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize);
    Ok(index - 1)
}

fn resolve_cell(kind: CellKind, value: String, shared: &[String]) -> Result<String, IntakeError> {
    match kind {
        CellKind::Shared => {
            let idx: usize = value.trim().parse().map_err(|_| {
                IntakeError::Unparsable(format!("invalid shared string index '{}'", value))
            })?;
            shared.get(idx).map(|s| s.trim().to_string()).ok_or_else(|| {
                IntakeError::Unparsable(format!("shared string {} out of range", idx))
            })
        }
        CellKind::Inline => Ok(value.trim().to_string()),
        CellKind::Plain => Ok(normalize_number(value.trim())),
    }
}

/// Identifiers typed into numeric cells come back as `8.001015009087E+12`.
fn normalize_number(value: &str) -> String {
    if value.contains(['E', 'e']) {
        if let Ok(n) = value.parse::<f64>() {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                return format!("{:.0}", n);
            }
        }
    }
    value.strip_suffix(".0").unwrap_or(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const SHARED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="3" uniqueCount="3">
<si><t>id_number</t></si><si><t>surname</t></si><si><t>Mokoena</t></si>
</sst>"#;

    const SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<sheetData>
<row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
<row r="2"><c r="A2"><v>8.001015009087E+12</v></c><c r="B2" t="s"><v>2</v></c></row>
<row r="4"><c r="B4" t="inlineStr"><is><t>Dlamini</t></is></c></row>
</sheetData>
</worksheet>"#;

    fn write_xlsx(path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        zip.start_file("xl/sharedStrings.xml", options).unwrap();
        zip.write_all(SHARED.as_bytes()).unwrap();
        zip.start_file("xl/worksheets/sheet1.xml", options).unwrap();
        zip.write_all(SHEET.as_bytes()).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_read_xlsx_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("members.xlsx");
        write_xlsx(&path);

        let table = XlsxReader.read(&path).unwrap();
        assert_eq!(table.format, SheetFormat::Xlsx);
        assert_eq!(table.headers, vec!["id_number", "surname"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].cells, vec!["8001015009087", "Mokoena"]);
        assert_eq!(table.rows[1].line, 4);
        assert_eq!(table.rows[1].cells, vec!["", "Dlamini"]);
    }

    const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"
          xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
<sheets>
<sheet name="Members" sheetId="2" r:id="rId2"/>
<sheet name="Notes" sheetId="1" r:id="rId1"/>
</sheets>
</workbook>"#;

    const RELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="/xl/worksheets/sheet2.xml"/>
</Relationships>"#;

    const NOTES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<sheetData>
<row r="1"><c r="A1" t="inlineStr"><is><t>Upload instructions</t></is></c></row>
</sheetData>
</worksheet>"#;

    #[test]
    fn test_reads_first_sheet_in_workbook_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reordered.xlsx");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, content) in [
            ("xl/workbook.xml", WORKBOOK),
            ("xl/_rels/workbook.xml.rels", RELS),
            ("xl/sharedStrings.xml", SHARED),
            ("xl/worksheets/sheet1.xml", NOTES),
            ("xl/worksheets/sheet2.xml", SHEET),
        ] {
            zip.start_file(name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();

        let table = XlsxReader.read(&path).unwrap();
        assert_eq!(table.headers, vec!["id_number", "surname"]);
        assert_eq!(table.rows[0].cells, vec!["8001015009087", "Mokoena"]);
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(resolve_target("worksheets/sheet3.xml"), "xl/worksheets/sheet3.xml");
        assert_eq!(resolve_target("/xl/worksheets/sheet3.xml"), "xl/worksheets/sheet3.xml");
    }

    #[test]
    fn test_column_index() {
        assert_eq!(column_index("A1").unwrap(), 0);
        assert_eq!(column_index("C7").unwrap(), 2);
        assert_eq!(column_index("AA3").unwrap(), 26);
        assert!(column_index("12").is_err());
    }

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number("8.001015009087E+12"), "8001015009087");
        assert_eq!(normalize_number("821234567"), "821234567");
        assert_eq!(normalize_number("79700001.0"), "79700001");
    }

    #[test]
    fn test_shared_index_out_of_range() {
        let err = resolve_cell(CellKind::Shared, "9".to_string(), &[]).unwrap_err();
        assert!(matches!(err, IntakeError::Unparsable(_)));
    }
}
