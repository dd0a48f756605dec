use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use indexmap::IndexSet;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use tracing::debug;

use crate::models::{Record, Row};

pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["xlsx", "xlsm", "xls", "ods"];
pub const EXPORT_SHEET_NAME: &str = "Data";

#[derive(Debug, thiserror::Error)]
pub enum SpreadsheetError {
    #[error("Unsupported file type, upload an .xlsx or .xls workbook")]
    UnsupportedType,
    #[error("Could not read workbook: {0}")]
    Read(#[from] calamine::Error),
    #[error("Workbook has no sheets")]
    NoSheet,
    #[error("Could not write workbook: {0}")]
    Write(#[from] XlsxError),
    #[error("Too many columns to export: {0}")]
    TooManyColumns(usize),
}

pub fn is_supported_upload(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Reads the first sheet of a workbook into header-keyed rows.
///
/// The first row names the columns. Empty cells are left out of a row and
/// rows without any value are dropped, so a row's keys can be a subset of
/// the header.
pub fn parse_workbook(bytes: &[u8]) -> Result<Vec<Row>, SpreadsheetError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;

    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(SpreadsheetError::NoSheet)?;
    let range = workbook.worksheet_range(&sheet)?;

    let mut rows = range.rows();
    let header = match rows.next() {
        Some(cells) => header_names(cells),
        None => return Ok(Vec::new()),
    };

    let parsed: Vec<Row> = rows
        .filter_map(|cells| {
            let row: Row = header
                .iter()
                .zip(cells.iter())
                .filter_map(|(name, cell)| cell_text(cell).map(|v| (name.clone(), v)))
                .collect();
            if row.is_empty() {
                None
            } else {
                Some(row)
            }
        })
        .collect();

    debug!(sheet = %sheet, columns = header.len(), rows = parsed.len(), "parsed workbook");
    Ok(parsed)
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(s) if s.is_empty() => None,
        other => Some(other.to_string()),
    }
}

// Blank headers become `__EMPTY`, `__EMPTY_1`, ...; repeats get `_1`, `_2`, ...
// A generated name never reuses one already emitted.
fn header_names(cells: &[Data]) -> Vec<String> {
    let mut counters: HashMap<String, usize> = HashMap::new();
    let mut used: HashSet<String> = HashSet::new();
    cells
        .iter()
        .map(|cell| {
            let base = cell_text(cell).unwrap_or_else(|| "__EMPTY".to_string());
            let mut name = base.clone();
            if used.contains(&name) {
                let n = counters.entry(base.clone()).or_insert(0);
                loop {
                    *n += 1;
                    name = format!("{}_{}", base, n);
                    if !used.contains(&name) {
                        break;
                    }
                }
            }
            used.insert(name.clone());
            name
        })
        .collect()
}

/// Every key that appears in `rows`, in first-seen order.
pub fn columns<'a, I>(rows: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a Row>,
{
    let mut cols: IndexSet<String> = IndexSet::new();
    for row in rows {
        for key in row.keys() {
            if !cols.contains(key) {
                cols.insert(key.clone());
            }
        }
    }
    cols.into_iter().collect()
}

/// Header line is plain; every data cell is quoted with `"` doubled.
pub fn to_csv(columns: &[String], rows: &[Row]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(columns.join(","));
    for row in rows {
        let line = columns
            .iter()
            .map(|c| {
                let value = row.get(c).map(String::as_str).unwrap_or("");
                format!("\"{}\"", value.replace('"', "\"\""))
            })
            .collect::<Vec<_>>()
            .join(",");
        lines.push(line);
    }
    lines.join("\n")
}

pub fn to_xlsx(columns: &[String], rows: &[Row]) -> Result<Vec<u8>, SpreadsheetError> {
    let mut workbook = Workbook::new();
    let header_fmt = Format::new().set_bold();

    let sheet = workbook.add_worksheet();
    sheet.set_name(EXPORT_SHEET_NAME)?;

    for (col_idx, name) in columns.iter().enumerate() {
        let col = u16::try_from(col_idx)
            .map_err(|_| SpreadsheetError::TooManyColumns(columns.len()))?;
        sheet.write_string_with_format(0, col, name, &header_fmt)?;

        for (row_idx, row) in rows.iter().enumerate() {
            if let Some(value) = row.get(name) {
                sheet.write_string(row_idx as u32 + 1, col, value)?;
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}

/// Flattens records for export: data columns, then `status` and `reason`.
pub fn records_table(records: &[&Record]) -> (Vec<String>, Vec<Row>) {
    let mut cols = columns(records.iter().map(|r| &r.data));
    cols.retain(|c| c != "status" && c != "reason");
    cols.push("status".to_string());
    cols.push("reason".to_string());

    let rows = records
        .iter()
        .map(|r| {
            let mut row = r.data.clone();
            row.insert("status".to_string(), r.status.to_string());
            row.insert("reason".to_string(), r.reason.clone());
            row
        })
        .collect();

    (cols, rows)
}
