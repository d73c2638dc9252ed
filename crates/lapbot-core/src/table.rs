//! CSV dataset I/O.
//!
//! Every file written here starts with a UTF-8 BOM so spreadsheet tools
//! detect the encoding of Vietnamese product text. Readers strip it again.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::AppError;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Cell values treated as missing, compared trimmed and lowercased.
pub const MISSING_TOKENS: &[&str] = &["", "null", "na", "n/a", "nan", "none", "-", "--", "nat"];

/// A row keyed by column name.
pub type Record = BTreeMap<String, String>;

/// Returns true if `value` is one of the [`MISSING_TOKENS`].
///
/// ```
/// use lapbot_core::table::is_missing_value;
///
/// assert!(is_missing_value("  N/A "));
/// assert!(is_missing_value(""));
/// assert!(!is_missing_value("16GB"));
/// ```
pub fn is_missing_value(value: &str) -> bool {
    let normalized = value.trim().to_lowercase();
    MISSING_TOKENS.contains(&normalized.as_str())
}

/// Returns true if a cell is absent or holds a missing token.
pub fn is_missing_cell(cell: Option<&str>) -> bool {
    cell.is_none_or(is_missing_value)
}

/// Conversion into a [`Record`] for appending to a CSV file.
pub trait ToRecord {
    fn to_record(&self) -> Record;
}

impl ToRecord for Record {
    fn to_record(&self) -> Record {
        self.clone()
    }
}

/// An in-memory CSV dataset. Empty cells are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == column)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell at (`row`, `column`), `None` when absent or empty.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    /// Sets a cell, ignoring unknown columns and out-of-range rows.
    pub fn set(&mut self, row: usize, column: &str, value: impl Into<String>) {
        let Some(idx) = self.column_index(column) else {
            return;
        };
        if let Some(cell) = self.rows.get_mut(row).and_then(|cells| cells.get_mut(idx)) {
            *cell = Some(value.into());
        }
    }

    /// Appends a row in header order. Keys outside the header are dropped.
    pub fn push_record(&mut self, record: &Record) {
        let cells = self
            .headers
            .iter()
            .map(|h| record.get(h).filter(|v| !v.is_empty()).cloned())
            .collect();
        self.rows.push(cells);
    }

    /// Row as a record, skipping empty cells.
    pub fn record(&self, row: usize) -> Record {
        let mut record = Record::new();
        if let Some(cells) = self.rows.get(row) {
            for (header, cell) in self.headers.iter().zip(cells) {
                if let Some(value) = cell {
                    record.insert(header.clone(), value.clone());
                }
            }
        }
        record
    }
}

pub fn ensure_parent_dir(path: &Path) -> Result<(), AppError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)?,
        _ => {}
    }
    Ok(())
}

fn clean_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_string()
}

/// Reads a whole CSV file. Short rows are padded with `None`.
pub fn read_table(path: &Path) -> Result<Table, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(clean_header).collect();
    let width = headers.len();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut cells: Vec<Option<String>> = record
            .iter()
            .take(width)
            .map(|cell| (!cell.is_empty()).then(|| cell.to_string()))
            .collect();
        cells.resize(width, None);
        rows.push(cells);
    }

    Ok(Table { headers, rows })
}

/// Writes the table to `path`, replacing any existing file.
pub fn write_table(path: &Path, table: &Table) -> Result<(), AppError> {
    ensure_parent_dir(path)?;
    let mut file = File::create(path)?;
    file.write_all(UTF8_BOM)?;

    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_record(row.iter().map(|c| c.as_deref().unwrap_or("")))?;
    }
    writer.flush()?;
    Ok(())
}

/// Values of one column, trimmed, empty cells dropped.
///
/// Falls back to the first column when `column` is not in the header,
/// which covers id lists saved without a header name.
pub fn read_column(path: &Path, column: &str) -> Result<Vec<String>, AppError> {
    let table = read_table(path)?;
    let idx = match table.column_index(column) {
        Some(idx) => idx,
        None if !table.headers.is_empty() => {
            tracing::warn!(
                path = %path.display(),
                column,
                fallback = table.headers[0].as_str(),
                "Column not found, using first column"
            );
            0
        }
        None => return Err(AppError::MissingColumn(column.to_string())),
    };

    Ok(table
        .rows
        .iter()
        .filter_map(|row| row.get(idx).cloned().flatten())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

/// Number of data rows in `path`, 0 when the file does not exist.
pub fn count_rows(path: &Path) -> Result<usize, AppError> {
    if !path.exists() {
        return Ok(0);
    }
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)?;
    let mut count = 0;
    for record in reader.records() {
        record?;
        count += 1;
    }
    Ok(count)
}

/// Header of an existing, non-empty CSV file.
fn existing_header(path: &Path) -> Result<Option<Vec<String>>, AppError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => {}
        _ => return Ok(None),
    }
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(clean_header).collect();
    Ok((!headers.is_empty()).then_some(headers))
}

/// Appends rows to a CSV file that may already hold earlier results.
///
/// The BOM and header are written only when the file is new or empty.
/// When the file already has a header, rows follow that header: unknown
/// keys are dropped and absent keys become empty cells.
pub struct CsvAppender {
    path: PathBuf,
    header: Vec<String>,
    writer: csv::Writer<File>,
}

impl CsvAppender {
    pub fn open<S: AsRef<str>>(path: &Path, header: &[S]) -> Result<Self, AppError> {
        ensure_parent_dir(path)?;
        let existing = existing_header(path)?;

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        let header = match existing {
            Some(existing) => existing,
            None => {
                let header: Vec<String> = header.iter().map(|h| h.as_ref().to_string()).collect();
                file.write_all(UTF8_BOM)?;
                let mut writer = csv::Writer::from_writer(&mut file);
                writer.write_record(&header)?;
                writer.flush()?;
                header
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            header,
            writer: csv::Writer::from_writer(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column order rows are written in.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Appends and flushes. Returns the number of rows written.
    pub fn append<R: ToRecord>(&mut self, rows: &[R]) -> Result<usize, AppError> {
        for row in rows {
            let record = row.to_record();
            self.writer.write_record(
                self.header
                    .iter()
                    .map(|column| record.get(column).map(String::as_str).unwrap_or("")),
            )?;
        }
        self.writer.flush()?;
        Ok(rows.len())
    }
}
