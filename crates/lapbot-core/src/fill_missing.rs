//! Missing-value filler.
//!
//! Rows with missing cells are sent to the model together with what is known
//! about the laptop. Each accepted answer is appended to a side file
//! (`<output stem>.fills.csv`) right away; once every row has been tried the
//! fills are merged into the table and the full output is written.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::checkpoint::normalize_key;
use crate::config::LlmProviderType;
use crate::error::AppError;
use crate::json::{parse_llm_json, value_to_cell};
use crate::models::{GenerationOptions, LlmRequest};
use crate::pipeline::EnrichTask;
use crate::table::{Record, Table, ToRecord, is_missing_cell, is_missing_value, read_table};

/// Default column identifying a row across runs.
pub const DEFAULT_KEY_COLUMN: &str = "product_id";

/// Columns of the fills side file.
pub const FILL_COLUMNS: [&str; 2] = ["row_key", "filled_values"];

/// One row that still has empty cells.
#[derive(Debug, Clone, PartialEq)]
pub struct FillInput {
    pub row_index: usize,
    pub row_key: String,
    pub name: String,
    pub manufacturer: String,
    /// Known `(column, value)` pairs in header order.
    pub known: Vec<(String, String)>,
    pub missing: Vec<String>,
}

/// Values the model supplied for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRecord {
    pub row_key: String,
    pub values: BTreeMap<String, String>,
}

impl ToRecord for FillRecord {
    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("row_key".to_string(), self.row_key.clone());
        record.insert(
            "filled_values".to_string(),
            Value::from(
                self.values
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                    .collect::<serde_json::Map<_, _>>(),
            )
            .to_string(),
        );
        record
    }
}

/// `filled.csv` → `filled_gemini.csv` / `filled_llama.csv`.
pub fn output_path_for(output: &Path, provider: LlmProviderType) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "csv".to_string());
    output.with_file_name(format!(
        "{}_{}.{}",
        stem,
        provider.output_suffix(),
        extension
    ))
}

/// Side file holding the fills of `output`.
pub fn fills_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("{}.fills.csv", stem))
}

/// Stable key per row: the `key_column` value when it is present and
/// unique in the table, otherwise `#<row index>`.
///
/// Rows sharing an id get index keys so each one is asked about and merged
/// separately.
pub fn row_keys(table: &Table, key_column: &str) -> Vec<String> {
    let key_idx = table.column_index(key_column);
    let values: Vec<Option<String>> = table
        .rows
        .iter()
        .map(|cells| {
            key_idx
                .and_then(|idx| cells.get(idx).cloned().flatten())
                .filter(|v| !is_missing_value(v))
                .map(|v| v.trim().to_string())
        })
        .collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for value in values.iter().flatten() {
        *counts.entry(normalize_key(value)).or_default() += 1;
    }

    values
        .into_iter()
        .enumerate()
        .map(|(row, value)| match value {
            Some(v) if counts.get(&normalize_key(&v)) == Some(&1) => v,
            _ => format!("#{row}"),
        })
        .collect()
}

fn known_or_na<'a>(table: &'a Table, row: usize, column: &str) -> &'a str {
    table
        .get(row, column)
        .filter(|v| !is_missing_value(v))
        .unwrap_or("N/A")
}

/// Rows with at least one missing cell (empty or a missing token).
pub fn collect_inputs(table: &Table, key_column: &str) -> Vec<FillInput> {
    let keys = row_keys(table, key_column);
    let mut inputs = Vec::new();

    for ((row_index, cells), row_key) in table.rows.iter().enumerate().zip(keys) {
        let mut missing = Vec::new();
        let mut known = Vec::new();
        for (header, cell) in table.headers.iter().zip(cells) {
            match cell.as_deref() {
                Some(value) if !is_missing_value(value) => {
                    known.push((header.clone(), value.to_string()))
                }
                _ => missing.push(header.clone()),
            }
        }
        // Short rows count their tail as missing.
        missing.extend(table.headers.iter().skip(cells.len()).cloned());
        if missing.is_empty() {
            continue;
        }

        inputs.push(FillInput {
            row_index,
            row_key,
            name: known_or_na(table, row_index, "name").to_string(),
            manufacturer: known_or_na(table, row_index, "manufacturer").to_string(),
            known,
            missing,
        });
    }

    inputs
}

/// Reads a fills side file. A missing file yields no fills.
pub fn load_fills(path: &Path) -> Result<Vec<FillRecord>, AppError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let table = read_table(path)?;
    let key_idx = table
        .column_index("row_key")
        .ok_or_else(|| AppError::MissingColumn("row_key".to_string()))?;
    let values_idx = table
        .column_index("filled_values")
        .ok_or_else(|| AppError::MissingColumn("filled_values".to_string()))?;

    let mut fills = Vec::with_capacity(table.len());
    for row in &table.rows {
        let Some(row_key) = row.get(key_idx).cloned().flatten() else {
            continue;
        };
        let raw = row.get(values_idx).cloned().flatten().unwrap_or_default();
        let values = match serde_json::from_str::<serde_json::Map<String, Value>>(&raw) {
            Ok(map) => map
                .iter()
                .filter_map(|(k, v)| value_to_cell(v).map(|cell| (k.clone(), cell)))
                .collect(),
            Err(e) => {
                tracing::warn!(row_key = row_key.as_str(), error = %e, "Skipping unreadable fill");
                continue;
            }
        };
        fills.push(FillRecord { row_key, values });
    }
    Ok(fills)
}

/// Writes fills into the cells that are still missing. Returns the number of
/// cells filled.
pub fn apply_fills(table: &mut Table, fills: &[FillRecord], key_column: &str) -> usize {
    let rows_by_key: HashMap<String, usize> = row_keys(table, key_column)
        .into_iter()
        .enumerate()
        .map(|(row, key)| (normalize_key(&key), row))
        .collect();

    let mut filled = 0;
    for fill in fills {
        let Some(&row) = rows_by_key.get(&normalize_key(&fill.row_key)) else {
            tracing::debug!(row_key = fill.row_key.as_str(), "Fill has no matching row");
            continue;
        };
        for (column, value) in &fill.values {
            if is_missing_cell(table.get(row, column)) && table.column_index(column).is_some() {
                table.set(row, column, value.clone());
                filled += 1;
            }
        }
    }
    filled
}

/// Asks the model for the empty cells of a row.
#[derive(Debug, Clone)]
pub struct FillMissingTask {
    columns: HashSet<String>,
    options: GenerationOptions,
}

impl FillMissingTask {
    pub fn new(columns: &[String]) -> Self {
        Self {
            columns: columns.iter().cloned().collect(),
            options: GenerationOptions::deterministic(),
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

const FILL_SYSTEM_PROMPT: &str = "You complete laptop specification sheets. \
Answer with one JSON object whose keys are exactly the requested column names. \
Numbers carry no units. Use null when a value cannot be found reliably.";

impl EnrichTask for FillMissingTask {
    type Input = FillInput;
    type Output = FillRecord;

    fn name(&self) -> &'static str {
        "fill_missing"
    }

    fn key(&self, input: &FillInput) -> String {
        input.row_key.clone()
    }

    fn build_request(&self, input: &FillInput) -> LlmRequest {
        let known = if input.known.is_empty() {
            "(none)".to_string()
        } else {
            input
                .known
                .iter()
                .map(|(column, value)| format!("- {}: {}", column, value))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let prompt = format!(
            "Laptop: {}\nManufacturer: {}\nKnown specifications:\n{}\n\nMissing columns: {}\n",
            input.name,
            input.manufacturer,
            known,
            input.missing.join(", ")
        );
        LlmRequest::new(prompt)
            .with_system(FILL_SYSTEM_PROMPT)
            .with_options(self.options.clone())
    }

    fn parse(&self, input: &FillInput, raw: &str) -> Result<FillRecord, AppError> {
        let value = parse_llm_json(raw)?;
        let Value::Object(map) = value else {
            return Err(AppError::MalformedResponse(
                "expected a JSON object of column values".to_string(),
            ));
        };

        let values: BTreeMap<String, String> = map
            .iter()
            .filter(|(column, _)| {
                self.columns.contains(column.as_str()) && input.missing.contains(column)
            })
            .filter_map(|(column, value)| value_to_cell(value).map(|cell| (column.clone(), cell)))
            .collect();

        Ok(FillRecord {
            row_key: input.row_key.clone(),
            values,
        })
    }
}
