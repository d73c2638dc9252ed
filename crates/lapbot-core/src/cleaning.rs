//! Missing-value report for crawled datasets.

use serde::Serialize;

use crate::table::{Table, is_missing_cell};

/// Missing-value count of one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingColumn {
    pub column: String,
    pub missing: usize,
    /// Share of rows missing, 0–100.
    pub percent: f64,
}

/// Counts empty cells and missing tokens (`null`, `n/a`, `-`, ...) per
/// column, most incomplete columns first. Ties keep header order.
pub fn missing_report(table: &Table) -> Vec<MissingColumn> {
    let total = table.len();
    let mut report: Vec<MissingColumn> = table
        .headers
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let missing = table
                .rows
                .iter()
                .filter(|row| is_missing_cell(row.get(idx).and_then(|c| c.as_deref())))
                .count();
            let percent = if total == 0 {
                0.0
            } else {
                missing as f64 * 100.0 / total as f64
            };
            MissingColumn {
                column: column.clone(),
                missing,
                percent,
            }
        })
        .collect();

    report.sort_by(|a, b| b.missing.cmp(&a.missing));
    report
}

/// Columns with at least one missing value.
pub fn incomplete_columns(report: &[MissingColumn]) -> impl Iterator<Item = &MissingColumn> {
    report.iter().filter(|c| c.missing > 0)
}
