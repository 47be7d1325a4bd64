//! CSV export and the column profile report.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use citytab_core::{Table, Value, ValueKind, DATE_FORMAT};
use serde::Serialize;
use tokio::fs;

/// Serialize the table as UTF-8 CSV: header row, no index column, empty fields for
/// empty and missing values.
pub fn export_csv_bytes(table: &Table<Value>) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(table.columns())
        .context("writing csv header")?;
    for record in table.records() {
        let row = table
            .row(record.id)
            .with_context(|| format!("record {} is missing cells", record.id))?;
        writer
            .write_record(row.iter().map(|value| value.to_string()))
            .with_context(|| format!("writing csv row {}", record.id))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv writer: {}", err.error()))
}

pub async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnProfile {
    pub name: String,
    pub kind: ValueKind,
    pub non_empty: usize,
    pub missing: usize,
    pub min: Option<String>,
    pub max: Option<String>,
    pub mean: Option<f64>,
}

/// Per-column summary of the final table, the kind taken from the first present value.
pub fn profile_table(table: &Table<Value>) -> Vec<ColumnProfile> {
    table
        .columns()
        .iter()
        .map(|name| {
            let cells: Vec<&Value> = table.column_cells(name).map(|(_, v)| v).collect();
            let kind = cells
                .iter()
                .map(|v| v.kind())
                .find(|k| *k != ValueKind::Absent)
                .unwrap_or(ValueKind::Absent);
            let non_empty = cells.iter().filter(|v| v.kind() != ValueKind::Absent).count();
            let missing = cells.iter().filter(|v| **v == &Value::Missing).count();

            let (min, max, mean) = match kind {
                ValueKind::Int | ValueKind::Float => {
                    let numbers: Vec<f64> = cells.iter().filter_map(|v| v.as_f64()).collect();
                    let min = numbers.iter().copied().reduce(f64::min);
                    let max = numbers.iter().copied().reduce(f64::max);
                    let mean = (!numbers.is_empty())
                        .then(|| numbers.iter().sum::<f64>() / numbers.len() as f64);
                    (min.map(|v| v.to_string()), max.map(|v| v.to_string()), mean)
                }
                ValueKind::Date => {
                    let dates: Vec<NaiveDateTime> = cells
                        .iter()
                        .filter_map(|v| match v {
                            Value::Date(d) => Some(*d),
                            _ => None,
                        })
                        .collect();
                    let fmt = |d: &NaiveDateTime| d.format(DATE_FORMAT).to_string();
                    (dates.iter().min().map(fmt), dates.iter().max().map(fmt), None)
                }
                _ => (None, None, None),
            };

            ColumnProfile {
                name: name.clone(),
                kind,
                non_empty,
                missing,
                min,
                max,
                mean,
            }
        })
        .collect()
}

pub fn render_profile_markdown(
    run_id: &str,
    records: usize,
    profiles: &[ColumnProfile],
) -> String {
    let rows = profiles
        .iter()
        .map(|p| {
            format!(
                "| {} | {:?} | {} | {} | {} | {} | {} |",
                p.name,
                p.kind,
                p.non_empty,
                p.missing,
                p.min.as_deref().unwrap_or("-"),
                p.max.as_deref().unwrap_or("-"),
                p.mean.map(|m| format!("{m:.2}")).unwrap_or_else(|| "-".to_string()),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Top US Cities Profile\n\n- Run ID: `{}`\n- Records: {}\n- Columns: {}\n\n## Columns\n| column | kind | non-empty | missing | min | max | mean |\n|---|---|---|---|---|---|---|\n{}\n",
        run_id,
        records,
        profiles.len(),
        rows
    )
}
