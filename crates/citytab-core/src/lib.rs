//! Core table model for citytab: row identity, the two cell stages and citation cleanup.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "citytab-core";

/// Canonical names of the columns produced by the listing table, in order.
pub const LISTING_COLUMNS: [&str; 9] = [
    "rank",
    "city",
    "state",
    "population_estimate_recent",
    "population_estimate_prior",
    "population_change_percentage",
    "land_area",
    "population_density",
    "location",
];

pub const CITY_COLUMN: &str = "city";
pub const DESCRIPTION_COLUMN: &str = "description";

/// Timestamp layout used when a date cell is rendered.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[.*?\]").expect("invalid regex: citation"));

/// Remove bracketed citation markers such as `[12]` or `[note 3]`.
pub fn strip_citations(text: &str) -> String {
    CITATION.replace_all(text, "").into_owned()
}

/// Stable identity of a city: its row position in the listing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CityId(pub usize);

impl CityId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A table cell with an explicit empty marker.
pub trait Cell: Clone {
    fn empty() -> Self;
    fn is_empty(&self) -> bool;
}

/// Raw stage: scraped text, where the empty string means "no value".
impl Cell for String {
    fn empty() -> Self {
        String::new()
    }

    fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

/// Normalized stage cell.
///
/// `Empty` means nothing was scraped; `Missing` means text was scraped but could not be
/// coerced into the column's type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Date(NaiveDateTime),
    Missing,
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            Value::Empty
        } else {
            Value::Text(value)
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Empty | Value::Missing => ValueKind::Absent,
            Value::Text(_) => ValueKind::Text,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Date(_) => ValueKind::Date,
        }
    }
}

impl Cell for Value {
    fn empty() -> Self {
        Value::Empty
    }

    fn is_empty(&self) -> bool {
        matches!(self, Value::Empty | Value::Missing)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty | Value::Missing => Ok(()),
            Value::Text(text) => f.write_str(text),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{v:.1}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Absent,
    Text,
    Int,
    Float,
    Date,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("unknown column {0:?}")]
    UnknownColumn(String),
    #[error("unknown record {0}")]
    UnknownRecord(CityId),
    #[error("column {0:?} already exists")]
    DuplicateColumn(String),
    #[error("row {row} has {found} cells, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("column order is not a permutation of the current columns")]
    NotAPermutation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record<C> {
    pub id: CityId,
    cells: HashMap<String, C>,
}

impl<C: Cell> Record<C> {
    pub fn get(&self, column: &str) -> Option<&C> {
        self.cells.get(column)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }
}

/// Ordered columns plus ordered records; every record holds a cell for every column.
///
/// Records are created once and never inserted or removed afterwards, so `CityId(i)`
/// always addresses `records[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Table<C> {
    columns: Vec<String>,
    records: Vec<Record<C>>,
}

impl<C: Cell> Table<C> {
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<C>>) -> Result<Self, TableError> {
        for (i, name) in columns.iter().enumerate() {
            if columns[..i].contains(name) {
                return Err(TableError::DuplicateColumn(name.clone()));
            }
        }

        let mut records = Vec::with_capacity(rows.len());
        for (row, cells) in rows.into_iter().enumerate() {
            if cells.len() != columns.len() {
                return Err(TableError::RowWidth {
                    row,
                    expected: columns.len(),
                    found: cells.len(),
                });
            }
            records.push(Record {
                id: CityId(row),
                cells: columns.iter().cloned().zip(cells).collect(),
            });
        }

        Ok(Self { columns, records })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[Record<C>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CityId> + '_ {
        self.records.iter().map(|r| r.id)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Append a column filled with the empty marker. Returns `false` if it already existed.
    pub fn add_column(&mut self, name: &str) -> bool {
        if self.has_column(name) {
            return false;
        }
        self.columns.push(name.to_string());
        for record in &mut self.records {
            record.cells.insert(name.to_string(), C::empty());
        }
        true
    }

    pub fn get(&self, id: CityId, column: &str) -> Option<&C> {
        self.records.get(id.index())?.cells.get(column)
    }

    pub fn set(&mut self, id: CityId, column: &str, value: C) -> Result<(), TableError> {
        if !self.has_column(column) {
            return Err(TableError::UnknownColumn(column.to_string()));
        }
        let record = self
            .records
            .get_mut(id.index())
            .ok_or(TableError::UnknownRecord(id))?;
        record.cells.insert(column.to_string(), value);
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> bool {
        let Some(pos) = self.columns.iter().position(|c| c == name) else {
            return false;
        };
        self.columns.remove(pos);
        for record in &mut self.records {
            record.cells.remove(name);
        }
        true
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<(), TableError> {
        if from == to {
            return if self.has_column(from) {
                Ok(())
            } else {
                Err(TableError::UnknownColumn(from.to_string()))
            };
        }
        if self.has_column(to) {
            return Err(TableError::DuplicateColumn(to.to_string()));
        }
        let pos = self
            .columns
            .iter()
            .position(|c| c == from)
            .ok_or_else(|| TableError::UnknownColumn(from.to_string()))?;
        self.columns[pos] = to.to_string();
        for record in &mut self.records {
            if let Some(cell) = record.cells.remove(from) {
                record.cells.insert(to.to_string(), cell);
            }
        }
        Ok(())
    }

    /// Replace the column order; `order` must name exactly the current columns.
    pub fn reorder_columns(&mut self, order: Vec<String>) -> Result<(), TableError> {
        let mut current = self.columns.clone();
        let mut wanted = order.clone();
        current.sort();
        wanted.sort();
        if current != wanted {
            return Err(TableError::NotAPermutation);
        }
        self.columns = order;
        Ok(())
    }

    pub fn non_empty_count(&self, column: &str) -> usize {
        self.records
            .iter()
            .filter(|r| r.cells.get(column).is_some_and(|c| !c.is_empty()))
            .count()
    }

    pub fn column_cells<'a>(&'a self, column: &'a str) -> impl Iterator<Item = (CityId, &'a C)> + 'a {
        self.records
            .iter()
            .filter_map(move |r| r.cells.get(column).map(|c| (r.id, c)))
    }

    /// Cells of one record in column order.
    pub fn row(&self, id: CityId) -> Option<Vec<&C>> {
        let record = self.records.get(id.index())?;
        self.columns.iter().map(|c| record.cells.get(c)).collect()
    }

    /// One-way stage transition: every cell is converted, column order is preserved.
    pub fn map_cells<D, F>(self, mut f: F) -> Table<D>
    where
        D: Cell,
        F: FnMut(CityId, &str, C) -> D,
    {
        let records = self
            .records
            .into_iter()
            .map(|record| {
                let id = record.id;
                let cells = record
                    .cells
                    .into_iter()
                    .map(|(column, cell)| {
                        let value = f(id, &column, cell);
                        (column, value)
                    })
                    .collect();
                Record { id, cells }
            })
            .collect();
        Table {
            columns: self.columns,
            records,
        }
    }
}
