//! Typed query rows shared by the subprocess bridge and server-side queries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A dynamically typed cell value.
///
/// Converted from `serde_json::Value` at the parsing boundary so untyped JSON never
/// leaks into callers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// JSON null or a missing column
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Integral number that fits in `i64`
    Integer(i64),
    /// Any other number
    Float(f64),
    /// Text
    String(String),
    /// Nested array
    Array(Vec<Value>),
    /// Nested object with sorted keys
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Check for null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integral value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
            Self::Array(_) | Self::Object(_) => {
                let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

/// One decoded record, or the end-of-stream marker.
///
/// All rows of one query share the same column list.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingRow {
    /// Column names, fixed by the first row of the query.
    pub columns: Arc<[String]>,
    /// Cell values in column order. Empty for the end marker.
    pub values: Vec<Value>,
    /// Total row count, present only on the end marker.
    pub final_row_count: Option<u64>,
}

impl StreamingRow {
    /// Create the end-of-stream marker.
    pub fn end_of_stream(columns: Arc<[String]>, row_count: u64) -> Self {
        Self { columns, values: Vec::new(), final_row_count: Some(row_count) }
    }

    /// Check if this is the end-of-stream marker.
    pub fn is_end_of_stream(&self) -> bool {
        self.final_row_count.is_some()
    }

    /// Look up a cell by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.iter().position(|c| c == column).and_then(|idx| self.values.get(idx))
    }
}

/// Turns JSON objects into rows with a stable column set.
///
/// The column set is fixed by the first object (sorted for determinism). Later objects
/// map missing columns to null and drop extra fields.
#[derive(Debug, Default)]
pub struct RowDecoder {
    columns: Option<Arc<[String]>>,
    rows_emitted: u64,
}

impl RowDecoder {
    /// Create a decoder with no columns fixed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns fixed so far (empty before the first row).
    pub fn columns(&self) -> Arc<[String]> {
        self.columns.clone().unwrap_or_else(|| Arc::from(Vec::<String>::new()))
    }

    /// Number of data rows produced.
    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted
    }

    /// Decode one JSON text line. Returns `None` for blank or non-object lines.
    pub fn decode_line(&mut self, line: &str) -> Option<StreamingRow> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => self.decode_value(value),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed result line");
                None
            }
        }
    }

    /// Decode one JSON value. Returns `None` unless it is an object.
    pub fn decode_value(&mut self, value: serde_json::Value) -> Option<StreamingRow> {
        let serde_json::Value::Object(mut object) = value else {
            tracing::warn!("Skipping result line that is not a JSON object");
            return None;
        };

        let columns = self
            .columns
            .get_or_insert_with(|| {
                let mut names: Vec<String> = object.keys().cloned().collect();
                names.sort();
                Arc::from(names)
            })
            .clone();

        let values = columns
            .iter()
            .map(|name| object.remove(name).map(Value::from).unwrap_or(Value::Null))
            .collect();

        self.rows_emitted += 1;
        Some(StreamingRow { columns, values, final_row_count: None })
    }

    /// Build the end-of-stream marker carrying the row count.
    pub fn finish(&self) -> StreamingRow {
        StreamingRow::end_of_stream(self.columns(), self.rows_emitted)
    }
}
