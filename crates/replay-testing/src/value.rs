//! Parameter values, rows and results.

use std::fmt;

use crate::error::MemoryError;

/// A bound parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A 64-bit integer.
    Int(i64),
    /// A string.
    Text(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{v}'"),
        }
    }
}

/// Build the `($1, $2)` parameter list used by most statements.
#[must_use]
pub fn params(id: i64, value: impl Into<Value>) -> Vec<Value> {
    vec![Value::Int(id), value.into()]
}

pub(crate) fn int_param(params: &[Value], position: usize) -> Result<i64, MemoryError> {
    match params.get(position - 1) {
        Some(Value::Int(v)) => Ok(*v),
        Some(other) => Err(MemoryError::Params(format!(
            "${position} must be an integer, got {other}"
        ))),
        None => Err(MemoryError::Params(format!("${position} is missing"))),
    }
}

pub(crate) fn text_param(params: &[Value], position: usize) -> Result<String, MemoryError> {
    match params.get(position - 1) {
        Some(Value::Text(v)) => Ok(v.clone()),
        Some(other) => Err(MemoryError::Params(format!(
            "${position} must be text, got {other}"
        ))),
        None => Err(MemoryError::Params(format!("${position} is missing"))),
    }
}

/// A table row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Row {
    /// Primary key.
    pub id: i64,
    /// Payload.
    pub value: String,
}

impl Row {
    /// Create a row.
    pub fn new(id: i64, value: impl Into<String>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }
}

/// Result of a statement or fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Rows inserted, updated or deleted.
    pub rows_affected: u64,
    /// Rows returned.
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub(crate) fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            rows: Vec::new(),
        }
    }

    pub(crate) fn rows(rows: Vec<Row>) -> Self {
        Self {
            rows_affected: 0,
            rows,
        }
    }
}
