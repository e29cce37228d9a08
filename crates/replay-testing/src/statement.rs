//! Statements and the command language.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::MemoryError;
use crate::value::{QueryResult, Row, Value, int_param, text_param};

/// Tables keyed by name; each table maps id to value.
pub(crate) type Tables = BTreeMap<String, BTreeMap<i64, String>>;

/// A statement as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    prepared: bool,
}

impl Statement {
    /// Create an unprepared statement.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            prepared: false,
        }
    }

    /// The statement text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether the statement went through `prepare`.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub(crate) fn into_prepared(self) -> Self {
        Self {
            prepared: true,
            ..self
        }
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

/// A parsed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    CreateTable(String),
    Insert(String),
    Update(String),
    Delete(String),
    Select { table: String, by_id: bool },
    Begin,
    Commit,
    Rollback,
}

#[allow(clippy::unwrap_used)]
static CREATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^CREATE\s+TABLE\s+(\w+)$").unwrap());

#[allow(clippy::unwrap_used)]
static INSERT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^INSERT\s+INTO\s+(\w+)\s+VALUES\s*\(\s*\$1\s*,\s*\$2\s*\)$").unwrap()
});

#[allow(clippy::unwrap_used)]
static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^UPDATE\s+(\w+)\s+SET\s+value\s*=\s*\$2\s+WHERE\s+id\s*=\s*\$1$").unwrap()
});

#[allow(clippy::unwrap_used)]
static DELETE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^DELETE\s+FROM\s+(\w+)\s+WHERE\s+id\s*=\s*\$1$").unwrap());

#[allow(clippy::unwrap_used)]
static SELECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^SELECT\s+\*\s+FROM\s+(\w+)(\s+WHERE\s+id\s*=\s*\$1)?$").unwrap()
});

impl Command {
    pub(crate) fn parse(sql: &str) -> Result<Self, MemoryError> {
        let sql = sql.trim().trim_end_matches(';').trim_end();

        let table = |re: &Regex| {
            re.captures(sql)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_lowercase())
        };

        if let Some(caps) = SELECT_RE.captures(sql) {
            if let Some(name) = caps.get(1) {
                return Ok(Self::Select {
                    table: name.as_str().to_lowercase(),
                    by_id: caps.get(2).is_some(),
                });
            }
        }
        if let Some(name) = table(&INSERT_RE) {
            return Ok(Self::Insert(name));
        }
        if let Some(name) = table(&UPDATE_RE) {
            return Ok(Self::Update(name));
        }
        if let Some(name) = table(&DELETE_RE) {
            return Ok(Self::Delete(name));
        }
        if let Some(name) = table(&CREATE_RE) {
            return Ok(Self::CreateTable(name));
        }

        match sql.to_uppercase().as_str() {
            "BEGIN" | "START TRANSACTION" => Ok(Self::Begin),
            "COMMIT" => Ok(Self::Commit),
            "ROLLBACK" => Ok(Self::Rollback),
            _ => Err(MemoryError::Syntax(sql.to_string())),
        }
    }

    /// Apply a data command to `tables`.
    ///
    /// Returns the result and the name of the table written, if any.
    pub(crate) fn apply(
        &self,
        tables: &mut Tables,
        params: &[Value],
    ) -> Result<(QueryResult, Option<String>), MemoryError> {
        match self {
            Self::CreateTable(name) => {
                if tables.contains_key(name) {
                    return Err(MemoryError::TableExists(name.clone()));
                }
                tables.insert(name.clone(), BTreeMap::new());
                Ok((QueryResult::default(), Some(name.clone())))
            }
            Self::Insert(name) => {
                let table = table_mut(tables, name)?;
                let id = int_param(params, 1)?;
                let value = text_param(params, 2)?;
                if table.contains_key(&id) {
                    return Err(MemoryError::UniqueViolation {
                        table: name.clone(),
                        id,
                    });
                }
                table.insert(id, value);
                Ok((QueryResult::affected(1), Some(name.clone())))
            }
            Self::Update(name) => {
                let table = table_mut(tables, name)?;
                let id = int_param(params, 1)?;
                let value = text_param(params, 2)?;
                let affected = match table.get_mut(&id) {
                    Some(existing) => {
                        *existing = value;
                        1
                    }
                    None => 0,
                };
                Ok((QueryResult::affected(affected), Some(name.clone())))
            }
            Self::Delete(name) => {
                let table = table_mut(tables, name)?;
                let id = int_param(params, 1)?;
                let affected = u64::from(table.remove(&id).is_some());
                Ok((QueryResult::affected(affected), Some(name.clone())))
            }
            Self::Select { table, by_id } => {
                let rows = select(tables, table, *by_id, params)?;
                Ok((QueryResult::rows(rows), None))
            }
            Self::Begin | Self::Commit | Self::Rollback => Ok((QueryResult::default(), None)),
        }
    }
}

pub(crate) fn select(
    tables: &Tables,
    name: &str,
    by_id: bool,
    params: &[Value],
) -> Result<Vec<Row>, MemoryError> {
    let table = tables
        .get(name)
        .ok_or_else(|| MemoryError::UnknownTable(name.to_string()))?;

    if by_id {
        let id = int_param(params, 1)?;
        return Ok(table
            .get(&id)
            .map(|value| vec![Row::new(id, value.clone())])
            .unwrap_or_default());
    }

    Ok(table
        .iter()
        .map(|(id, value)| Row::new(*id, value.clone()))
        .collect())
}

fn table_mut<'a>(
    tables: &'a mut Tables,
    name: &str,
) -> Result<&'a mut BTreeMap<i64, String>, MemoryError> {
    tables
        .get_mut(name)
        .ok_or_else(|| MemoryError::UnknownTable(name.to_string()))
}
