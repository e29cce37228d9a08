//! In-memory backend errors.

use thiserror::Error;

/// Errors raised by the in-memory backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The statement is not part of the command language.
    #[error("syntax error in statement: {0}")]
    Syntax(String),

    /// Parameters are missing or of the wrong type.
    #[error("invalid parameters: {0}")]
    Params(String),

    /// The table does not exist.
    #[error("relation \"{0}\" does not exist")]
    UnknownTable(String),

    /// The table already exists.
    #[error("relation \"{0}\" already exists")]
    TableExists(String),

    /// A row with this id already exists.
    #[error("duplicate key value violates unique constraint on \"{table}\": id={id}")]
    UniqueViolation {
        /// The table.
        table: String,
        /// The conflicting id.
        id: i64,
    },

    /// An earlier statement failed inside the current transaction.
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    Aborted,

    /// The operation requires a transaction.
    #[error("there is no transaction in progress")]
    NoTransaction,

    /// A transaction is already open.
    #[error("there is already a transaction in progress")]
    TransactionInProgress,

    /// Cursors can only be declared over `SELECT`.
    #[error("cursor can only scan a SELECT statement")]
    NotAQuery,

    /// The cursor does not exist in the current transaction.
    #[error("cursor {0} does not exist")]
    UnknownCursor(u64),

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,

    /// The server refused to open a transaction.
    #[error("server is not accepting new transactions")]
    TransactionsRefused,

    /// The server refused a new connection.
    #[error("server is not accepting connections")]
    Refused,
}
