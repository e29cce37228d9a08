//! Tagged outcomes returned by driver operations.

use std::fmt;

use thiserror::Error;

/// Failure-like outcome of a driver operation.
///
/// `Error` leaves the connection usable; `Disconnect` tells the owner of the
/// connection that it must be discarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    /// The operation failed but the connection is still usable.
    #[error("{0}")]
    Error(E),

    /// The operation failed and the connection must be discarded.
    #[error("disconnected: {0}")]
    Disconnect(E),
}

impl<E> Failure<E> {
    /// Whether the connection must be discarded.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnect(_))
    }

    /// Borrow the underlying error.
    #[must_use]
    pub fn error(&self) -> &E {
        match self {
            Self::Error(e) | Self::Disconnect(e) => e,
        }
    }

    /// Unwrap the underlying error, dropping the failure kind.
    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Error(e) | Self::Disconnect(e) => e,
        }
    }

    /// Map the underlying error, keeping the failure kind.
    pub fn map<F, T>(self, f: F) -> Failure<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            Self::Error(e) => Failure::Error(f(e)),
            Self::Disconnect(e) => Failure::Disconnect(f(e)),
        }
    }

    /// Escalate to a disconnect, keeping the error.
    #[must_use]
    pub fn into_disconnect(self) -> Self {
        Self::Disconnect(self.into_inner())
    }
}

/// Transaction status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// No transaction is open.
    Idle,
    /// A transaction is open.
    Transaction,
    /// A transaction is open but has failed and must be rolled back.
    Error,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Transaction => "transaction",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Successful outcome of `begin`, `commit` or `rollback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transition happened.
    Done,
    /// The connection was not in a status that allows the transition.
    ///
    /// `begin` reports [`TxStatus::Transaction`] when a transaction is already
    /// open; `commit` and `rollback` report [`TxStatus::Idle`] when none is.
    Refused(TxStatus),
}

impl Transition {
    /// Whether the transition happened.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Successful outcome of a cursor fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    /// More results are available.
    Continue(T),
    /// The cursor is exhausted.
    Halt(T),
}

impl<T> Fetched<T> {
    /// Borrow the fetched value.
    #[must_use]
    pub fn get(&self) -> &T {
        match self {
            Self::Continue(v) | Self::Halt(v) => v,
        }
    }

    /// Take the fetched value.
    #[must_use]
    pub fn into_inner(self) -> T {
        match self {
            Self::Continue(v) | Self::Halt(v) => v,
        }
    }

    /// Whether the cursor is exhausted.
    #[must_use]
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt(_))
    }
}
