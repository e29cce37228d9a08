//! The replay log.
//!
//! Two ordered sequences of statement-affecting operations plus a recovery
//! marker:
//!
//! - the durable log holds entries applied outside any pseudo-transaction, or
//!   inside one that committed cleanly;
//! - the pending log holds entries applied inside the open pseudo-transaction.
//!
//! The marker records whether a failure inside the open pseudo-transaction
//! is waiting to be resolved ([`Marker::ErrorPending`]) or whether the real
//! transaction was discarded and the durable log must be replayed before the
//! next operation ([`Marker::ReplayPending`]).

use std::fmt;

use replay_driver::Driver;

/// Recovery state of a [`ReplayLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Marker {
    /// Nothing to recover.
    #[default]
    Clean,
    /// A statement failed inside the open pseudo-transaction.
    ErrorPending,
    /// The real transaction was restarted; the durable log must be replayed.
    ReplayPending,
}

/// Kind of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A statement execution.
    Execute,
    /// A prepared statement close.
    Close,
    /// A cursor declaration.
    Declare,
    /// A cursor fetch.
    Fetch,
    /// A cursor release.
    Deallocate,
}

impl EntryKind {
    /// Lowercase name of the operation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Close => "close",
            Self::Declare => "declare",
            Self::Fetch => "fetch",
            Self::Deallocate => "deallocate",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logged operation with the arguments it was originally called with.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry<Q, P, C> {
    /// `execute(query, params)`.
    Execute {
        /// The statement.
        query: Q,
        /// Its parameters.
        params: P,
    },
    /// `close(query)`.
    Close {
        /// The statement.
        query: Q,
    },
    /// `declare(query, params)`.
    Declare {
        /// The statement.
        query: Q,
        /// Its parameters.
        params: P,
    },
    /// `fetch(query, cursor)`.
    Fetch {
        /// The statement.
        query: Q,
        /// The cursor fetched from.
        cursor: C,
    },
    /// `deallocate(query, cursor)`.
    Deallocate {
        /// The statement.
        query: Q,
        /// The cursor released.
        cursor: C,
    },
}

impl<Q, P, C> LogEntry<Q, P, C> {
    /// The kind of operation.
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Execute { .. } => EntryKind::Execute,
            Self::Close { .. } => EntryKind::Close,
            Self::Declare { .. } => EntryKind::Declare,
            Self::Fetch { .. } => EntryKind::Fetch,
            Self::Deallocate { .. } => EntryKind::Deallocate,
        }
    }

    /// The statement the operation ran against.
    #[must_use]
    pub fn query(&self) -> &Q {
        match self {
            Self::Execute { query, .. }
            | Self::Close { query }
            | Self::Declare { query, .. }
            | Self::Fetch { query, .. }
            | Self::Deallocate { query, .. } => query,
        }
    }
}

/// Log entry type for a driver.
pub type DriverEntry<D> =
    LogEntry<<D as Driver>::Query, <D as Driver>::Params, <D as Driver>::Cursor>;

/// Replay log type for a driver.
pub type DriverLog<D> =
    ReplayLog<<D as Driver>::Query, <D as Driver>::Params, <D as Driver>::Cursor>;

/// Durable and pending logs with their recovery marker.
#[derive(Debug, Clone)]
pub struct ReplayLog<Q, P, C> {
    durable: Vec<LogEntry<Q, P, C>>,
    pending: Vec<LogEntry<Q, P, C>>,
    marker: Marker,
}

impl<Q, P, C> Default for ReplayLog<Q, P, C> {
    fn default() -> Self {
        Self {
            durable: Vec::new(),
            pending: Vec::new(),
            marker: Marker::Clean,
        }
    }
}

impl<Q, P, C> ReplayLog<Q, P, C> {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries considered durable relative to the outer transaction.
    #[must_use]
    pub fn durable(&self) -> &[LogEntry<Q, P, C>] {
        &self.durable
    }

    /// Entries of the open pseudo-transaction.
    #[must_use]
    pub fn pending(&self) -> &[LogEntry<Q, P, C>] {
        &self.pending
    }

    /// The current recovery marker.
    #[must_use]
    pub fn marker(&self) -> Marker {
        self.marker
    }

    /// Whether a failure inside the open pseudo-transaction is unresolved.
    #[must_use]
    pub fn error_pending(&self) -> bool {
        self.marker == Marker::ErrorPending
    }

    /// Whether the durable log must be replayed before the next operation.
    #[must_use]
    pub fn replay_pending(&self) -> bool {
        self.marker == Marker::ReplayPending
    }

    /// Append a successful operation.
    pub fn record(&mut self, entry: LogEntry<Q, P, C>, in_transaction: bool) {
        if in_transaction {
            self.pending.push(entry);
        } else {
            self.durable.push(entry);
        }
    }

    /// Note a failure inside the open pseudo-transaction and drop its entries.
    ///
    /// Returns `false` if a failure was already pending; the marker is never
    /// duplicated.
    pub fn flag_error(&mut self) -> bool {
        self.pending.clear();
        if self.marker == Marker::Clean {
            self.marker = Marker::ErrorPending;
            true
        } else {
            false
        }
    }

    /// Drop an unresolved failure marker.
    pub fn clear_error(&mut self) {
        if self.marker == Marker::ErrorPending {
            self.marker = Marker::Clean;
        }
    }

    /// Mark the durable log for replay and drop pending entries.
    pub fn request_replay(&mut self) {
        self.pending.clear();
        self.marker = Marker::ReplayPending;
    }

    /// Consume the replay marker once the durable log has been replayed.
    pub fn finish_replay(&mut self) {
        self.pending.clear();
        if self.marker == Marker::ReplayPending {
            self.marker = Marker::Clean;
        }
    }

    /// Move pending entries onto the end of the durable log.
    ///
    /// Returns the number of entries moved.
    pub fn fold_pending(&mut self) -> usize {
        let moved = self.pending.len();
        self.durable.append(&mut self.pending);
        moved
    }

    /// Drop pending entries.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }
}
