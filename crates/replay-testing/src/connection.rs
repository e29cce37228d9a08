//! A connection to the in-memory server.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use replay_driver::{Driver, DriverResult, Failure, Fetched, Transition, TxStatus};

use crate::error::MemoryError;
use crate::server::ServerInner;
use crate::statement::{Command, Statement, Tables, select};
use crate::value::{QueryResult, Row, Value};

/// Cursor handle. Ids restart at 1 in every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorId(pub u64);

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor#{}", self.0)
    }
}

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Real transactions opened.
    pub begins: u64,
    /// Real transactions committed.
    pub commits: u64,
    /// Real transactions rolled back.
    pub rollbacks: u64,
    /// Statements executed, successful or not.
    pub statements: u64,
    /// Pool checkouts.
    pub checkouts: u64,
    /// Pool checkins.
    pub checkins: u64,
}

/// An open transaction: a private copy of the tables plus its cursors.
#[derive(Debug)]
struct Transaction {
    tables: Tables,
    written: BTreeSet<String>,
    poisoned: bool,
    cursors: BTreeMap<u64, CursorState>,
    next_cursor: u64,
}

#[derive(Debug)]
struct CursorState {
    rows: Vec<Row>,
    position: usize,
}

/// A connection to a [`MemoryServer`](crate::MemoryServer).
pub struct MemoryConnection {
    server: Arc<ServerInner>,
    id: u64,
    tx: Option<Transaction>,
    closed: bool,
    stats: ConnectionStats,
}

impl MemoryConnection {
    pub(crate) fn new(server: Arc<ServerInner>, id: u64) -> Self {
        Self {
            server,
            id,
            tx: None,
            closed: false,
            stats: ConnectionStats::default(),
        }
    }

    /// Server-assigned connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Counters for this connection.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Whether a real transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drop the connection as if the network failed.
    pub fn kill(&mut self) {
        self.closed = true;
        self.tx = None;
    }

    fn ensure_open(&self) -> DriverResult<(), MemoryError> {
        if self.closed {
            return Err(Failure::Disconnect(MemoryError::Closed));
        }
        Ok(())
    }

    /// Report an error, poisoning the open transaction.
    fn fail(&mut self, err: MemoryError) -> Failure<MemoryError> {
        if let Some(tx) = self.tx.as_mut() {
            tx.poisoned = true;
        }
        tracing::trace!(connection_id = self.id, error = %err, "statement failed");
        Failure::Error(err)
    }

    fn ensure_healthy(&mut self) -> DriverResult<(), MemoryError> {
        self.ensure_open()?;
        if self.tx.as_ref().is_some_and(|tx| tx.poisoned) {
            return Err(Failure::Error(MemoryError::Aborted));
        }
        Ok(())
    }

    fn open(&mut self) -> Transition {
        if self.tx.is_some() {
            return Transition::Refused(TxStatus::Transaction);
        }
        let tables = self.server.tables.lock().clone();
        self.tx = Some(Transaction {
            tables,
            written: BTreeSet::new(),
            poisoned: false,
            cursors: BTreeMap::new(),
            next_cursor: 1,
        });
        self.stats.begins += 1;
        Transition::Done
    }

    fn finish(&mut self, commit: bool) -> DriverResult<Transition, MemoryError> {
        let Some(tx) = self.tx.take() else {
            return Ok(Transition::Refused(TxStatus::Idle));
        };

        if !commit {
            self.stats.rollbacks += 1;
            return Ok(Transition::Done);
        }
        if tx.poisoned {
            self.stats.rollbacks += 1;
            return Err(Failure::Error(MemoryError::Aborted));
        }

        let mut committed = self.server.tables.lock();
        for name in &tx.written {
            if let Some(table) = tx.tables.get(name) {
                committed.insert(name.clone(), table.clone());
            }
        }
        self.stats.commits += 1;
        Ok(Transition::Done)
    }

    fn run(&mut self, command: &Command, params: &[Value]) -> Result<QueryResult, MemoryError> {
        match self.tx.as_mut() {
            Some(tx) => {
                let (result, written) = command.apply(&mut tx.tables, params)?;
                if let Some(name) = written {
                    tx.written.insert(name);
                }
                Ok(result)
            }
            None => {
                let mut committed = self.server.tables.lock();
                command.apply(&mut committed, params).map(|(result, _)| result)
            }
        }
    }

    fn cursor_mut(&mut self, cursor: CursorId) -> Result<&mut CursorState, MemoryError> {
        self.tx
            .as_mut()
            .ok_or(MemoryError::NoTransaction)?
            .cursors
            .get_mut(&cursor.0)
            .ok_or(MemoryError::UnknownCursor(cursor.0))
    }
}

impl Driver for MemoryConnection {
    type Query = Statement;
    type Params = Vec<Value>;
    type Cursor = CursorId;
    type Output = QueryResult;
    type Error = MemoryError;

    fn begin(&mut self) -> DriverResult<Transition, MemoryError> {
        self.ensure_open()?;
        if self.server.refuse_begin.load(Ordering::Acquire) {
            return Err(Failure::Error(MemoryError::TransactionsRefused));
        }
        Ok(self.open())
    }

    fn commit(&mut self) -> DriverResult<Transition, MemoryError> {
        self.ensure_open()?;
        self.finish(true)
    }

    fn rollback(&mut self) -> DriverResult<Transition, MemoryError> {
        self.ensure_open()?;
        self.finish(false)
    }

    fn prepare(&mut self, query: &Statement) -> DriverResult<Statement, MemoryError> {
        self.ensure_healthy()?;
        match Command::parse(query.sql()) {
            Ok(_) => Ok(query.clone().into_prepared()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn execute(
        &mut self,
        query: &Statement,
        params: &Vec<Value>,
    ) -> DriverResult<QueryResult, MemoryError> {
        self.ensure_open()?;
        self.stats.statements += 1;

        let command = match Command::parse(query.sql()) {
            Ok(command) => command,
            Err(e) => return Err(self.fail(e)),
        };

        match command {
            Command::Begin => match self.open() {
                Transition::Done => Ok(QueryResult::default()),
                Transition::Refused(_) => Err(self.fail(MemoryError::TransactionInProgress)),
            },
            Command::Commit => match self.finish(true)? {
                Transition::Done => Ok(QueryResult::default()),
                Transition::Refused(_) => Err(Failure::Error(MemoryError::NoTransaction)),
            },
            Command::Rollback => match self.finish(false)? {
                Transition::Done => Ok(QueryResult::default()),
                Transition::Refused(_) => Err(Failure::Error(MemoryError::NoTransaction)),
            },
            command => {
                self.ensure_healthy()?;
                self.run(&command, params).map_err(|e| self.fail(e))
            }
        }
    }

    fn close(&mut self, _query: &Statement) -> DriverResult<QueryResult, MemoryError> {
        self.ensure_open()?;
        Ok(QueryResult::default())
    }

    fn declare(
        &mut self,
        query: &Statement,
        params: &Vec<Value>,
    ) -> DriverResult<CursorId, MemoryError> {
        self.ensure_healthy()?;

        let Some(tx) = self.tx.as_mut() else {
            return Err(Failure::Error(MemoryError::NoTransaction));
        };

        let rows = match Command::parse(query.sql()) {
            Ok(Command::Select { table, by_id }) => select(&tx.tables, &table, by_id, params),
            Ok(_) => Err(MemoryError::NotAQuery),
            Err(e) => Err(e),
        };

        match rows {
            Ok(rows) => {
                let id = tx.next_cursor;
                tx.next_cursor += 1;
                tx.cursors.insert(id, CursorState { rows, position: 0 });
                Ok(CursorId(id))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fetch(
        &mut self,
        _query: &Statement,
        cursor: &CursorId,
    ) -> DriverResult<Fetched<QueryResult>, MemoryError> {
        self.ensure_healthy()?;
        let fetch_size = self.server.fetch_size;

        let state = match self.cursor_mut(*cursor) {
            Ok(state) => state,
            Err(e) => return Err(self.fail(e)),
        };

        let end = (state.position + fetch_size).min(state.rows.len());
        let batch = state.rows[state.position..end].to_vec();
        state.position = end;

        if end < state.rows.len() {
            Ok(Fetched::Continue(QueryResult::rows(batch)))
        } else {
            Ok(Fetched::Halt(QueryResult::rows(batch)))
        }
    }

    fn deallocate(
        &mut self,
        _query: &Statement,
        cursor: &CursorId,
    ) -> DriverResult<QueryResult, MemoryError> {
        self.ensure_healthy()?;

        let removed = self
            .tx
            .as_mut()
            .and_then(|tx| tx.cursors.remove(&cursor.0));
        match removed {
            Some(_) => Ok(QueryResult::default()),
            None => Err(self.fail(MemoryError::UnknownCursor(cursor.0))),
        }
    }

    fn status(&mut self) -> DriverResult<TxStatus, MemoryError> {
        self.ensure_open()?;
        Ok(match &self.tx {
            None => TxStatus::Idle,
            Some(tx) if tx.poisoned => TxStatus::Error,
            Some(_) => TxStatus::Transaction,
        })
    }

    fn checkout(&mut self) -> DriverResult<(), MemoryError> {
        self.ensure_open()?;
        self.stats.checkouts += 1;
        Ok(())
    }

    fn checkin(&mut self) -> DriverResult<(), MemoryError> {
        self.ensure_open()?;
        self.stats.checkins += 1;
        Ok(())
    }

    fn ping(&mut self) -> DriverResult<(), MemoryError> {
        self.ensure_open()
    }

    fn disconnect(&mut self) {
        tracing::trace!(connection_id = self.id, "memory connection closed");
        self.kill();
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.tx.is_some())
            .field("closed", &self.closed)
            .field("stats", &self.stats)
            .finish()
    }
}
