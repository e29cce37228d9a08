//! The shared in-memory server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use replay_driver::Connector;

use crate::connection::MemoryConnection;
use crate::error::MemoryError;
use crate::statement::Tables;
use crate::value::Row;

const DEFAULT_FETCH_SIZE: usize = 100;

/// Committed state shared by every connection.
///
/// Cloning a server yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

#[derive(Debug)]
pub(crate) struct ServerInner {
    pub(crate) tables: Mutex<Tables>,
    pub(crate) fetch_size: usize,
    next_connection_id: AtomicU64,
    refuse: AtomicBool,
    pub(crate) refuse_begin: AtomicBool,
}

impl MemoryServer {
    /// Create an empty server.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fetch_size(DEFAULT_FETCH_SIZE)
    }

    /// Create an empty server whose cursors return `fetch_size` rows per fetch.
    #[must_use]
    pub fn with_fetch_size(fetch_size: usize) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                tables: Mutex::new(Tables::new()),
                fetch_size: fetch_size.max(1),
                next_connection_id: AtomicU64::new(1),
                refuse: AtomicBool::new(false),
                refuse_begin: AtomicBool::new(false),
            }),
        }
    }

    /// Open a connection.
    pub fn connect(&self) -> Result<MemoryConnection, MemoryError> {
        if self.inner.refuse.load(Ordering::Acquire) {
            return Err(MemoryError::Refused);
        }
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(connection_id = id, "memory connection opened");
        Ok(MemoryConnection::new(Arc::clone(&self.inner), id))
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::Release);
    }

    /// Refuse (or accept again) `begin` on every connection.
    ///
    /// A refused begin is an ordinary error; the connection stays usable.
    pub fn refuse_transactions(&self, refuse: bool) {
        self.inner.refuse_begin.store(refuse, Ordering::Release);
    }

    /// Create a committed, empty table. Existing tables are left alone.
    pub fn create_table(&self, name: &str) {
        self.inner
            .tables
            .lock()
            .entry(name.to_lowercase())
            .or_default();
    }

    /// Committed rows of `table`, ordered by id. Empty if the table is missing.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .tables
            .lock()
            .get(&table.to_lowercase())
            .map(|rows| {
                rows.iter()
                    .map(|(id, value)| Row::new(*id, value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of committed tables.
    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        self.inner.tables.lock().keys().cloned().collect()
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens connections to a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl MemoryConnector {
    /// Connect to `server`.
    #[must_use]
    pub fn new(server: MemoryServer) -> Self {
        Self { server }
    }

    /// The server connections are opened against.
    #[must_use]
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection, MemoryError> {
        self.server.connect()
    }
}
