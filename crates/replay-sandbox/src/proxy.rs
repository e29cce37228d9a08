//! The sandboxed connection.
//!
//! [`SandboxConnection`] wraps a driver that is inside the outer real
//! transaction and implements [`Driver`] itself, so callers run ordinary
//! begin/commit/rollback/execute calls against it as if savepoints existed.

use std::fmt;

use replay_driver::{Driver, DriverResult, Failure, Fetched, Transition, TxStatus};

use crate::error::SandboxError;
use crate::log::{DriverEntry, DriverLog, EntryKind, LogEntry, ReplayLog};

/// Result type for sandboxed operations.
pub type SandboxResult<T, E> = DriverResult<T, SandboxError<E>>;

/// Recovery counters for a sandboxed connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxStats {
    /// Times the outer transaction was rolled back and reopened.
    pub restarts: u64,
    /// Replay passes over the durable log.
    pub replays: u64,
    /// Durable log entries re-issued across all replay passes.
    pub entries_replayed: u64,
}

/// A connection inside the outer real transaction, with pseudo-transactions
/// emulated by logging and replay.
///
/// Created by [`post_checkout`](crate::lifecycle::post_checkout) and consumed
/// by [`pre_checkin`](crate::lifecycle::pre_checkin). A sandboxed connection
/// has exactly one owner at a time and performs no locking of its own.
pub struct SandboxConnection<D: Driver> {
    driver: D,
    in_transaction: bool,
    /// Cleared between a successful outer rollback and the matching begin.
    outer_open: bool,
    /// Set once a replay fails; the checkout is over.
    broken: Option<(usize, EntryKind)>,
    log: DriverLog<D>,
    stats: SandboxStats,
}

impl<D: Driver> SandboxConnection<D> {
    /// Wrap a driver whose outer transaction is already open.
    pub(crate) fn new(driver: D) -> Self {
        Self {
            driver,
            in_transaction: false,
            outer_open: true,
            broken: None,
            log: ReplayLog::new(),
            stats: SandboxStats::default(),
        }
    }

    /// Whether a pseudo-transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// The replay log.
    #[must_use]
    pub fn replay_log(&self) -> &DriverLog<D> {
        &self.log
    }

    /// Recovery counters.
    #[must_use]
    pub fn stats(&self) -> SandboxStats {
        self.stats
    }

    /// Borrow the wrapped driver.
    #[must_use]
    pub fn get_ref(&self) -> &D {
        &self.driver
    }

    /// Mutably borrow the wrapped driver.
    ///
    /// Calls made through this reference bypass the sandbox and are neither
    /// logged nor replayed.
    pub fn get_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Whether a failed replay has made the checkout unusable.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    pub(crate) fn outer_open(&self) -> bool {
        self.outer_open
    }

    pub(crate) fn into_driver(self) -> D {
        self.driver
    }

    fn ensure_usable(&self) -> SandboxResult<(), D::Error> {
        if let Some((index, kind)) = self.broken {
            return Err(Failure::Disconnect(SandboxError::Unusable { index, kind }));
        }
        Ok(())
    }

    /// Roll back and reopen the outer transaction.
    ///
    /// The durable log must be replayed afterwards. Replay is requested as
    /// soon as the rollback succeeds, so a failed begin is retried by the
    /// next dispatched operation.
    fn restart(&mut self) -> SandboxResult<(), D::Error> {
        self.stats.restarts += 1;
        tracing::debug!(
            durable = self.log.durable().len(),
            "restarting outer transaction"
        );

        match self.driver.rollback() {
            Ok(Transition::Done) => {}
            Ok(Transition::Refused(status)) => {
                tracing::warn!(%status, "outer transaction already ended");
                return Err(Failure::Error(SandboxError::ManualTransaction {
                    operation: "rollback",
                }));
            }
            Err(failure) => {
                tracing::warn!(error = %failure, "outer transaction rollback failed");
                return Err(failure.map(|source| SandboxError::Reconstruction {
                    operation: "roll back",
                    source,
                }));
            }
        }

        self.outer_open = false;
        self.log.request_replay();
        self.open_outer()
    }

    fn open_outer(&mut self) -> SandboxResult<(), D::Error> {
        match self.driver.begin() {
            Ok(Transition::Done) => {
                self.outer_open = true;
                Ok(())
            }
            Ok(Transition::Refused(status)) => {
                Err(Failure::Disconnect(SandboxError::BeginRefused { status }))
            }
            Err(failure) => {
                tracing::warn!(error = %failure, "outer transaction begin failed");
                Err(failure.map(|source| SandboxError::Reconstruction {
                    operation: "begin",
                    source,
                }))
            }
        }
    }

    /// Re-issue the durable log if the outer transaction was restarted,
    /// reopening it first if the restart stopped after the rollback.
    fn replay_if_needed(&mut self) -> SandboxResult<(), D::Error> {
        self.ensure_usable()?;
        if !self.log.replay_pending() {
            return Ok(());
        }

        if !self.outer_open {
            tracing::debug!("reopening outer transaction before replay");
            self.open_outer()?;
        }

        self.stats.replays += 1;
        tracing::debug!(entries = self.log.durable().len(), "replaying durable log");

        for (index, entry) in self.log.durable().iter().enumerate() {
            if let Err(failure) = apply(&mut self.driver, entry) {
                tracing::warn!(
                    index,
                    kind = %entry.kind(),
                    error = %failure,
                    "replay failed"
                );
                self.broken = Some((index, entry.kind()));
                return Err(Failure::Disconnect(SandboxError::Replay {
                    index,
                    kind: entry.kind(),
                    source: failure.into_inner(),
                }));
            }
            self.stats.entries_replayed += 1;
        }

        self.log.finish_replay();
        Ok(())
    }

    /// Run an operation against the driver, replaying first if needed and
    /// logging it on success.
    fn dispatch<T>(
        &mut self,
        op: impl FnOnce(&mut D) -> DriverResult<T, D::Error>,
        entry: impl FnOnce() -> Option<DriverEntry<D>>,
    ) -> SandboxResult<T, D::Error> {
        self.replay_if_needed()?;

        match op(&mut self.driver) {
            Ok(value) => {
                if let Some(entry) = entry() {
                    tracing::trace!(
                        kind = %entry.kind(),
                        in_transaction = self.in_transaction,
                        "logged"
                    );
                    self.log.record(entry, self.in_transaction);
                }
                Ok(value)
            }
            Err(failure) => {
                self.recover_from(&failure)?;
                Err(failure.map(SandboxError::Driver))
            }
        }
    }

    fn recover_from(&mut self, failure: &Failure<D::Error>) -> SandboxResult<(), D::Error> {
        if self.in_transaction {
            if self.log.flag_error() {
                tracing::debug!(error = %failure, "statement failed inside pseudo-transaction");
            }
            return Ok(());
        }

        tracing::debug!(error = %failure, "statement failed outside pseudo-transaction");
        self.restart()
    }
}

fn apply<D: Driver>(driver: &mut D, entry: &DriverEntry<D>) -> DriverResult<(), D::Error> {
    match entry {
        LogEntry::Execute { query, params } => driver.execute(query, params).map(drop),
        LogEntry::Close { query } => driver.close(query).map(drop),
        LogEntry::Declare { query, params } => driver.declare(query, params).map(drop),
        LogEntry::Fetch { query, cursor } => driver.fetch(query, cursor).map(drop),
        LogEntry::Deallocate { query, cursor } => driver.deallocate(query, cursor).map(drop),
    }
}

impl<D: Driver> Driver for SandboxConnection<D> {
    type Query = D::Query;
    type Params = D::Params;
    type Cursor = D::Cursor;
    type Output = D::Output;
    type Error = SandboxError<D::Error>;

    fn begin(&mut self) -> SandboxResult<Transition, D::Error> {
        self.ensure_usable()?;
        if self.in_transaction {
            return Ok(Transition::Refused(TxStatus::Transaction));
        }

        self.in_transaction = true;
        self.log.discard_pending();
        tracing::debug!("pseudo-transaction opened");
        Ok(Transition::Done)
    }

    fn commit(&mut self) -> SandboxResult<Transition, D::Error> {
        self.ensure_usable()?;
        if !self.in_transaction {
            return Ok(Transition::Refused(TxStatus::Idle));
        }

        self.in_transaction = false;

        if self.log.error_pending() {
            // The failure is not reported here; the commit succeeds once the
            // pre-transaction state is reconstructed.
            self.log.clear_error();
            self.log.discard_pending();
            tracing::debug!("commit after failed statement, discarding pseudo-transaction");
            self.restart()?;
        } else {
            let folded = self.log.fold_pending();
            tracing::debug!(folded, "pseudo-transaction committed");
        }

        Ok(Transition::Done)
    }

    fn rollback(&mut self) -> SandboxResult<Transition, D::Error> {
        self.ensure_usable()?;
        if !self.in_transaction {
            return Ok(Transition::Refused(TxStatus::Idle));
        }

        self.in_transaction = false;
        self.log.clear_error();
        self.log.discard_pending();
        tracing::debug!("pseudo-transaction rolled back");

        self.restart()?;
        Ok(Transition::Done)
    }

    fn prepare(&mut self, query: &D::Query) -> SandboxResult<D::Query, D::Error> {
        self.dispatch(|d| d.prepare(query), || None)
    }

    fn execute(
        &mut self,
        query: &D::Query,
        params: &D::Params,
    ) -> SandboxResult<D::Output, D::Error> {
        self.dispatch(
            |d| d.execute(query, params),
            || {
                Some(LogEntry::Execute {
                    query: query.clone(),
                    params: params.clone(),
                })
            },
        )
    }

    fn close(&mut self, query: &D::Query) -> SandboxResult<D::Output, D::Error> {
        self.dispatch(
            |d| d.close(query),
            || {
                Some(LogEntry::Close {
                    query: query.clone(),
                })
            },
        )
    }

    fn declare(
        &mut self,
        query: &D::Query,
        params: &D::Params,
    ) -> SandboxResult<D::Cursor, D::Error> {
        self.dispatch(
            |d| d.declare(query, params),
            || {
                Some(LogEntry::Declare {
                    query: query.clone(),
                    params: params.clone(),
                })
            },
        )
    }

    fn fetch(
        &mut self,
        query: &D::Query,
        cursor: &D::Cursor,
    ) -> SandboxResult<Fetched<D::Output>, D::Error> {
        self.dispatch(
            |d| d.fetch(query, cursor),
            || {
                Some(LogEntry::Fetch {
                    query: query.clone(),
                    cursor: cursor.clone(),
                })
            },
        )
    }

    fn deallocate(
        &mut self,
        query: &D::Query,
        cursor: &D::Cursor,
    ) -> SandboxResult<D::Output, D::Error> {
        self.dispatch(
            |d| d.deallocate(query, cursor),
            || {
                Some(LogEntry::Deallocate {
                    query: query.clone(),
                    cursor: cursor.clone(),
                })
            },
        )
    }

    /// Reports the pseudo-transaction status; the outer transaction is
    /// never visible.
    fn status(&mut self) -> SandboxResult<TxStatus, D::Error> {
        let status = self.dispatch(|d| d.status(), || None)?;
        Ok(match status {
            TxStatus::Transaction if !self.in_transaction => TxStatus::Idle,
            TxStatus::Transaction if self.log.error_pending() => TxStatus::Error,
            other => other,
        })
    }

    fn checkout(&mut self) -> SandboxResult<(), D::Error> {
        self.dispatch(|d| d.checkout(), || None)
    }

    fn checkin(&mut self) -> SandboxResult<(), D::Error> {
        self.dispatch(|d| d.checkin(), || None)
    }

    fn ping(&mut self) -> SandboxResult<(), D::Error> {
        self.dispatch(|d| d.ping(), || None)
    }

    fn disconnect(&mut self) {
        self.driver.disconnect();
    }
}

impl<D: Driver> fmt::Debug for SandboxConnection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxConnection")
            .field("in_transaction", &self.in_transaction)
            .field("durable", &self.log.durable().len())
            .field("pending", &self.log.pending().len())
            .field("marker", &self.log.marker())
            .field("outer_open", &self.outer_open)
            .field("broken", &self.broken.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}
