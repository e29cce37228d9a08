//! The driver capability trait.

use std::fmt::Debug;

use crate::outcome::{Failure, Fetched, Transition, TxStatus};

/// Result type returned by every driver operation.
pub type DriverResult<T, E> = Result<T, Failure<E>>;

/// A database connection driven through a fixed set of operations.
///
/// Implementations own their connection state; every call takes `&mut self`
/// and leaves the connection in its updated state, whatever the outcome.
/// Operations are synchronous and block for the duration of the underlying
/// I/O.
///
/// Wrappers implement this trait too, so a wrapped connection can be used
/// anywhere a raw one is expected.
pub trait Driver {
    /// A statement, prepared or not.
    type Query: Clone + Debug;
    /// Parameters bound to a statement.
    type Params: Clone + Debug;
    /// A server-side cursor handle.
    type Cursor: Clone + Debug;
    /// The result of a statement or cursor operation.
    type Output: Clone + Debug;
    /// The driver's error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a transaction.
    fn begin(&mut self) -> DriverResult<Transition, Self::Error>;

    /// Commit the open transaction.
    fn commit(&mut self) -> DriverResult<Transition, Self::Error>;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> DriverResult<Transition, Self::Error>;

    /// Prepare a statement for later execution.
    fn prepare(&mut self, query: &Self::Query) -> DriverResult<Self::Query, Self::Error>;

    /// Execute a statement with bound parameters.
    fn execute(
        &mut self,
        query: &Self::Query,
        params: &Self::Params,
    ) -> DriverResult<Self::Output, Self::Error>;

    /// Close a prepared statement.
    fn close(&mut self, query: &Self::Query) -> DriverResult<Self::Output, Self::Error>;

    /// Declare a cursor over a statement.
    fn declare(
        &mut self,
        query: &Self::Query,
        params: &Self::Params,
    ) -> DriverResult<Self::Cursor, Self::Error>;

    /// Fetch the next batch from a cursor.
    fn fetch(
        &mut self,
        query: &Self::Query,
        cursor: &Self::Cursor,
    ) -> DriverResult<Fetched<Self::Output>, Self::Error>;

    /// Release a cursor.
    fn deallocate(
        &mut self,
        query: &Self::Query,
        cursor: &Self::Cursor,
    ) -> DriverResult<Self::Output, Self::Error>;

    /// Report the transaction status of the connection.
    fn status(&mut self) -> DriverResult<TxStatus, Self::Error>;

    /// Called when the connection is handed to an owner.
    fn checkout(&mut self) -> DriverResult<(), Self::Error>;

    /// Called when the connection is given back by its owner.
    fn checkin(&mut self) -> DriverResult<(), Self::Error>;

    /// Check that the connection is alive.
    fn ping(&mut self) -> DriverResult<(), Self::Error>;

    /// Tear the connection down. The connection must not be used afterwards.
    fn disconnect(&mut self);
}

/// Opens new raw connections.
pub trait Connector {
    /// The connection type produced.
    type Connection: Driver;

    /// Open a new connection.
    fn connect(&self) -> Result<Self::Connection, <Self::Connection as Driver>::Error>;
}
