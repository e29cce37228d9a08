//! Connection lifecycle hooks.

use std::convert::Infallible;
use std::fmt;
use std::time::{Duration, Instant};

use crate::owner::OwnerId;

/// A connection handed back by a hook that refused it.
///
/// The pool disconnects `connection` and reports `error` to the caller.
pub struct Rejected<D, E> {
    /// The raw connection.
    pub connection: D,
    /// Why the hook refused it.
    pub error: E,
}

impl<D, E> Rejected<D, E> {
    /// Pair a connection with the reason it was refused.
    pub fn new(connection: D, error: E) -> Self {
        Self { connection, error }
    }
}

impl<D, E: fmt::Debug> fmt::Debug for Rejected<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<D, E: fmt::Display> fmt::Display for Rejected<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl<D, E> std::error::Error for Rejected<D, E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Hooks run when a connection changes hands.
///
/// `on_checkout` turns a raw connection into the value owners work with;
/// `on_checkin` turns it back. A hook that fails hands the raw connection
/// back in a [`Rejected`] so the pool can disconnect it.
pub trait ConnectionLifecycle<D>: Send + Sync {
    /// What owners receive.
    type Wrapped;
    /// Hook failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run after a connection is granted to an owner.
    fn on_checkout(&self, connection: D) -> Result<Self::Wrapped, Rejected<D, Self::Error>>;

    /// Run before a connection is returned to the idle set.
    fn on_checkin(&self, wrapped: Self::Wrapped) -> Result<D, Rejected<D, Self::Error>>;
}

/// Hands connections out unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl<D> ConnectionLifecycle<D> for Passthrough {
    type Wrapped = D;
    type Error = Infallible;

    fn on_checkout(&self, connection: D) -> Result<D, Rejected<D, Infallible>> {
        Ok(connection)
    }

    fn on_checkin(&self, wrapped: D) -> Result<D, Rejected<D, Infallible>> {
        Ok(wrapped)
    }
}

/// Bookkeeping for a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Pool-unique connection id.
    pub id: u64,
    /// When the connection was opened.
    pub created_at: Instant,
    /// How many times it has been checked out.
    pub checkouts: u64,
    /// Current owner, if checked out.
    pub owner: Option<OwnerId>,
    /// When the current checkout started.
    pub checked_out_at: Option<Instant>,
}

impl ConnectionMetadata {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            checkouts: 0,
            owner: None,
            checked_out_at: None,
        }
    }

    pub(crate) fn granted(&mut self, owner: OwnerId) {
        self.checkouts += 1;
        self.owner = Some(owner);
        self.checked_out_at = Some(Instant::now());
    }

    pub(crate) fn released(&mut self) {
        self.owner = None;
        self.checked_out_at = None;
    }

    /// How long the current checkout has been held.
    #[must_use]
    pub fn held_for(&self) -> Option<Duration> {
        self.checked_out_at.map(|at| at.elapsed())
    }

    /// Age of the connection.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
