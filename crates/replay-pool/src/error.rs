//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::owner::OwnerId;

/// Boxed error reported by a connector or lifecycle hook.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while checking connections in and out.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// No connection became free within the checkout timeout.
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    /// The caller has no connection and is not allowed one.
    #[error(
        "cannot find ownership for {0}: check out a connection, \
         be allowed one, or run the pool in auto or shared mode"
    )]
    NotOwner(OwnerId),

    /// Shared mode requires the named owner to hold a checkout.
    #[error("cannot share the connection of {0}: it has no checkout")]
    NothingToShare(OwnerId),

    /// The owner's checkout exceeded the ownership timeout and was reclaimed.
    #[error("ownership of {owner} expired after {elapsed:?}")]
    OwnershipExpired {
        /// The former owner.
        owner: OwnerId,
        /// How long the checkout was held.
        elapsed: Duration,
    },

    /// Opening a new connection failed.
    #[error("connect failed: {0}")]
    Connect(#[source] BoxError),

    /// A checkout or checkin hook rejected the connection; it was discarded.
    #[error("{phase} hook rejected the connection: {source}")]
    Lifecycle {
        /// `checkout` or `checkin`.
        phase: &'static str,
        /// The hook's error.
        #[source]
        source: BoxError,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Whether retrying the checkout may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_))
    }
}
