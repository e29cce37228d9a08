//! Owner identities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: OwnerId = OwnerId::next();
}

/// Identifies a logical owner of a connection.
///
/// Owners are usually threads; [`OwnerId::current`] returns an id that is
/// stable for the calling thread. Ids can also be minted with
/// [`OwnerId::next`] for owners that are not threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    /// The id of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|id| *id)
    }

    /// Mint a fresh id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}
