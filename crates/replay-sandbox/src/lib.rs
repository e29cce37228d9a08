//! # replay-sandbox
//!
//! Test isolation for databases without savepoints.
//!
//! A sandboxed connection opens a single real transaction when it is checked
//! out and rolls it back when it is checked in, so nothing a test does
//! survives the test. Transactions the code under test opens are
//! pseudo-transactions: no real nested transaction exists, the statements
//! they run are kept in a replay log instead.
//!
//! When a pseudo-transaction must be undone (an explicit rollback, a commit
//! after a failed statement, or any failure outside a pseudo-transaction), the
//! real transaction is discarded, a fresh one is opened, and the statements
//! known to be durable are replayed before the next operation runs.
//!
//! ## Example
//!
//! ```rust,ignore
//! use replay_driver::Driver;
//! use replay_sandbox::lifecycle;
//!
//! let mut conn = lifecycle::post_checkout(raw)?;
//!
//! conn.execute(&insert_a, &params)?;
//!
//! conn.begin()?;
//! conn.execute(&update_a, &params)?;
//! conn.rollback()?;           // outer transaction restarted, insert_a replayed lazily
//!
//! let raw = lifecycle::pre_checkin(conn)?; // everything discarded
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod lifecycle;
pub mod log;
pub mod proxy;

pub use error::SandboxError;
pub use lifecycle::{HookError, Sandbox, post_checkout, pre_checkin};
pub use log::{DriverEntry, DriverLog, EntryKind, LogEntry, Marker, ReplayLog};
pub use proxy::{SandboxConnection, SandboxStats};
