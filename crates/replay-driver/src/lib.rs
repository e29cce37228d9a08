//! # replay-driver
//!
//! The capability interface every database driver exposes to the replay
//! sandbox and to the ownership pool.
//!
//! A driver owns its connection state and mutates it in place on every call.
//! Each operation reports a tagged outcome: success-like values in the `Ok`
//! arm (with [`Fetched::Continue`] / [`Fetched::Halt`] for cursor fetches),
//! and failure-like values as a [`Failure`], which distinguishes an ordinary
//! error from one that requires discarding the connection.
//!
//! ## Example
//!
//! ```rust,ignore
//! use replay_driver::{Driver, Transition};
//!
//! fn insert<D: Driver>(conn: &mut D, query: &D::Query, params: &D::Params) {
//!     match conn.begin() {
//!         Ok(Transition::Done) => {}
//!         Ok(Transition::Refused(status)) => panic!("already {status}"),
//!         Err(failure) => panic!("{failure}"),
//!     }
//!     let _ = conn.execute(query, params);
//!     let _ = conn.commit();
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod driver;
pub mod outcome;

pub use driver::{Connector, Driver, DriverResult};
pub use outcome::{Failure, Fetched, Transition, TxStatus};
