//! # replay-pool
//!
//! Ownership pool for test connections.
//!
//! Each connection is owned by exactly one logical owner at a time. Owners
//! check a connection out, may allow other owners to use it, and check it
//! back in. Hooks run when a connection changes hands, which is where the
//! sandbox opens and discards its outer transaction.
//!
//! ## Modes
//!
//! - [`Mode::Manual`]: every owner must check out explicitly.
//! - [`Mode::Auto`]: using the pool without a checkout checks one out.
//! - [`Mode::Shared`]: every caller uses the named owner's connection.
//!
//! ## Example
//!
//! ```rust,ignore
//! use replay_pool::{OwnerId, PoolBuilder};
//! use replay_sandbox::Sandbox;
//!
//! let pool = PoolBuilder::new()
//!     .max_connections(4)
//!     .build(connector, Sandbox)?;
//!
//! let owner = OwnerId::current();
//! pool.checkout(owner)?;
//! pool.with_connection(owner, |conn| conn.execute(&query, &params))??;
//! pool.checkin(owner)?;
//!
//! // Check pool status
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod owner;
pub mod pool;

// Configuration
pub use config::{Mode, PoolConfig};

// Error types
pub use error::PoolError;

// Pool types
pub use pool::{CheckoutStatus, Pool, PoolBuilder, PoolMetrics, PoolStatus};

// Ownership
pub use owner::OwnerId;

// Lifecycle management
pub use lifecycle::{ConnectionLifecycle, ConnectionMetadata, Passthrough, Rejected};
