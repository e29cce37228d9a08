//! # replay-testing
//!
//! An in-memory transactional store that behaves like a distributed SQL
//! database without savepoints:
//!
//! - nested `BEGIN` is refused;
//! - any error inside a transaction poisons it until rollback;
//! - statements outside a transaction autocommit.
//!
//! Statements are a small command language over `id`/`value` tables:
//!
//! ```text
//! CREATE TABLE posts
//! INSERT INTO posts VALUES ($1, $2)
//! UPDATE posts SET value = $2 WHERE id = $1
//! DELETE FROM posts WHERE id = $1
//! SELECT * FROM posts [WHERE id = $1]
//! BEGIN | COMMIT | ROLLBACK
//! ```
//!
//! Raw `BEGIN`/`COMMIT`/`ROLLBACK` statements end the real transaction
//! directly, which is how tests model code that bypasses the sandbox.
//!
//! ## Example
//!
//! ```rust,ignore
//! use replay_testing::{MemoryServer, Statement, params};
//!
//! let server = MemoryServer::new();
//! server.create_table("posts");
//!
//! let mut conn = server.connect()?;
//! conn.execute(&Statement::new("INSERT INTO posts VALUES ($1, $2)"), &params(1, "hello"))?;
//! assert_eq!(server.rows("posts").len(), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod server;
pub mod statement;
pub mod value;

pub use connection::{ConnectionStats, CursorId, MemoryConnection};
pub use error::MemoryError;
pub use server::{MemoryConnector, MemoryServer};
pub use statement::Statement;
pub use value::{QueryResult, Row, Value, params};
