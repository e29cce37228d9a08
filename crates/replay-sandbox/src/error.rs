//! Sandbox error types.

use replay_driver::TxStatus;
use thiserror::Error;

use crate::log::EntryKind;

/// Errors reported by a sandboxed connection.
///
/// `E` is the wrapped driver's error type.
#[derive(Debug, Error)]
pub enum SandboxError<E: std::error::Error + 'static> {
    /// The wrapped driver failed; the error is reported unchanged.
    #[error(transparent)]
    Driver(E),

    /// Restarting the outer transaction failed.
    #[error("failed to {operation} the outer transaction during recovery: {source}")]
    Reconstruction {
        /// The step that failed (`roll back` or `begin`).
        operation: &'static str,
        /// The driver error.
        #[source]
        source: E,
    },

    /// Replaying a durable log entry failed. The checkout cannot be recovered.
    #[error("replay of durable log entry {index} ({kind}) failed: {source}")]
    Replay {
        /// Position of the entry in the durable log.
        index: usize,
        /// Kind of the entry.
        kind: EntryKind,
        /// The driver error.
        #[source]
        source: E,
    },

    /// An earlier replay failed part way; the outer transaction holds an
    /// unknown prefix of the durable log and the checkout cannot continue.
    #[error("connection unusable: replay of durable log entry {index} ({kind}) failed earlier")]
    Unusable {
        /// Position of the entry whose replay failed.
        index: usize,
        /// Kind of that entry.
        kind: EntryKind,
    },

    /// The outer transaction was ended by code that bypassed the sandbox.
    #[error(
        "cannot {operation}: the sandbox transaction is no longer active. \
         Do not commit or roll back the outer transaction manually; \
         open and close transactions through the sandboxed connection instead"
    )]
    ManualTransaction {
        /// The operation that found the outer transaction inactive.
        operation: &'static str,
    },

    /// The driver refused to open the outer transaction.
    #[error("could not open the outer transaction: connection is already in {status} state")]
    BeginRefused {
        /// Status reported by the driver.
        status: TxStatus,
    },
}

impl<E: std::error::Error + 'static> SandboxError<E> {
    /// The wrapped driver error, if this error carries one.
    #[must_use]
    pub fn driver_error(&self) -> Option<&E> {
        match self {
            Self::Driver(e)
            | Self::Reconstruction { source: e, .. }
            | Self::Replay { source: e, .. } => Some(e),
            Self::Unusable { .. } | Self::ManualTransaction { .. } | Self::BeginRefused { .. } => {
                None
            }
        }
    }

    /// Whether the error was raised while recovering rather than by the
    /// operation the caller requested.
    #[must_use]
    pub fn is_recovery_failure(&self) -> bool {
        matches!(
            self,
            Self::Reconstruction { .. }
                | Self::Replay { .. }
                | Self::Unusable { .. }
                | Self::BeginRefused { .. }
        )
    }
}
