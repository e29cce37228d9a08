//! Checkout and checkin hooks.
//!
//! [`post_checkout`] opens the outer real transaction and wraps the driver;
//! [`pre_checkin`] rolls that transaction back, discarding everything the
//! owner did, and hands the raw driver back. [`Sandbox`] plugs both into an
//! ownership pool.

use replay_driver::{Driver, Failure, Transition};
use replay_pool::{ConnectionLifecycle, Rejected};

use crate::error::SandboxError;
use crate::proxy::SandboxConnection;

/// Error returned by the hooks, carrying the raw driver back to the pool.
pub type HookError<D> = Rejected<D, Failure<SandboxError<<D as Driver>::Error>>>;

/// Open the outer transaction and wrap `driver` in a fresh sandbox.
///
/// A failure to begin is reported as a disconnect so the pool discards the
/// connection.
pub fn post_checkout<D: Driver>(mut driver: D) -> Result<SandboxConnection<D>, HookError<D>> {
    match driver.begin() {
        Ok(Transition::Done) => {
            tracing::debug!("sandbox transaction opened");
            Ok(SandboxConnection::new(driver))
        }
        Ok(Transition::Refused(status)) => {
            tracing::warn!(%status, "could not open sandbox transaction");
            Err(Rejected::new(
                driver,
                Failure::Disconnect(SandboxError::BeginRefused { status }),
            ))
        }
        Err(failure) => {
            tracing::warn!(error = %failure, "could not open sandbox transaction");
            Err(Rejected::new(
                driver,
                Failure::Disconnect(SandboxError::Driver(failure.into_inner())),
            ))
        }
    }
}

/// Roll the outer transaction back and return the raw driver.
///
/// Every change made during the checkout is discarded, including committed
/// pseudo-transactions. If the outer transaction was already ended by code
/// that bypassed the sandbox, a configuration error is returned. If a
/// restart rolled the outer transaction back but could not reopen it, there
/// is nothing left to discard and the driver is returned as is.
pub fn pre_checkin<D: Driver>(conn: SandboxConnection<D>) -> Result<D, HookError<D>> {
    let stats = conn.stats();
    let outer_open = conn.outer_open();
    let mut driver = conn.into_driver();

    if !outer_open {
        tracing::debug!(restarts = stats.restarts, "sandbox transaction already rolled back");
        return Ok(driver);
    }

    match driver.rollback() {
        Ok(Transition::Done) => {
            tracing::debug!(
                restarts = stats.restarts,
                replays = stats.replays,
                "sandbox transaction discarded"
            );
            Ok(driver)
        }
        Ok(Transition::Refused(_)) => Err(Rejected::new(
            driver,
            Failure::Error(SandboxError::ManualTransaction {
                operation: "checkin",
            }),
        )),
        Err(failure) => Err(Rejected::new(driver, failure.map(SandboxError::Driver))),
    }
}

/// Sandbox hooks for an ownership pool.
///
/// ```rust,ignore
/// let pool = PoolBuilder::new().build(connector, Sandbox)?;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Sandbox;

impl<D: Driver> ConnectionLifecycle<D> for Sandbox {
    type Wrapped = SandboxConnection<D>;
    type Error = Failure<SandboxError<D::Error>>;

    fn on_checkout(&self, connection: D) -> Result<SandboxConnection<D>, HookError<D>> {
        post_checkout(connection)
    }

    fn on_checkin(&self, wrapped: SandboxConnection<D>) -> Result<D, HookError<D>> {
        pre_checkin(wrapped)
    }
}
