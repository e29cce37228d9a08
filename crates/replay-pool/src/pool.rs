//! Ownership pool implementation.
//!
//! Connections are granted to one owner at a time. Lifecycle hooks run on
//! every grant and every return, and access to a granted connection is
//! serialized so it never has more than one writer.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use replay_driver::{Connector, Driver};

use crate::config::{Mode, PoolConfig};
use crate::error::PoolError;
use crate::lifecycle::{ConnectionLifecycle, ConnectionMetadata};
use crate::owner::OwnerId;

/// An ownership pool.
///
/// The pool opens connections through a [`Connector`] on demand, up to
/// `max_connections`, and runs the lifecycle hooks `L` whenever a connection
/// is checked out or in.
///
/// # Example
///
/// ```rust,ignore
/// use replay_pool::{OwnerId, Pool, PoolConfig};
///
/// let pool = Pool::new(PoolConfig::new().max_connections(2), connector, Sandbox)?;
///
/// let owner = OwnerId::current();
/// pool.checkout(owner)?;
/// let rows = pool.with_connection(owner, |conn| conn.execute(&select, &params))?;
/// pool.checkin(owner)?;
/// ```
pub struct Pool<C, L>
where
    C: Connector,
    L: ConnectionLifecycle<C::Connection>,
{
    config: PoolConfig,
    inner: Arc<PoolInner<C, L>>,
}

struct PoolInner<C, L>
where
    C: Connector,
    L: ConnectionLifecycle<C::Connection>,
{
    /// Pool configuration.
    config: PoolConfig,

    /// Opens raw connections.
    connector: C,

    /// Checkout and checkin hooks.
    lifecycle: L,

    /// Whether the pool is closed.
    closed: AtomicBool,

    /// Counter for generating connection IDs.
    next_connection_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Idle connections, checkouts and allowances.
    state: Mutex<PoolState<C::Connection, L::Wrapped>>,

    /// Signalled when a connection slot frees up.
    available: Condvar,

    /// Pool metrics.
    metrics: Mutex<PoolMetricsInner>,
}

struct PoolState<D, W> {
    idle: Vec<Idle<D>>,
    leases: HashMap<OwnerId, Arc<Lease<W>>>,
    /// Allowed owner -> owner holding the checkout.
    allowances: HashMap<OwnerId, OwnerId>,
    mode: Mode,
    /// Open connections, idle or leased.
    total: u32,
}

struct Idle<D> {
    metadata: ConnectionMetadata,
    connection: D,
}

/// A granted checkout.
struct Lease<W> {
    owner: OwnerId,
    metadata: ConnectionMetadata,
    /// `None` once the lease has been returned or reclaimed.
    connection: Mutex<Option<W>>,
}

impl<W> Lease<W> {
    fn expired(&self, limit: Duration) -> Option<Duration> {
        self.metadata.held_for().filter(|held| *held > limit)
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Total connections created.
    connections_created: u64,
    /// Total connections closed.
    connections_closed: u64,
    /// Total successful checkouts.
    checkouts_successful: u64,
    /// Total failed checkouts (timeouts, errors).
    checkouts_failed: u64,
    /// Total successful checkins.
    checkins_successful: u64,
    /// Total checkins whose hook rejected the connection.
    checkins_failed: u64,
    /// Total checkouts reclaimed after the ownership timeout.
    reclaims: u64,
}

/// Outcome of [`Pool::checkout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutStatus {
    /// A connection was granted.
    Granted,
    /// The owner already holds a connection.
    AlreadyOwner,
    /// The owner is allowed another owner's connection.
    AlreadyAllowed,
}

enum Slot<D> {
    Idle(Idle<D>),
    New(u64),
}

impl<C, L> Pool<C, L>
where
    C: Connector,
    L: ConnectionLifecycle<C::Connection>,
{
    /// Create a new pool with the given configuration.
    ///
    /// No connection is opened until the first checkout.
    pub fn new(config: PoolConfig, connector: C, lifecycle: L) -> Result<Self, PoolError> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            config: config.clone(),
            connector,
            lifecycle,
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            created_at: Instant::now(),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                leases: HashMap::new(),
                allowances: HashMap::new(),
                mode: config.mode,
                total: 0,
            }),
            available: Condvar::new(),
            metrics: Mutex::new(PoolMetricsInner::default()),
        });

        tracing::info!(
            max = config.max_connections,
            mode = ?config.mode,
            "ownership pool created"
        );

        Ok(Self { config, inner })
    }

    /// Grant a connection to `owner`.
    ///
    /// Reuses an idle connection or opens a new one if the pool is below
    /// capacity; otherwise waits up to `connection_timeout` for a checkin.
    pub fn checkout(&self, owner: OwnerId) -> Result<CheckoutStatus, PoolError> {
        self.ensure_open()?;

        let deadline = Instant::now() + self.inner.config.connection_timeout;
        let mut state = self.inner.state.lock();

        if state.leases.contains_key(&owner) {
            return Ok(CheckoutStatus::AlreadyOwner);
        }
        if state.allowances.contains_key(&owner) {
            return Ok(CheckoutStatus::AlreadyAllowed);
        }

        let slot = loop {
            if let Some(idle) = state.idle.pop() {
                break Slot::Idle(idle);
            }
            if state.total < self.inner.config.max_connections {
                state.total += 1;
                break Slot::New(self.next_connection_id());
            }
            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                drop(state);
                self.inner.metrics.lock().checkouts_failed += 1;
                tracing::debug!(%owner, "checkout timed out");
                return Err(PoolError::Timeout(self.inner.config.connection_timeout));
            }
            if self.is_closed() {
                return Err(PoolError::PoolClosed);
            }
        };
        drop(state);

        let (mut metadata, mut raw) = match slot {
            Slot::Idle(idle) => (idle.metadata, idle.connection),
            Slot::New(id) => match self.inner.connector.connect() {
                Ok(connection) => {
                    self.inner.metrics.lock().connections_created += 1;
                    tracing::debug!(connection_id = id, "connection opened");
                    (ConnectionMetadata::new(id), connection)
                }
                Err(e) => {
                    self.free_slot();
                    self.inner.metrics.lock().checkouts_failed += 1;
                    return Err(PoolError::Connect(Box::new(e)));
                }
            },
        };

        if let Err(failure) = raw.checkout() {
            self.discard(raw, metadata.id);
            self.inner.metrics.lock().checkouts_failed += 1;
            return Err(PoolError::Lifecycle {
                phase: "checkout",
                source: Box::new(failure),
            });
        }

        let wrapped = match self.inner.lifecycle.on_checkout(raw) {
            Ok(wrapped) => wrapped,
            Err(rejected) => {
                self.discard(rejected.connection, metadata.id);
                self.inner.metrics.lock().checkouts_failed += 1;
                return Err(PoolError::Lifecycle {
                    phase: "checkout",
                    source: Box::new(rejected.error),
                });
            }
        };

        metadata.granted(owner);
        tracing::debug!(%owner, connection_id = metadata.id, "connection checked out");

        let lease = Arc::new(Lease {
            owner,
            metadata,
            connection: Mutex::new(Some(wrapped)),
        });
        self.inner.state.lock().leases.insert(owner, lease);
        self.inner.metrics.lock().checkouts_successful += 1;

        Ok(CheckoutStatus::Granted)
    }

    /// Return `owner`'s connection to the pool.
    ///
    /// Allowances on the connection are revoked, and shared mode naming
    /// `owner` falls back to manual mode.
    pub fn checkin(&self, owner: OwnerId) -> Result<(), PoolError> {
        let lease = {
            let mut state = self.inner.state.lock();
            let lease = state
                .leases
                .remove(&owner)
                .ok_or(PoolError::NotOwner(owner))?;
            Self::forget_owner(&mut state, owner);
            lease
        };

        self.release(&lease)
    }

    /// Let `allowed` use the connection `owner` has access to.
    pub fn allow(&self, owner: OwnerId, allowed: OwnerId) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();

        let holder = if state.leases.contains_key(&owner) {
            owner
        } else if let Some(holder) = state.allowances.get(&owner) {
            *holder
        } else {
            return Err(PoolError::NotOwner(owner));
        };

        tracing::debug!(%holder, %allowed, "allowance granted");
        state.allowances.insert(allowed, holder);
        Ok(())
    }

    /// Change how callers without a checkout are resolved.
    pub fn set_mode(&self, mode: Mode) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();

        if let Mode::Shared(owner) = mode {
            if !state.leases.contains_key(&owner) {
                return Err(PoolError::NothingToShare(owner));
            }
        }

        tracing::debug!(?mode, "pool mode changed");
        state.mode = mode;
        Ok(())
    }

    /// The current mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.inner.state.lock().mode
    }

    /// Run `f` with exclusive access to the connection `caller` may use.
    ///
    /// Resolution order: the shared owner's connection in shared mode, the
    /// caller's own checkout, a connection the caller was allowed, and in
    /// auto mode a fresh checkout. Concurrent callers resolving to the same
    /// connection are serialized.
    ///
    /// `f` must not check in or reclaim the connection it is given.
    pub fn with_connection<R>(
        &self,
        caller: OwnerId,
        f: impl FnOnce(&mut L::Wrapped) -> R,
    ) -> Result<R, PoolError> {
        self.ensure_open()?;

        let lease = match self.resolve(caller) {
            (Some(lease), _) => lease,
            (None, Mode::Auto) => {
                self.checkout(caller)?;
                self.resolve(caller).0.ok_or(PoolError::NotOwner(caller))?
            }
            (None, _) => return Err(PoolError::NotOwner(caller)),
        };

        if let Some(elapsed) = lease.expired(self.inner.config.ownership_timeout) {
            self.reclaim(&lease)?;
            return Err(PoolError::OwnershipExpired {
                owner: lease.owner,
                elapsed,
            });
        }

        let mut guard = lease.connection.lock();
        match guard.as_mut() {
            Some(connection) => Ok(f(connection)),
            None => Err(PoolError::OwnershipExpired {
                owner: lease.owner,
                elapsed: lease.metadata.held_for().unwrap_or_default(),
            }),
        }
    }

    /// Reclaim every checkout held longer than the ownership timeout.
    ///
    /// Returns the number of checkouts reclaimed.
    pub fn reclaim_expired(&self) -> usize {
        let limit = self.inner.config.ownership_timeout;
        let expired: Vec<_> = {
            let state = self.inner.state.lock();
            state
                .leases
                .values()
                .filter(|lease| lease.expired(limit).is_some())
                .cloned()
                .collect()
        };

        for lease in &expired {
            if let Err(e) = self.reclaim(lease) {
                tracing::warn!(
                    owner = %lease.owner,
                    error = %e,
                    "reclaimed connection was discarded"
                );
            }
        }
        expired.len()
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: state.idle.len() as u32,
            in_use: state.leases.len() as u32,
            total: state.total,
            max: self.config.max_connections,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            checkins_successful: inner.checkins_successful,
            checkins_failed: inner.checkins_failed,
            reclaims: inner.reclaims,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Close the pool, disconnecting idle connections.
    ///
    /// Connections still checked out are disconnected when they are checked
    /// in.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);

        let idle = std::mem::take(&mut self.inner.state.lock().idle);
        for idle in idle {
            self.discard(idle.connection, idle.metadata.id);
        }
        self.inner.available.notify_all();

        tracing::info!("ownership pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        Ok(())
    }

    fn resolve(&self, caller: OwnerId) -> (Option<Arc<Lease<L::Wrapped>>>, Mode) {
        let state = self.inner.state.lock();
        let lease = match state.mode {
            Mode::Shared(owner) => state.leases.get(&owner),
            Mode::Auto | Mode::Manual => state.leases.get(&caller).or_else(|| {
                state
                    .allowances
                    .get(&caller)
                    .and_then(|holder| state.leases.get(holder))
            }),
        };
        (lease.cloned(), state.mode)
    }

    fn forget_owner(state: &mut PoolState<C::Connection, L::Wrapped>, owner: OwnerId) {
        state.allowances.retain(|_, holder| *holder != owner);
        if state.mode == Mode::Shared(owner) {
            state.mode = Mode::Manual;
        }
    }

    /// Take back a lease from its owner and return the connection.
    fn reclaim(&self, lease: &Arc<Lease<L::Wrapped>>) -> Result<(), PoolError> {
        {
            let mut state = self.inner.state.lock();
            let current = state.leases.get(&lease.owner);
            if current.is_some_and(|current| Arc::ptr_eq(current, lease)) {
                state.leases.remove(&lease.owner);
                Self::forget_owner(&mut state, lease.owner);
            }
        }

        tracing::warn!(
            owner = %lease.owner,
            connection_id = lease.metadata.id,
            "ownership timeout exceeded, reclaiming connection"
        );
        self.inner.metrics.lock().reclaims += 1;
        self.release(lease)
    }

    /// Run the checkin hook and put the connection back in the idle set.
    fn release(&self, lease: &Lease<L::Wrapped>) -> Result<(), PoolError> {
        let Some(wrapped) = lease.connection.lock().take() else {
            return Ok(());
        };

        let mut metadata = lease.metadata.clone();
        metadata.released();

        let mut raw = match self.inner.lifecycle.on_checkin(wrapped) {
            Ok(raw) => raw,
            Err(rejected) => {
                self.discard(rejected.connection, metadata.id);
                self.inner.metrics.lock().checkins_failed += 1;
                return Err(PoolError::Lifecycle {
                    phase: "checkin",
                    source: Box::new(rejected.error),
                });
            }
        };

        if let Err(failure) = raw.checkin() {
            self.discard(raw, metadata.id);
            self.inner.metrics.lock().checkins_failed += 1;
            return Err(PoolError::Lifecycle {
                phase: "checkin",
                source: Box::new(failure),
            });
        }

        self.inner.metrics.lock().checkins_successful += 1;
        tracing::debug!(owner = %lease.owner, connection_id = metadata.id, "connection checked in");

        // `close` drains the idle set under this lock, so the flag is
        // checked while holding it.
        let mut state = self.inner.state.lock();
        if self.is_closed() {
            drop(state);
            self.discard(raw, metadata.id);
            return Ok(());
        }

        state.idle.push(Idle {
            metadata,
            connection: raw,
        });
        drop(state);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Disconnect a connection and free its slot.
    fn discard(&self, mut connection: C::Connection, id: u64) {
        connection.disconnect();
        self.inner.metrics.lock().connections_closed += 1;
        tracing::debug!(connection_id = id, "connection discarded");
        self.free_slot();
    }

    fn free_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Generate a new unique connection ID.
    fn next_connection_id(&self) -> u64 {
        self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl<C, L> Clone for Pool<C, L>
where
    C: Connector,
    L: ConnectionLifecycle<C::Connection>,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, L> fmt::Debug for Pool<C, L>
where
    C: Connector,
    L: ConnectionLifecycle<C::Connection>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for creating an ownership pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = PoolBuilder::new()
///     .max_connections(4)
///     .ownership_timeout(Duration::from_secs(15))
///     .build(connector, Sandbox)?;
/// ```
pub struct PoolBuilder {
    pool_config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the checkout wait timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.connection_timeout = timeout;
        self
    }

    /// Set the ownership timeout.
    #[must_use]
    pub fn ownership_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.ownership_timeout = timeout;
        self
    }

    /// Set the initial mode.
    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.pool_config.mode = mode;
        self
    }

    /// Build the pool.
    pub fn build<C, L>(self, connector: C, lifecycle: L) -> Result<Pool<C, L>, PoolError>
    where
        C: Connector,
        L: ConnectionLifecycle<C::Connection>,
    {
        Pool::new(self.pool_config, connector, lifecycle)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently checked out.
    pub in_use: u32,
    /// Total number of open connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Successful checkouts.
    pub checkouts_successful: u64,
    /// Failed checkouts (timeouts, connect errors, rejected hooks).
    pub checkouts_failed: u64,
    /// Successful checkins.
    pub checkins_successful: u64,
    /// Checkins whose connection had to be discarded.
    pub checkins_failed: u64,
    /// Checkouts reclaimed after the ownership timeout.
    pub reclaims: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate checkin success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkin_success_rate(&self) -> f64 {
        let total = self.checkins_successful + self.checkins_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkins_successful as f64 / total as f64
    }
}
