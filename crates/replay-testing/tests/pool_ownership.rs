//! Ownership pool with sandbox hooks against the in-memory backend.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::convert::Infallible;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use replay_driver::Driver;
use replay_pool::{
    CheckoutStatus, ConnectionLifecycle, Mode, OwnerId, Pool, PoolBuilder, PoolConfig, PoolError,
    Rejected,
};
use replay_sandbox::Sandbox;
use replay_testing::{MemoryConnection, MemoryConnector, MemoryServer, Row, Statement, params};

type SandboxPool = Pool<MemoryConnector, Sandbox>;

const INSERT: &str = "INSERT INTO posts VALUES ($1, $2)";
const SELECT: &str = "SELECT * FROM posts";

fn server() -> MemoryServer {
    let server = MemoryServer::new();
    server.create_table("posts");
    server
}

fn pool_with(server: &MemoryServer, builder: PoolBuilder) -> SandboxPool {
    builder
        .build(MemoryConnector::new(server.clone()), Sandbox)
        .unwrap()
}

fn pool(server: &MemoryServer) -> SandboxPool {
    pool_with(
        server,
        PoolBuilder::new()
            .max_connections(2)
            .connection_timeout(Duration::from_millis(100)),
    )
}

fn insert(pool: &SandboxPool, caller: OwnerId, id: i64, value: &str) {
    pool.with_connection(caller, |conn| {
        conn.execute(&Statement::new(INSERT), &params(id, value))
    })
    .unwrap()
    .unwrap();
}

fn rows(pool: &SandboxPool, caller: OwnerId) -> Vec<Row> {
    pool.with_connection(caller, |conn| {
        conn.execute(&Statement::new(SELECT), &vec![])
    })
    .unwrap()
    .unwrap()
    .rows
}

#[test]
fn test_checkout_and_checkin_discard_changes() {
    let server = server();
    let pool = pool(&server);
    let owner = OwnerId::next();

    assert_eq!(pool.checkout(owner).unwrap(), CheckoutStatus::Granted);
    assert_eq!(pool.checkout(owner).unwrap(), CheckoutStatus::AlreadyOwner);

    insert(&pool, owner, 1, "a");
    pool.with_connection(owner, |conn| {
        conn.begin().unwrap();
        conn.execute(&Statement::new(INSERT), &params(2, "b"))
            .unwrap();
        conn.commit().unwrap();
    })
    .unwrap();
    assert_eq!(rows(&pool, owner).len(), 2);

    pool.checkin(owner).unwrap();
    assert!(server.rows("posts").is_empty());

    let next = OwnerId::next();
    pool.checkout(next).unwrap();
    assert!(rows(&pool, next).is_empty());

    let metrics = pool.metrics();
    assert_eq!(metrics.connections_created, 1);
    assert_eq!(metrics.checkouts_successful, 2);
    assert_eq!(metrics.checkins_successful, 1);
}

#[test]
fn test_caller_without_checkout_is_not_owner() {
    let pool = pool(&server());
    let stranger = OwnerId::next();

    let err = pool.with_connection(stranger, |_| ()).unwrap_err();
    assert!(matches!(err, PoolError::NotOwner(owner) if owner == stranger));
    assert!(matches!(
        pool.checkin(stranger),
        Err(PoolError::NotOwner(_))
    ));
}

#[test]
fn test_allowed_worker_shares_owner_connection() {
    let server = server();
    let pool = pool(&server);
    let owner = OwnerId::next();
    let worker = OwnerId::next();

    pool.checkout(owner).unwrap();
    insert(&pool, owner, 1, "from owner");
    pool.allow(owner, worker).unwrap();
    assert_eq!(pool.checkout(worker).unwrap(), CheckoutStatus::AlreadyAllowed);

    let handle = {
        let pool = pool.clone();
        thread::spawn(move || {
            insert(&pool, worker, 2, "from worker");
            rows(&pool, worker)
        })
    };
    let seen_by_worker = handle.join().unwrap();

    assert_eq!(seen_by_worker.len(), 2);
    assert_eq!(rows(&pool, owner), seen_by_worker);
    assert_eq!(pool.status().in_use, 1);

    // Checkin revokes the allowance.
    pool.checkin(owner).unwrap();
    assert!(matches!(
        pool.with_connection(worker, |_| ()),
        Err(PoolError::NotOwner(_))
    ));
}

#[test]
fn test_allowance_is_transitive() {
    let pool = pool(&server());
    let owner = OwnerId::next();
    let worker = OwnerId::next();
    let helper = OwnerId::next();

    pool.checkout(owner).unwrap();
    pool.allow(owner, worker).unwrap();
    pool.allow(worker, helper).unwrap();
    insert(&pool, helper, 1, "from helper");
    assert_eq!(rows(&pool, owner), vec![Row::new(1, "from helper")]);

    assert!(matches!(
        pool.allow(OwnerId::next(), helper),
        Err(PoolError::NotOwner(_))
    ));
}

#[test]
fn test_shared_mode() {
    let pool = pool(&server());
    let owner = OwnerId::next();

    assert!(matches!(
        pool.set_mode(Mode::Shared(owner)),
        Err(PoolError::NothingToShare(_))
    ));

    pool.checkout(owner).unwrap();
    pool.set_mode(Mode::Shared(owner)).unwrap();

    let workers: Vec<_> = (1..=4)
        .map(|id| {
            let pool = pool.clone();
            thread::spawn(move || insert(&pool, OwnerId::current(), id, "shared"))
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(rows(&pool, owner).len(), 4);
    assert_eq!(pool.status().in_use, 1);

    // Checking the shared owner in falls back to manual mode.
    pool.checkin(owner).unwrap();
    assert_eq!(pool.mode(), Mode::Manual);
}

#[test]
fn test_auto_mode_checks_out_on_first_use() {
    let pool = pool_with(&server(), PoolBuilder::new().mode(Mode::Auto));
    let caller = OwnerId::next();

    insert(&pool, caller, 1, "auto");
    assert_eq!(pool.status().in_use, 1);
    assert_eq!(rows(&pool, caller).len(), 1);

    pool.checkin(caller).unwrap();
    assert_eq!(pool.status().available, 1);
}

#[test]
fn test_checkout_times_out_at_capacity() {
    let pool = pool_with(
        &server(),
        PoolBuilder::new()
            .max_connections(1)
            .connection_timeout(Duration::from_millis(50)),
    );

    pool.checkout(OwnerId::next()).unwrap();
    let err = pool.checkout(OwnerId::next()).unwrap_err();
    assert!(matches!(err, PoolError::Timeout(_)));
    assert!(err.is_transient());
    assert!(pool.status().is_at_capacity());
}

#[test]
fn test_blocked_checkout_proceeds_after_checkin() {
    let pool = pool_with(
        &server(),
        PoolBuilder::new()
            .max_connections(1)
            .connection_timeout(Duration::from_secs(5)),
    );
    let first = OwnerId::next();
    pool.checkout(first).unwrap();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.checkout(OwnerId::current()))
    };

    thread::sleep(Duration::from_millis(50));
    pool.checkin(first).unwrap();

    assert_eq!(waiter.join().unwrap().unwrap(), CheckoutStatus::Granted);
    assert_eq!(pool.metrics().connections_created, 1);
}

#[test]
fn test_expired_ownership_is_reclaimed() {
    let pool = pool_with(
        &server(),
        PoolBuilder::new().ownership_timeout(Duration::from_millis(20)),
    );
    let owner = OwnerId::next();
    pool.checkout(owner).unwrap();
    insert(&pool, owner, 1, "soon gone");

    thread::sleep(Duration::from_millis(60));

    let err = pool.with_connection(owner, |_| ()).unwrap_err();
    assert!(matches!(err, PoolError::OwnershipExpired { owner: o, .. } if o == owner));
    assert_eq!(pool.metrics().reclaims, 1);
    assert_eq!(pool.status().in_use, 0);
    assert_eq!(pool.status().available, 1);

    // The reclaimed connection was rolled back before reuse.
    let next = OwnerId::next();
    pool.checkout(next).unwrap();
    assert!(rows(&pool, next).is_empty());
}

#[test]
fn test_reclaim_expired_sweeps_all_owners() {
    let pool = pool_with(
        &server(),
        PoolBuilder::new().ownership_timeout(Duration::from_millis(20)),
    );
    pool.checkout(OwnerId::next()).unwrap();
    pool.checkout(OwnerId::next()).unwrap();

    assert_eq!(pool.reclaim_expired(), 0);
    thread::sleep(Duration::from_millis(60));
    assert_eq!(pool.reclaim_expired(), 2);
    assert_eq!(pool.status().available, 2);
}

#[test]
fn test_manual_commit_rejects_checkin() {
    let server = server();
    let pool = pool(&server);
    let owner = OwnerId::next();
    pool.checkout(owner).unwrap();

    insert(&pool, owner, 1, "leaked");
    pool.with_connection(owner, |conn| {
        conn.execute(&Statement::new("COMMIT"), &vec![])
    })
    .unwrap()
    .unwrap();

    let err = pool.checkin(owner).unwrap_err();
    assert!(matches!(err, PoolError::Lifecycle { phase: "checkin", .. }));
    assert!(err.to_string().contains("Do not commit or roll back"));

    let status = pool.status();
    assert_eq!(status.total, 0);
    assert_eq!(pool.metrics().connections_closed, 1);
    assert_eq!(server.rows("posts"), vec![Row::new(1, "leaked")]);
}

#[test]
fn test_connect_failure() {
    let server = server();
    server.refuse_connections(true);
    let pool = pool(&server);

    let err = pool.checkout(OwnerId::next()).unwrap_err();
    assert!(matches!(err, PoolError::Connect(_)));
    assert_eq!(pool.status().total, 0);

    server.refuse_connections(false);
    assert_eq!(
        pool.checkout(OwnerId::next()).unwrap(),
        CheckoutStatus::Granted
    );
}

#[test]
fn test_closed_pool() {
    let pool = pool(&server());
    let owner = OwnerId::next();
    pool.checkout(owner).unwrap();
    pool.close();

    assert!(pool.is_closed());
    assert!(matches!(
        pool.checkout(OwnerId::next()),
        Err(PoolError::PoolClosed)
    ));
    // Checked-out connections are discarded on checkin.
    pool.checkin(owner).unwrap();
    assert_eq!(pool.status().total, 0);
}

/// Closes its pool from inside the checkin hook.
#[derive(Clone, Default)]
struct CloseOnCheckin {
    pool: Arc<OnceLock<Pool<MemoryConnector, CloseOnCheckin>>>,
}

impl ConnectionLifecycle<MemoryConnection> for CloseOnCheckin {
    type Wrapped = MemoryConnection;
    type Error = Infallible;

    fn on_checkout(
        &self,
        connection: MemoryConnection,
    ) -> Result<MemoryConnection, Rejected<MemoryConnection, Infallible>> {
        Ok(connection)
    }

    fn on_checkin(
        &self,
        wrapped: MemoryConnection,
    ) -> Result<MemoryConnection, Rejected<MemoryConnection, Infallible>> {
        if let Some(pool) = self.pool.get() {
            pool.close();
        }
        Ok(wrapped)
    }
}

#[test]
fn test_pool_closed_during_checkin_keeps_no_idle_connection() {
    let lifecycle = CloseOnCheckin::default();
    let pool = PoolBuilder::new()
        .build(MemoryConnector::new(server()), lifecycle.clone())
        .unwrap();
    assert!(lifecycle.pool.set(pool.clone()).is_ok());

    let owner = OwnerId::next();
    pool.checkout(owner).unwrap();
    pool.checkin(owner).unwrap();

    assert!(pool.is_closed());
    let status = pool.status();
    assert_eq!(status.available, 0);
    assert_eq!(status.total, 0);
    assert_eq!(pool.metrics().connections_closed, 1);
}

#[test]
fn test_pool_from_options_string() {
    let config =
        PoolConfig::from_options_string("Pool Size=1;Checkout Timeout=10;Mode=auto;").unwrap();
    let pool = pool_with(&server(), PoolBuilder::new().pool_config(config));

    assert_eq!(pool.config().max_connections, 1);
    assert_eq!(pool.mode(), Mode::Auto);
    insert(&pool, OwnerId::next(), 1, "a");
    assert!(matches!(
        pool.with_connection(OwnerId::next(), |_| ()),
        Err(PoolError::Timeout(_))
    ));
}
