//! Sandboxed connections against the in-memory backend.
//!
//! Every test checks out a sandbox over a fresh [`MemoryServer`], so the
//! backend behaves like a database without savepoints: nested begin is
//! refused and any error poisons the outer transaction until rollback.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use replay_driver::{Driver, Failure, Transition, TxStatus};
use replay_sandbox::{
    EntryKind, Marker, SandboxConnection, SandboxError, post_checkout, pre_checkin,
};
use replay_testing::{MemoryConnection, MemoryError, MemoryServer, Row, Statement, Value, params};

type Conn = SandboxConnection<MemoryConnection>;

const INSERT: &str = "INSERT INTO posts VALUES ($1, $2)";
const UPDATE: &str = "UPDATE posts SET value = $2 WHERE id = $1";
const SELECT: &str = "SELECT * FROM posts";

fn setup_with(server: &MemoryServer) -> Conn {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    server.create_table("posts");
    post_checkout(server.connect().unwrap()).unwrap()
}

fn setup() -> (MemoryServer, Conn) {
    let server = MemoryServer::new();
    let conn = setup_with(&server);
    (server, conn)
}

fn insert(conn: &mut Conn, id: i64, value: &str) {
    let statement = Statement::new(INSERT);
    conn.execute(&statement, &params(id, value)).unwrap();
}

fn update(conn: &mut Conn, id: i64, value: &str) {
    let statement = Statement::new(UPDATE);
    conn.execute(&statement, &params(id, value)).unwrap();
}

/// Insert a duplicate of row 1 so the statement fails on the server.
fn fail(conn: &mut Conn) -> Failure<SandboxError<MemoryError>> {
    let statement = Statement::new(INSERT);
    conn.execute(&statement, &params(1, "duplicate")).unwrap_err()
}

fn visible_rows(conn: &mut Conn) -> Vec<Row> {
    conn.execute(&Statement::new(SELECT), &vec![]).unwrap().rows
}

// =============================================================================
// Pseudo-transactions
// =============================================================================

#[test]
fn test_failed_insert_then_commit_keeps_only_earlier_row() {
    let (_server, mut conn) = setup();

    insert(&mut conn, 1, "a");
    assert_eq!(conn.begin().unwrap(), Transition::Done);
    insert(&mut conn, 2, "b");

    let failure = fail(&mut conn);
    assert!(!failure.is_disconnect());
    assert!(matches!(
        failure.error(),
        SandboxError::Driver(MemoryError::UniqueViolation { id: 1, .. })
    ));

    // The commit is reported as successful even though the
    // pseudo-transaction was discarded.
    assert_eq!(conn.commit().unwrap(), Transition::Done);
    assert_eq!(visible_rows(&mut conn), vec![Row::new(1, "a")]);
}

#[test]
fn test_rollback_restores_original_value() {
    let (_server, mut conn) = setup();

    insert(&mut conn, 1, "original title");
    conn.begin().unwrap();
    update(&mut conn, 1, "first edit");
    update(&mut conn, 1, "second edit");
    assert_eq!(conn.rollback().unwrap(), Transition::Done);

    assert_eq!(conn.replay_log().durable().len(), 1);
    assert_eq!(conn.replay_log().marker(), Marker::ReplayPending);
    assert_eq!(
        visible_rows(&mut conn),
        vec![Row::new(1, "original title")]
    );
    assert_eq!(conn.replay_log().marker(), Marker::Clean);
}

#[test]
fn test_committed_pseudo_transactions_are_visible_to_owner() {
    let (server, mut conn) = setup();

    conn.begin().unwrap();
    insert(&mut conn, 1, "a");
    insert(&mut conn, 2, "b");
    conn.commit().unwrap();

    assert_eq!(conn.replay_log().durable().len(), 2);
    assert!(conn.replay_log().pending().is_empty());
    assert_eq!(
        visible_rows(&mut conn),
        vec![Row::new(1, "a"), Row::new(2, "b")]
    );
    // Nothing reaches the server while the outer transaction is open.
    assert!(server.rows("posts").is_empty());
}

#[test]
fn test_failure_in_transaction_keeps_earlier_commits() {
    let (_server, mut conn) = setup();

    conn.begin().unwrap();
    insert(&mut conn, 1, "a");
    conn.commit().unwrap();

    conn.begin().unwrap();
    insert(&mut conn, 2, "b");
    fail(&mut conn);
    conn.rollback().unwrap();

    assert_eq!(visible_rows(&mut conn), vec![Row::new(1, "a")]);
}

#[test]
fn test_repeated_failures_restart_once_on_commit() {
    let (_server, mut conn) = setup();

    insert(&mut conn, 1, "a");
    conn.begin().unwrap();
    fail(&mut conn);

    // The backend now rejects everything until rollback.
    let aborted = conn
        .execute(&Statement::new(INSERT), &params(2, "b"))
        .unwrap_err();
    assert!(matches!(
        aborted.error(),
        SandboxError::Driver(MemoryError::Aborted)
    ));
    fail(&mut conn);

    conn.commit().unwrap();
    assert_eq!(conn.stats().restarts, 1);
    assert_eq!(conn.get_ref().stats().rollbacks, 1);
    assert_eq!(visible_rows(&mut conn), vec![Row::new(1, "a")]);
}

#[test]
fn test_repeated_failures_restart_once_on_rollback() {
    let (_server, mut conn) = setup();

    insert(&mut conn, 1, "a");
    conn.begin().unwrap();
    fail(&mut conn);
    fail(&mut conn);
    conn.rollback().unwrap();

    assert_eq!(conn.stats().restarts, 1);
    assert_eq!(conn.replay_log().marker(), Marker::ReplayPending);
}

#[test]
fn test_nested_begin_and_stray_commit_are_refused() {
    let (_server, mut conn) = setup();

    assert_eq!(conn.commit().unwrap(), Transition::Refused(TxStatus::Idle));
    assert_eq!(conn.rollback().unwrap(), Transition::Refused(TxStatus::Idle));

    conn.begin().unwrap();
    assert_eq!(
        conn.begin().unwrap(),
        Transition::Refused(TxStatus::Transaction)
    );
    // Only the outer transaction was ever opened on the backend.
    assert_eq!(conn.get_ref().stats().begins, 1);
}

#[test]
fn test_status_hides_outer_transaction() {
    let (_server, mut conn) = setup();

    assert_eq!(conn.status().unwrap(), TxStatus::Idle);
    conn.begin().unwrap();
    assert_eq!(conn.status().unwrap(), TxStatus::Transaction);
    insert(&mut conn, 1, "a");
    fail(&mut conn);
    assert_eq!(conn.status().unwrap(), TxStatus::Error);
    conn.rollback().unwrap();
    assert_eq!(conn.status().unwrap(), TxStatus::Idle);
}

// =============================================================================
// Failures outside a pseudo-transaction
// =============================================================================

#[test]
fn test_failure_outside_transaction_replays_before_next_operation() {
    let (_server, mut conn) = setup();

    insert(&mut conn, 1, "a");
    insert(&mut conn, 2, "b");
    let before = visible_rows(&mut conn);

    fail(&mut conn);
    assert_eq!(conn.stats().restarts, 1);
    assert_eq!(conn.replay_log().marker(), Marker::ReplayPending);

    assert_eq!(visible_rows(&mut conn), before);
    let stats = conn.stats();
    assert_eq!(stats.replays, 1);
    // Two inserts and the first select.
    assert_eq!(stats.entries_replayed, 3);
}

#[test]
fn test_syntax_error_outside_transaction_is_reported_unchanged() {
    let (_server, mut conn) = setup();

    let failure = conn
        .execute(&Statement::new("VACUUM posts"), &vec![])
        .unwrap_err();
    assert!(matches!(
        failure,
        Failure::Error(SandboxError::Driver(MemoryError::Syntax(_)))
    ));
    assert!(conn.replay_log().durable().is_empty());
}

#[test]
fn test_cursor_is_rebuilt_by_replay() {
    let server = MemoryServer::with_fetch_size(2);
    let mut conn = setup_with(&server);
    for id in 1..=3 {
        insert(&mut conn, id, "row");
    }

    let select = Statement::new(SELECT);
    let cursor = conn.declare(&select, &vec![]).unwrap();
    let first = conn.fetch(&select, &cursor).unwrap();
    assert!(!first.is_halt());
    assert_eq!(first.into_inner().rows.len(), 2);

    fail(&mut conn);

    // Replay re-declares the cursor and re-runs the first fetch, so the next
    // fetch continues where the caller left off.
    let second = conn.fetch(&select, &cursor).unwrap();
    assert!(second.is_halt());
    assert_eq!(second.into_inner().rows, vec![Row::new(3, "row")]);

    conn.deallocate(&select, &cursor).unwrap();
    let kinds: Vec<_> = conn
        .replay_log()
        .durable()
        .iter()
        .map(|entry| entry.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            EntryKind::Execute,
            EntryKind::Execute,
            EntryKind::Execute,
            EntryKind::Declare,
            EntryKind::Fetch,
            EntryKind::Fetch,
            EntryKind::Deallocate,
        ]
    );
}

#[test]
fn test_prepare_is_not_logged() {
    let (_server, mut conn) = setup();

    let prepared = conn.prepare(&Statement::new(INSERT)).unwrap();
    assert!(prepared.is_prepared());
    assert!(conn.replay_log().durable().is_empty());

    conn.execute(&prepared, &params(1, "a")).unwrap();
    assert_eq!(conn.replay_log().durable().len(), 1);
}

// =============================================================================
// Recovery failures
// =============================================================================

#[test]
fn test_replay_failure_is_fatal() {
    let (server, mut conn) = setup();
    insert(&mut conn, 5, "mine");

    // Another client commits the same id while the sandbox is open.
    let mut other = server.connect().unwrap();
    other
        .execute(&Statement::new(INSERT), &params(5, "theirs"))
        .unwrap();

    conn.execute(&Statement::new("VACUUM posts"), &vec![])
        .unwrap_err();

    let failure = conn.ping().unwrap_err();
    assert!(failure.is_disconnect());
    assert!(matches!(
        failure.error(),
        SandboxError::Replay {
            index: 0,
            kind: EntryKind::Execute,
            source: MemoryError::UniqueViolation { id: 5, .. },
        }
    ));
    assert_eq!(conn.replay_log().marker(), Marker::ReplayPending);
}

#[test]
fn test_retry_after_replay_failure_does_not_replay_again() {
    let (server, mut conn) = setup();
    insert(&mut conn, 5, "mine");

    let mut other = server.connect().unwrap();
    other
        .execute(&Statement::new(INSERT), &params(5, "theirs"))
        .unwrap();
    conn.execute(&Statement::new("VACUUM posts"), &vec![])
        .unwrap_err();
    conn.ping().unwrap_err();
    assert!(conn.is_broken());

    // The conflict goes away, but the checkout stays unusable.
    other
        .execute(&Statement::new("DELETE FROM posts WHERE id = $1"), &vec![Value::Int(5)])
        .unwrap();
    let begins = conn.get_ref().stats().begins;

    let failure = conn.ping().unwrap_err();
    assert!(failure.is_disconnect());
    assert!(matches!(
        failure.error(),
        SandboxError::Unusable {
            index: 0,
            kind: EntryKind::Execute,
        }
    ));
    assert!(conn.begin().unwrap_err().is_disconnect());
    assert_eq!(conn.get_ref().stats().begins, begins);
    assert_eq!(conn.stats().replays, 1);

    let raw = pre_checkin(conn).unwrap();
    assert!(!raw.in_transaction());
    assert!(server.rows("posts").is_empty());
}

#[test]
fn test_failed_begin_during_recovery_is_retried() {
    let (server, mut conn) = setup();
    insert(&mut conn, 1, "a");

    server.refuse_transactions(true);
    let failure = fail(&mut conn);
    assert!(!failure.is_disconnect());
    assert!(matches!(
        failure.error(),
        SandboxError::Reconstruction {
            operation: "begin",
            source: MemoryError::TransactionsRefused,
        }
    ));
    assert!(!conn.get_ref().in_transaction());

    // Nothing runs while the outer transaction cannot be reopened.
    let statement = Statement::new(INSERT);
    let failure = conn.execute(&statement, &params(2, "b")).unwrap_err();
    assert!(failure.error().is_recovery_failure());
    assert!(server.rows("posts").is_empty());

    server.refuse_transactions(false);
    insert(&mut conn, 2, "b");
    assert_eq!(
        visible_rows(&mut conn),
        vec![Row::new(1, "a"), Row::new(2, "b")]
    );
    assert_eq!(conn.replay_log().marker(), Marker::Clean);
    assert!(server.rows("posts").is_empty());

    drop(pre_checkin(conn).unwrap());
    assert!(server.rows("posts").is_empty());
}

#[test]
fn test_checkin_after_failed_begin_returns_connection() {
    let (server, mut conn) = setup();
    insert(&mut conn, 1, "a");

    server.refuse_transactions(true);
    fail(&mut conn);

    let raw = pre_checkin(conn).unwrap();
    assert!(!raw.in_transaction());
    assert!(!raw.is_closed());
    assert!(server.rows("posts").is_empty());

    server.refuse_transactions(false);
    let mut conn = post_checkout(raw).unwrap();
    assert!(visible_rows(&mut conn).is_empty());
}

#[test]
fn test_dead_connection_fails_reconstruction() {
    let (_server, mut conn) = setup();
    conn.get_mut().kill();

    let failure = conn
        .execute(&Statement::new(INSERT), &params(1, "a"))
        .unwrap_err();
    assert!(failure.is_disconnect());
    assert!(matches!(
        failure.error(),
        SandboxError::Reconstruction {
            operation: "roll back",
            source: MemoryError::Closed,
        }
    ));
    assert!(failure.error().is_recovery_failure());
}

#[test]
fn test_disconnect_skips_replay() {
    let (_server, mut conn) = setup();
    insert(&mut conn, 1, "a");
    fail(&mut conn);

    conn.disconnect();
    assert!(conn.get_ref().is_closed());
    assert_eq!(conn.stats().replays, 0);
}

// =============================================================================
// Lifecycle hooks
// =============================================================================

#[test]
fn test_checkin_leaves_no_trace() {
    let (server, mut conn) = setup();

    insert(&mut conn, 1, "a");
    conn.begin().unwrap();
    insert(&mut conn, 2, "b");
    conn.commit().unwrap();
    conn.begin().unwrap();
    update(&mut conn, 1, "edited");
    conn.commit().unwrap();
    conn.begin().unwrap();
    insert(&mut conn, 3, "uncommitted");

    let mut raw = pre_checkin(conn).unwrap();
    assert!(!raw.in_transaction());
    assert!(server.rows("posts").is_empty());

    let rows = raw.execute(&Statement::new(SELECT), &vec![]).unwrap().rows;
    assert!(rows.is_empty());
}

#[test]
fn test_connection_can_be_sandboxed_again_after_checkin() {
    let (server, mut conn) = setup();
    insert(&mut conn, 1, "a");
    let raw = pre_checkin(conn).unwrap();

    let mut conn = post_checkout(raw).unwrap();
    assert!(visible_rows(&mut conn).is_empty());
    insert(&mut conn, 1, "a again");
    assert_eq!(conn.get_ref().stats().begins, 2);
    drop(pre_checkin(conn).unwrap());
    assert!(server.rows("posts").is_empty());
}

#[test]
fn test_manual_commit_is_reported_at_checkin() {
    let (server, mut conn) = setup();

    insert(&mut conn, 1, "leaked");
    conn.execute(&Statement::new("COMMIT"), &vec![]).unwrap();

    let rejected = pre_checkin(conn).unwrap_err();
    assert!(!rejected.error.is_disconnect());
    assert!(matches!(
        rejected.error.error(),
        SandboxError::ManualTransaction {
            operation: "checkin"
        }
    ));
    assert!(
        rejected
            .to_string()
            .contains("Do not commit or roll back the outer transaction manually")
    );
    // The manual commit really did escape the sandbox.
    assert_eq!(server.rows("posts"), vec![Row::new(1, "leaked")]);
}

#[test]
fn test_manual_commit_is_reported_on_rollback() {
    let (_server, mut conn) = setup();

    conn.execute(&Statement::new("COMMIT"), &vec![]).unwrap();
    conn.begin().unwrap();

    let failure = conn.rollback().unwrap_err();
    assert!(matches!(
        failure,
        Failure::Error(SandboxError::ManualTransaction {
            operation: "rollback"
        })
    ));
}

#[test]
fn test_begin_refused_at_checkout_is_a_disconnect() {
    let server = MemoryServer::new();
    let mut raw = server.connect().unwrap();
    raw.begin().unwrap();

    let rejected = post_checkout(raw).unwrap_err();
    assert!(rejected.error.is_disconnect());
    assert!(matches!(
        rejected.error.error(),
        SandboxError::BeginRefused {
            status: TxStatus::Transaction
        }
    ));
    assert!(rejected.connection.in_transaction());
}

#[test]
fn test_dead_connection_at_checkout_is_a_disconnect() {
    let server = MemoryServer::new();
    let mut raw = server.connect().unwrap();
    raw.kill();

    let rejected = post_checkout(raw).unwrap_err();
    assert!(rejected.error.is_disconnect());
    assert!(matches!(
        rejected.error.error(),
        SandboxError::Driver(MemoryError::Closed)
    ));
}
