//! Integration tests for the pool lifecycle managers, driven by the in-memory connector.

use dbkit::config::PoolOptions;
use dbkit::db::{
    AsyncDatabaseManager, AsyncSessionManager, LifecycleState, MemoryConnector, SessionManager,
    SyncDatabaseManager,
};
use dbkit::error::DbError;
use dbkit::models::{ConnectionSettings, DatabaseKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn settings(pool_max: u32, acquire_timeout_ms: u64) -> ConnectionSettings {
    ConnectionSettings::new(
        DatabaseKind::PostgreSQL,
        "127.0.0.1",
        5432,
        "postgres",
        "postgres",
        "smilex_db",
    )
    .with_pool_bounds(1, pool_max)
    .with_pool_options(PoolOptions {
        acquire_timeout_ms: Some(acquire_timeout_ms),
        dispose_grace_ms: Some(200),
        ..PoolOptions::default()
    })
}

#[test]
fn test_sync_pool_never_exceeds_max() {
    let connector = MemoryConnector::new();
    let manager = Arc::new(SyncDatabaseManager::new(connector.clone()));
    assert_ok!(manager.init(settings(3, 5_000)));

    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for j in 0..5 {
                    let mut session = manager.acquire_session().unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    session
                        .execute(&format!("INSERT INTO t VALUES ({}, {})", i, j))
                        .unwrap();
                    thread::sleep(Duration::from_millis(2));
                    in_use.fetch_sub(1, Ordering::SeqCst);
                    session.commit().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(connector.opened() <= 3);
    assert_eq!(connector.count_statements("COMMIT"), 40);
    assert_eq!(manager.status().unwrap().checked_out, 0);

    let report = manager.dispose();
    assert!(report.is_clean());
    assert_eq!(connector.live(), 0);
}

#[test]
fn test_sync_acquire_beyond_max_times_out() {
    let manager = SyncDatabaseManager::new(MemoryConnector::new());
    manager.init(settings(2, 100)).unwrap();

    let _first = manager.acquire_session().unwrap();
    let _second = manager.acquire_session().unwrap();

    let started = Instant::now();
    let err = assert_err!(manager.acquire_session());
    assert!(matches!(err, DbError::PoolExhausted { .. }));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_sync_waiter_is_served_after_release() {
    let manager = Arc::new(SyncDatabaseManager::new(MemoryConnector::new()));
    manager.init(settings(1, 5_000)).unwrap();

    let held = manager.acquire_session().unwrap();
    let waiter = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let mut session = manager.acquire_session()?;
            session.execute("SELECT 1")
        })
    };
    thread::sleep(Duration::from_millis(50));
    drop(held);

    assert_eq!(waiter.join().unwrap().unwrap(), 1);
}

#[test]
fn test_sync_erroring_scope_returns_connection() {
    let connector = MemoryConnector::new();
    let manager = SyncDatabaseManager::new(connector.clone());
    manager.init(settings(1, 200)).unwrap();
    connector.fail_on("broken_table");

    for _ in 0..3 {
        let err = manager
            .with_session(|s| s.execute("SELECT * FROM broken_table"))
            .unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));
    }
    // With pool_max = 1 a leaked connection would make this time out.
    assert_eq!(
        manager.with_session(|s| s.execute("SELECT 1")).unwrap(),
        1
    );
}

#[test]
fn test_sync_forced_dispose_severs_outstanding_session() {
    let connector = MemoryConnector::new();
    let manager = SyncDatabaseManager::new(connector.clone());
    manager.init(settings(2, 1_000)).unwrap();

    let mut session = manager.acquire_session().unwrap();
    session.execute("SELECT 1").unwrap();

    let report = manager.dispose();
    assert_eq!(report.forced, 1);
    assert!(!report.is_clean());
    assert_eq!(manager.state(), LifecycleState::Disposed);
    // The outstanding connection is closed even though the session is alive.
    assert_eq!(connector.live(), 0);

    assert!(session.execute("SELECT 2").is_err());
    drop(session);
    assert_eq!(connector.live(), 0);

    // A disposed manager can be initialized again.
    manager.init(settings(2, 1_000)).unwrap();
    assert_eq!(manager.with_session(|s| s.execute("SELECT 1")).unwrap(), 1);
}

#[test]
fn test_sync_recovers_from_killed_connections() {
    let connector = MemoryConnector::new();
    let manager = SyncDatabaseManager::new(connector.clone());
    manager.init(settings(2, 1_000)).unwrap();
    manager.with_session(|s| s.execute("SELECT 1")).unwrap();

    connector.kill_all();
    // The dead idle connection fails its ping and is replaced.
    assert_eq!(manager.with_session(|s| s.execute("SELECT 1")).unwrap(), 1);
    assert!(connector.opened() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_pool_never_exceeds_max() {
    let connector = MemoryConnector::new();
    let manager = Arc::new(AsyncDatabaseManager::new(connector.clone()));
    manager.init(settings(3, 5_000)).await.unwrap();

    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let mut session = manager.acquire_session().await.unwrap();
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                session
                    .execute(&format!("INSERT INTO t VALUES ({})", i))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                session.commit().await.unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(connector.opened() <= 3);
    assert_eq!(connector.count_statements("COMMIT"), 16);
    assert!(manager.dispose().await.is_clean());
}

#[tokio::test]
async fn test_async_acquire_beyond_max_times_out() {
    let manager = AsyncDatabaseManager::new(MemoryConnector::new());
    manager.init(settings(1, 100)).await.unwrap();

    let _held = manager.acquire_session().await.unwrap();
    let err = assert_err!(manager.acquire_session().await);
    assert!(matches!(err, DbError::PoolExhausted { .. }));
}

#[tokio::test]
async fn test_async_cancelled_acquire_holds_nothing() {
    let manager = AsyncDatabaseManager::new(MemoryConnector::new());
    manager.init(settings(1, 5_000)).await.unwrap();

    let held = manager.acquire_session().await.unwrap();
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), manager.acquire_session()).await;
    assert!(abandoned.is_err());

    drop(held);
    let mut session = manager.acquire_session().await.unwrap();
    assert_eq!(session.execute("SELECT 1").await.unwrap(), 1);
    session.commit().await.unwrap();
    assert_eq!(manager.status().await.unwrap().checked_out, 0);
}

#[tokio::test]
async fn test_async_erroring_scope_returns_connection() {
    let connector = MemoryConnector::new();
    let manager = AsyncDatabaseManager::new(connector.clone());
    manager.init(settings(1, 200)).await.unwrap();
    connector.fail_on("broken_table");

    for _ in 0..3 {
        let result = manager
            .with_session(|s| Box::pin(async move { s.execute("SELECT * FROM broken_table").await }))
            .await;
        assert!(matches!(result, Err(DbError::Database { .. })));
    }
    let rows = manager
        .with_session(|s| Box::pin(async move { s.execute("SELECT 1").await }))
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_sync_and_async_managers_coexist() {
    let connector = MemoryConnector::new();
    let async_manager = AsyncDatabaseManager::new(connector.clone());
    async_manager.init(settings(2, 1_000)).await.unwrap();

    let blocking_connector = connector.clone();
    let sync_rows = tokio::task::spawn_blocking(move || {
        let manager = SyncDatabaseManager::new(blocking_connector);
        manager.init(settings(2, 1_000))?;
        let rows = manager.with_session(|s| s.execute("SELECT 1"));
        manager.dispose();
        rows
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(sync_rows, 1);

    assert_eq!(async_manager.state().await, LifecycleState::Ready);
    assert!(async_manager.dispose().await.is_clean());
    assert_eq!(connector.live(), 0);
}

#[tokio::test]
async fn test_async_forced_dispose_closes_held_connection() {
    let connector = MemoryConnector::new();
    let manager = AsyncDatabaseManager::new(connector.clone());
    manager.init(settings(2, 1_000)).await.unwrap();

    let mut session = manager.acquire_session().await.unwrap();
    session.execute("SELECT 1").await.unwrap();

    let report = manager.dispose().await;
    assert_eq!(report.forced, 1);
    assert_eq!(connector.live(), 0);
    assert!(session.execute("SELECT 2").await.is_err());
    drop(session);
    assert_eq!(connector.live(), 0);
}

#[tokio::test]
async fn test_async_dispose_during_slow_connect_leaks_nothing() {
    let connector = MemoryConnector::new();
    let manager = Arc::new(AsyncDatabaseManager::new(connector.clone()));
    manager.init(settings(2, 1_000)).await.unwrap();
    // Keep the warm connection busy so the next acquire has to connect.
    let held = manager.acquire_session().await.unwrap();
    connector.delay_connections(Duration::from_millis(50));

    let opener = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire_session().await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(held);

    let report = manager.dispose().await;
    assert!(report.is_clean(), "unexpected report: {:?}", report);
    assert!(matches!(
        opener.await.unwrap(),
        Err(DbError::NotInitialized { .. })
    ));
    assert_eq!(connector.live(), 0);
}
