//! Non-blocking connection pool.
//!
//! Checkout permits come from a fair tokio [`Semaphore`], so suspended callers
//! are served in FIFO order and an abandoned acquire simply drops its place in
//! the queue. A `watch` channel tracks how many permits are held, counting
//! connections still being opened or validated; disposal waits on it to drain
//! and then force-closes the leases that are left.

use crate::db::connector::{AsyncConnection, AsyncConnector};
use crate::db::pool::{DisposeReport, IdleConnection, PoolConfig, PoolStatus, severed_error};
use crate::db::url::ConnectionUrl;
use crate::error::{DbError, DbResult};
use crate::models::DriverMode;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{MappedMutexGuard, MutexGuard, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, info, warn};

/// Slot of a checked-out connection. Empty once disposal force-closed it.
struct AsyncLease<T> {
    id: u64,
    conn: tokio::sync::Mutex<Option<T>>,
    checked_out_at: Instant,
}

struct Shared<C: AsyncConnector> {
    connector: C,
    url: ConnectionUrl,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    leases: Mutex<HashMap<u64, Arc<AsyncLease<C::Connection>>>>,
    next_lease: AtomicU64,
    checked_out: watch::Sender<usize>,
    closed: AtomicBool,
    /// Set once dispose has taken its final look at the idle queue.
    sealed: AtomicBool,
    severed: AtomicBool,
}

/// Bounded async connection pool.
pub struct AsyncPool<C: AsyncConnector> {
    shared: Arc<Shared<C>>,
}

impl<C: AsyncConnector> Clone for AsyncPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: AsyncConnector> std::fmt::Debug for AsyncPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPool")
            .field("url", &self.shared.url)
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}

/// A held permit, counted as checked out until it either becomes an
/// [`AsyncPooledConnection`] or is dropped.
struct Reservation<C: AsyncConnector> {
    shared: Arc<Shared<C>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<C: AsyncConnector> Reservation<C> {
    fn new(shared: Arc<Shared<C>>, permit: OwnedSemaphorePermit) -> Self {
        shared.checked_out.send_modify(|n| *n += 1);
        Self {
            shared,
            permit: Some(permit),
        }
    }
}

impl<C: AsyncConnector> Drop for Reservation<C> {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            self.shared
                .checked_out
                .send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

impl<C: AsyncConnector> AsyncPool<C> {
    pub fn new(connector: C, url: ConnectionUrl, config: PoolConfig) -> Self {
        let (checked_out, _) = watch::channel(0usize);
        Self {
            shared: Arc::new(Shared {
                connector,
                url,
                permits: Arc::new(Semaphore::new(config.max as usize)),
                config,
                idle: Mutex::new(VecDeque::new()),
                leases: Mutex::new(HashMap::new()),
                next_lease: AtomicU64::new(0),
                checked_out,
                closed: AtomicBool::new(false),
                sealed: AtomicBool::new(false),
                severed: AtomicBool::new(false),
            }),
        }
    }

    pub fn url(&self) -> &ConnectionUrl {
        &self.shared.url
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            checked_out: *self.shared.checked_out.borrow(),
            idle: self.shared.idle.lock().len(),
            max: self.shared.config.max as usize,
        }
    }

    pub fn is_severed(&self) -> bool {
        self.shared.severed.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Probe connectivity with `SELECT 1` and fill the pool up to `min`.
    pub async fn warm_up(&self) -> DbResult<()> {
        let target = self.shared.config.min.max(1) as usize;
        for i in 0..target {
            let mut conn = self.open().await?;
            if i == 0 {
                if let Err(e) = conn.execute("SELECT 1").await {
                    close_quietly(conn).await;
                    return Err(e);
                }
                debug!(url = %self.shared.url, "Connectivity probe succeeded");
            }
            let now = Instant::now();
            self.shared.idle.lock().push_back(IdleConnection {
                conn,
                created: now,
                idle_since: now,
                needs_reset: false,
            });
        }
        Ok(())
    }

    /// Check out a connection, suspending until a permit is free or the
    /// acquire timeout expires.
    pub async fn acquire(&self) -> DbResult<AsyncPooledConnection<C>> {
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.shared.config.acquire_timeout,
            Arc::clone(&self.shared.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::not_initialized(DriverMode::Async.to_string())),
            Err(_) => {
                let waited = started.elapsed();
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    max = self.shared.config.max,
                    "Connection pool exhausted"
                );
                return Err(DbError::pool_exhausted(waited));
            }
        };
        let reservation = Reservation::new(Arc::clone(&self.shared), permit);
        if self.is_closed() {
            return Err(DbError::not_initialized(DriverMode::Async.to_string()));
        }

        let (conn, created) = match self.checkout_idle().await {
            Some(found) => found,
            None => (self.open().await?, Instant::now()),
        };
        if self.is_closed() {
            close_quietly(conn).await;
            return Err(DbError::not_initialized(DriverMode::Async.to_string()));
        }
        Ok(self.lease(conn, created, reservation))
    }

    /// Close idle connections, wait up to the configured grace period for
    /// checked-out ones, then force-close whatever is still outstanding.
    pub async fn dispose(&self) -> DisposeReport {
        self.dispose_with_grace(self.shared.config.dispose_grace)
            .await
    }

    pub async fn dispose_with_grace(&self, grace: Duration) -> DisposeReport {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return DisposeReport::default();
        }
        self.shared.permits.close();

        let idle: Vec<_> = self.shared.idle.lock().drain(..).collect();
        let mut report = DisposeReport::default();
        for idle in idle {
            match idle.conn.close().await {
                Ok(()) => report.closed += 1,
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        let mut outstanding = self.shared.checked_out.subscribe();
        let drained = tokio::time::timeout(grace, outstanding.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !drained {
            report.forced = *outstanding.borrow();
        }
        // Sessions that came back during the grace period parked their
        // connections; from here on returning connections are closed.
        let returned: Vec<_> = {
            let mut idle = self.shared.idle.lock();
            if report.forced > 0 {
                self.shared.severed.store(true, Ordering::SeqCst);
            }
            self.shared.sealed.store(true, Ordering::SeqCst);
            idle.drain(..).collect()
        };
        for idle in returned {
            match idle.conn.close().await {
                Ok(()) => report.closed += 1,
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        if report.forced > 0 {
            warn!(
                forced = report.forced,
                grace_ms = grace.as_millis() as u64,
                "Sessions still checked out after grace period; closing their connections"
            );
            let leases: Vec<_> = self.shared.leases.lock().values().cloned().collect();
            for lease in leases {
                // A statement in flight holds the slot; give it one more grace period.
                let Ok(mut slot) = tokio::time::timeout(grace, lease.conn.lock()).await else {
                    report.errors.push(format!(
                        "connection {} stayed busy; it is closed when its session ends",
                        lease.id
                    ));
                    continue;
                };
                let Some(conn) = slot.take() else {
                    continue;
                };
                drop(slot);
                match conn.close().await {
                    Ok(()) => report.closed += 1,
                    Err(e) => report.errors.push(e.to_string()),
                }
            }
        }
        for error in &report.errors {
            warn!(error = %error, "Failed to close connection during dispose");
        }
        info!(
            url = %self.shared.url,
            closed = report.closed,
            forced = report.forced,
            "Async connection pool disposed"
        );
        report
    }

    /// Open a connection and run the configured init statements on it.
    async fn open(&self) -> DbResult<C::Connection> {
        let mut conn = self.shared.connector.connect(&self.shared.url).await?;
        for statement in &self.shared.config.init_statements {
            if let Err(e) = conn.execute(statement).await {
                warn!(error = %e, statement = %statement, "Connection init statement failed");
                close_quietly(conn).await;
                return Err(e);
            }
        }
        debug!(url = %self.shared.url, "Opened new pooled connection");
        Ok(conn)
    }

    /// Pop idle connections until one passes validation.
    async fn checkout_idle(&self) -> Option<(C::Connection, Instant)> {
        loop {
            let candidate = {
                let mut idle = self.shared.idle.lock();
                if self.shared.config.use_lifo {
                    idle.pop_back()
                } else {
                    idle.pop_front()
                }
            }?;
            let created = candidate.created;
            if let Some(conn) = self.validate(candidate).await {
                return Some((conn, created));
            }
        }
    }

    async fn validate(&self, idle: IdleConnection<C::Connection>) -> Option<C::Connection> {
        let IdleConnection {
            mut conn,
            created,
            idle_since,
            needs_reset,
        } = idle;

        if let Some(reason) = self.shared.config.expiry(created, idle_since) {
            debug!(reason, "Recycling pooled connection");
            close_quietly(conn).await;
            return None;
        }
        if needs_reset {
            if let Err(e) = conn.execute("ROLLBACK").await {
                warn!(error = %e, "Pending rollback failed; discarding connection");
                close_quietly(conn).await;
                return None;
            }
        }
        if self.shared.config.test_before_acquire {
            if let Err(e) = conn.ping().await {
                debug!(error = %e, "Discarding dead pooled connection");
                close_quietly(conn).await;
                return None;
            }
        }
        Some(conn)
    }

    fn lease(
        &self,
        conn: C::Connection,
        created: Instant,
        mut reservation: Reservation<C>,
    ) -> AsyncPooledConnection<C> {
        let id = self.shared.next_lease.fetch_add(1, Ordering::Relaxed);
        let lease = Arc::new(AsyncLease {
            id,
            conn: tokio::sync::Mutex::new(Some(conn)),
            checked_out_at: Instant::now(),
        });
        self.shared.leases.lock().insert(id, Arc::clone(&lease));
        debug!(lease = id, "Connection checked out");
        AsyncPooledConnection {
            lease,
            created,
            shared: Arc::clone(&self.shared),
            permit: reservation.permit.take(),
            needs_reset: false,
            broken: false,
        }
    }
}

impl<C: AsyncConnector> Shared<C> {
    /// Return a connection. Runs from `Drop`, so closing is handed to the
    /// runtime when one is available and otherwise falls back to dropping.
    ///
    /// Until dispose seals the pool, connections are parked so that dispose
    /// can close them and count them.
    fn release(
        &self,
        lease: &AsyncLease<C::Connection>,
        conn: Option<C::Connection>,
        created: Instant,
        needs_reset: bool,
        broken: bool,
    ) {
        let held_ms = lease.checked_out_at.elapsed().as_millis() as u64;
        self.leases.lock().remove(&lease.id);
        let Some(conn) = conn else {
            debug!(lease = lease.id, held_ms, "Severed connection released");
            return;
        };

        let mut idle = self.idle.lock();
        let discard = broken
            || self.sealed.load(Ordering::SeqCst)
            || idle.len() >= self.config.max as usize;
        if !discard {
            idle.push_back(IdleConnection {
                conn,
                created,
                idle_since: Instant::now(),
                needs_reset,
            });
            drop(idle);
            debug!(lease = lease.id, held_ms, "Connection checked in");
            return;
        }
        drop(idle);

        if broken {
            debug!(lease = lease.id, held_ms, "Connection invalidated");
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_quietly(conn));
            }
            Err(_) => drop(conn),
        }
    }
}

async fn close_quietly<T: AsyncConnection>(conn: T) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Error closing discarded connection");
    }
}

/// A connection checked out of an [`AsyncPool`]; returns itself and its
/// permit on drop.
pub struct AsyncPooledConnection<C: AsyncConnector> {
    lease: Arc<AsyncLease<C::Connection>>,
    created: Instant,
    shared: Arc<Shared<C>>,
    permit: Option<OwnedSemaphorePermit>,
    needs_reset: bool,
    broken: bool,
}

impl<C: AsyncConnector> AsyncPooledConnection<C> {
    /// Access the raw connection. Fails once the pool has severed it.
    pub async fn get_mut(&mut self) -> DbResult<MappedMutexGuard<'_, C::Connection>> {
        if self.is_severed() {
            return Err(severed_error());
        }
        let slot = self.lease.conn.lock().await;
        MutexGuard::try_map(slot, |slot| slot.as_mut()).map_err(|_| severed_error())
    }

    /// Run a statement on the connection.
    pub async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        if self.is_severed() {
            return Err(severed_error());
        }
        if self.shared.config.echo {
            info!(lease = self.lease.id, sql, "Executing statement");
        }
        let mut slot = self.lease.conn.lock().await;
        match slot.as_mut() {
            Some(conn) => conn.execute(sql).await,
            None => Err(severed_error()),
        }
    }

    pub fn is_severed(&self) -> bool {
        self.shared.severed.load(Ordering::SeqCst)
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn mark_needs_reset(&mut self) {
        self.needs_reset = true;
    }
}

impl<C: AsyncConnector> std::fmt::Debug for AsyncPooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPooledConnection")
            .field("lease", &self.lease.id)
            .field("url", &self.shared.url)
            .field("needs_reset", &self.needs_reset)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<C: AsyncConnector> Drop for AsyncPooledConnection<C> {
    fn drop(&mut self) {
        // Dispose holds the slot only while force-closing it.
        let conn = self
            .lease
            .conn
            .try_lock()
            .ok()
            .and_then(|mut slot| slot.take());
        self.shared
            .release(&self.lease, conn, self.created, self.needs_reset, self.broken);
        // Permit goes back only after the connection is parked.
        self.permit.take();
        self.shared
            .checked_out
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryConnector;
    use crate::db::url::build;
    use crate::models::{ConnectionSettings, DatabaseKind};

    fn config(max: u32) -> PoolConfig {
        PoolConfig {
            min: 1,
            max,
            acquire_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            test_before_acquire: true,
            use_lifo: true,
            dispose_grace: Duration::from_millis(100),
            init_statements: Vec::new(),
            echo: false,
        }
    }

    fn pool(connector: &MemoryConnector, config: PoolConfig) -> AsyncPool<MemoryConnector> {
        let settings =
            ConnectionSettings::new(DatabaseKind::MySQL, "localhost", 3306, "u", "p", "db");
        let url = build(&settings, DriverMode::Async).unwrap();
        AsyncPool::new(connector.clone(), url, config)
    }

    #[tokio::test]
    async fn test_warm_up_and_reuse() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(3));
        pool.warm_up().await.unwrap();
        drop(pool.acquire().await.unwrap());
        drop(pool.acquire().await.unwrap());
        assert_eq!(connector.opened(), 1);
        assert_eq!(pool.status().checked_out, 0);
    }

    #[tokio::test]
    async fn test_exhausted_after_timeout() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(1));
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { waited_ms } if waited_ms >= 100));
    }

    #[tokio::test]
    async fn test_waiter_resumes_on_release() {
        let connector = MemoryConnector::new();
        let mut cfg = config(1);
        cfg.acquire_timeout = Duration::from_secs(5);
        let pool = pool(&connector, cfg);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_holds_nothing() {
        let connector = MemoryConnector::new();
        let mut cfg = config(1);
        cfg.acquire_timeout = Duration::from_secs(5);
        let pool = pool(&connector, cfg);
        let held = pool.acquire().await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(abandoned.is_err());
        drop(held);

        let again = tokio::time::timeout(Duration::from_millis(500), pool.acquire()).await;
        assert!(again.is_ok());
        assert_eq!(pool.status().checked_out, 1);
    }

    #[tokio::test]
    async fn test_dead_connection_replaced() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(2));
        drop(pool.acquire().await.unwrap());
        connector.kill_all();
        let mut conn = pool.acquire().await.unwrap();
        assert!(conn.get_mut().await.unwrap().ping().await.is_ok());
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn test_dispose_severs_after_grace() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(2));
        pool.warm_up().await.unwrap();
        let mut held = pool.acquire().await.unwrap();
        let report = pool.dispose_with_grace(Duration::from_millis(20)).await;
        assert_eq!(report.forced, 1);
        assert_eq!(connector.live(), 0);
        assert!(held.get_mut().await.is_err());
        assert!(held.execute("SELECT 1").await.is_err());
        assert!(matches!(
            pool.acquire().await,
            Err(DbError::NotInitialized { .. })
        ));
        drop(held);
        assert_eq!(pool.status().checked_out, 0);
    }

    #[tokio::test]
    async fn test_dispose_waits_for_connect_in_progress() {
        let connector = MemoryConnector::new();
        connector.delay_connections(Duration::from_millis(50));
        let pool = pool(&connector, config(2));
        let opener = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = pool.dispose_with_grace(Duration::from_secs(1)).await;
        assert!(report.is_clean());
        assert!(matches!(
            opener.await.unwrap(),
            Err(DbError::NotInitialized { .. })
        ));
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.live(), 0);
        assert_eq!(pool.status().checked_out, 0);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_connect_outliving_grace_is_closed() {
        let connector = MemoryConnector::new();
        connector.delay_connections(Duration::from_millis(80));
        let pool = pool(&connector, config(2));
        let opener = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = pool.dispose_with_grace(Duration::from_millis(10)).await;
        assert_eq!(report.forced, 1);
        assert!(opener.await.unwrap().is_err());
        assert_eq!(connector.live(), 0);
        assert_eq!(pool.status().checked_out, 0);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_init_statements_and_echo() {
        let connector = MemoryConnector::new();
        let mut cfg = config(1);
        cfg.init_statements = vec!["SET SESSION sql_mode = 'STRICT_TRANS_TABLES'".to_string()];
        cfg.echo = true;
        let pool = pool(&connector, cfg);
        let mut conn = pool.acquire().await.unwrap();
        conn.execute("SELECT 1").await.unwrap();
        drop(conn);
        drop(pool.acquire().await.unwrap());
        assert_eq!(
            connector.statements(),
            vec!["SET SESSION sql_mode = 'STRICT_TRANS_TABLES'", "SELECT 1"]
        );
    }

    #[tokio::test]
    async fn test_dispose_clean_when_idle() {
        let connector = MemoryConnector::new();
        let mut cfg = config(4);
        cfg.min = 2;
        let pool = pool(&connector, cfg);
        pool.warm_up().await.unwrap();
        let report = pool.dispose().await;
        assert!(report.is_clean());
        assert_eq!(report.closed, 2);
        assert_eq!(connector.live(), 0);
        assert_eq!(pool.dispose().await, DisposeReport::default());
    }
}
