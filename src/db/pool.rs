//! Blocking connection pool.
//!
//! A bounded pool guarded by a mutex and two condition variables: `available`
//! wakes callers waiting for a connection, `drained` wakes a disposer waiting
//! for checked-out connections to come back. Connections are validated on
//! checkout (pending reset, idle timeout, max lifetime, ping) and replaced
//! transparently when they fail validation.
//!
//! Every checked-out connection sits in a [`Lease`] shared with the pool, so
//! a dispose that runs out of grace can close connections it does not own.
//!
//! The types shared with the async pool ([`PoolConfig`], [`PoolStatus`],
//! [`DisposeReport`]) live here as well.

use crate::db::connector::{Connection, Connector};
use crate::db::url::ConnectionUrl;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionSettings, DriverMode};
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Effective pool configuration, resolved from [`ConnectionSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min: u32,
    pub max: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub test_before_acquire: bool,
    pub use_lifo: bool,
    pub dispose_grace: Duration,
    /// Run on every new connection before it is handed out.
    pub init_statements: Vec<String>,
    /// Log every statement at info level.
    pub echo: bool,
}

impl PoolConfig {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        let opts = &settings.pool_options;
        Self {
            min: settings.pool_min,
            max: settings.pool_max,
            acquire_timeout: opts.acquire_timeout_or_default(),
            idle_timeout: opts.idle_timeout_or_default(),
            max_lifetime: opts.max_lifetime_or_default(),
            test_before_acquire: opts.test_before_acquire_or_default(),
            use_lifo: opts.use_lifo_or_default(),
            dispose_grace: opts.dispose_grace_or_default(),
            init_statements: settings.init_statements(),
            echo: opts.echo_or_default(),
        }
    }

    /// Why a pooled connection must be recycled, if it must.
    pub(crate) fn expiry(&self, created: Instant, idle_since: Instant) -> Option<&'static str> {
        let now = Instant::now();
        if now.duration_since(created) > self.max_lifetime {
            Some("max lifetime exceeded")
        } else if now.duration_since(idle_since) > self.idle_timeout {
            Some("idle timeout exceeded")
        } else {
            None
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub checked_out: usize,
    pub idle: usize,
    pub max: usize,
}

/// Outcome of disposing a pool.
///
/// Disposal never fails; problems closing connections are collected here and
/// logged as warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisposeReport {
    /// Connections closed during disposal.
    pub closed: usize,
    /// Sessions still checked out when the grace period ran out.
    pub forced: usize,
    pub errors: Vec<String>,
}

impl DisposeReport {
    pub fn is_clean(&self) -> bool {
        self.forced == 0 && self.errors.is_empty()
    }
}

/// A connection resting in the pool.
pub(crate) struct IdleConnection<T> {
    pub conn: T,
    pub created: Instant,
    pub idle_since: Instant,
    pub needs_reset: bool,
}

pub(crate) fn severed_error() -> DbError {
    DbError::connection_refused(
        "connection was severed when its pool was disposed",
        "Acquire a new session after re-initializing the manager",
    )
}

/// Slot of a checked-out connection. Empty once disposal force-closed it.
struct Lease<T> {
    id: u64,
    conn: Mutex<Option<T>>,
    checked_out_at: Instant,
}

struct State<T> {
    idle: VecDeque<IdleConnection<T>>,
    /// Slots held by callers, including connections still being opened.
    checked_out: usize,
    leases: HashMap<u64, Arc<Lease<T>>>,
    next_lease: u64,
    closed: bool,
    closed_on_release: usize,
    release_errors: Vec<String>,
}

struct Shared<C: Connector> {
    connector: C,
    url: ConnectionUrl,
    config: PoolConfig,
    state: Mutex<State<C::Connection>>,
    available: Condvar,
    drained: Condvar,
    severed: AtomicBool,
}

/// Bounded blocking connection pool.
pub struct Pool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("url", &self.shared.url)
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}

impl<C: Connector> Pool<C> {
    /// Create an empty pool. No connection is opened until [`Pool::warm_up`]
    /// or the first checkout.
    pub fn new(connector: C, url: ConnectionUrl, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                url,
                config,
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    checked_out: 0,
                    leases: HashMap::new(),
                    next_lease: 0,
                    closed: false,
                    closed_on_release: 0,
                    release_errors: Vec::new(),
                }),
                available: Condvar::new(),
                drained: Condvar::new(),
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
        let state = self.shared.state.lock();
        PoolStatus {
            checked_out: state.checked_out,
            idle: state.idle.len(),
            max: self.shared.config.max as usize,
        }
    }

    /// Whether disposal gave up waiting and severed outstanding sessions.
    pub fn is_severed(&self) -> bool {
        self.shared.severed.load(Ordering::SeqCst)
    }

    /// Probe connectivity with `SELECT 1` and fill the pool up to `min`.
    ///
    /// The probe connection is kept as the first idle connection.
    pub fn warm_up(&self) -> DbResult<()> {
        let target = self.shared.config.min.max(1) as usize;
        for i in 0..target {
            let mut conn = self.open()?;
            if i == 0 {
                if let Err(e) = conn.execute("SELECT 1") {
                    close_quietly(conn);
                    return Err(e);
                }
                debug!(url = %self.shared.url, "Connectivity probe succeeded");
            }
            let now = Instant::now();
            self.shared.state.lock().idle.push_back(IdleConnection {
                conn,
                created: now,
                idle_since: now,
                needs_reset: false,
            });
        }
        Ok(())
    }

    /// Check out a connection, blocking until one is free or the acquire
    /// timeout expires.
    pub fn acquire(&self) -> DbResult<PooledConnection<C>> {
        let config = &self.shared.config;
        let started = Instant::now();
        let deadline = started + config.acquire_timeout;

        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(DbError::not_initialized(DriverMode::Sync.to_string()));
            }

            let candidate = if config.use_lifo {
                state.idle.pop_back()
            } else {
                state.idle.pop_front()
            };
            if let Some(idle) = candidate {
                state.checked_out += 1;
                drop(state);
                return self.checkout_idle(idle);
            }

            if state.checked_out < config.max as usize {
                state.checked_out += 1;
                drop(state);
                return self.open_reserved();
            }

            let timed_out = self
                .shared
                .available
                .wait_until(&mut state, deadline)
                .timed_out();
            if timed_out
                && !state.closed
                && state.idle.is_empty()
                && state.checked_out >= config.max as usize
            {
                let waited = started.elapsed();
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    max = config.max,
                    "Connection pool exhausted"
                );
                return Err(DbError::pool_exhausted(waited));
            }
        }
    }

    /// Close idle connections, wait up to the configured grace period for
    /// checked-out ones, then force-close whatever is still outstanding.
    pub fn dispose(&self) -> DisposeReport {
        self.dispose_with_grace(self.shared.config.dispose_grace)
    }

    pub fn dispose_with_grace(&self, grace: Duration) -> DisposeReport {
        let idle: Vec<_> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return DisposeReport::default();
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.shared.available.notify_all();

        let mut report = DisposeReport::default();
        for idle in idle {
            match idle.conn.close() {
                Ok(()) => report.closed += 1,
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        let deadline = Instant::now() + grace;
        let mut state = self.shared.state.lock();
        while state.checked_out > 0 {
            if self
                .shared
                .drained
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        report.closed += std::mem::take(&mut state.closed_on_release);
        report.errors.append(&mut state.release_errors);
        report.forced = state.checked_out;
        let outstanding: Vec<_> = if report.forced > 0 {
            self.shared.severed.store(true, Ordering::SeqCst);
            state.leases.values().cloned().collect()
        } else {
            Vec::new()
        };
        drop(state);

        if report.forced > 0 {
            warn!(
                forced = report.forced,
                grace_ms = grace.as_millis() as u64,
                "Sessions still checked out after grace period; closing their connections"
            );
            for lease in outstanding {
                // A statement in flight holds the slot; give it one more grace period.
                let Some(mut slot) = lease.conn.try_lock_for(grace) else {
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
                match conn.close() {
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
            "Blocking connection pool disposed"
        );
        report
    }

    /// Open a connection and run the configured init statements on it.
    fn open(&self) -> DbResult<C::Connection> {
        let mut conn = self.shared.connector.connect(&self.shared.url)?;
        for statement in &self.shared.config.init_statements {
            if let Err(e) = conn.execute(statement) {
                warn!(error = %e, statement = %statement, "Connection init statement failed");
                close_quietly(conn);
                return Err(e);
            }
        }
        debug!(url = %self.shared.url, "Opened new pooled connection");
        Ok(conn)
    }

    fn checkout_idle(&self, idle: IdleConnection<C::Connection>) -> DbResult<PooledConnection<C>> {
        let created = idle.created;
        match self.validate(idle) {
            Some(conn) => self.lease(conn, created),
            None => self.open_reserved(),
        }
    }

    /// Apply a pending reset and the recycle rules; `None` means the
    /// connection was discarded.
    fn validate(&self, idle: IdleConnection<C::Connection>) -> Option<C::Connection> {
        let IdleConnection {
            mut conn,
            created,
            idle_since,
            needs_reset,
        } = idle;

        if let Some(reason) = self.shared.config.expiry(created, idle_since) {
            debug!(reason, "Recycling pooled connection");
            close_quietly(conn);
            return None;
        }
        if needs_reset {
            if let Err(e) = conn.execute("ROLLBACK") {
                warn!(error = %e, "Pending rollback failed; discarding connection");
                close_quietly(conn);
                return None;
            }
        }
        if self.shared.config.test_before_acquire {
            if let Err(e) = conn.ping() {
                debug!(error = %e, "Discarding dead pooled connection");
                close_quietly(conn);
                return None;
            }
        }
        Some(conn)
    }

    /// Open a new connection into a slot already counted as checked out.
    fn open_reserved(&self) -> DbResult<PooledConnection<C>> {
        match self.open() {
            Ok(conn) => self.lease(conn, Instant::now()),
            Err(e) => {
                self.shared.release_slot();
                Err(e)
            }
        }
    }

    /// Hand a validated connection to the caller, unless the pool was
    /// disposed while it was being prepared.
    fn lease(&self, conn: C::Connection, created: Instant) -> DbResult<PooledConnection<C>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            close_quietly(conn);
            self.shared.release_slot();
            return Err(DbError::not_initialized(DriverMode::Sync.to_string()));
        }
        let id = state.next_lease;
        state.next_lease += 1;
        let lease = Arc::new(Lease {
            id,
            conn: Mutex::new(Some(conn)),
            checked_out_at: Instant::now(),
        });
        state.leases.insert(id, Arc::clone(&lease));
        drop(state);

        debug!(lease = id, "Connection checked out");
        Ok(PooledConnection {
            lease,
            created,
            shared: Arc::clone(&self.shared),
            needs_reset: false,
            broken: false,
        })
    }
}

impl<C: Connector> Shared<C> {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        let drained = state.checked_out == 0;
        drop(state);
        self.available.notify_one();
        if drained {
            self.drained.notify_all();
        }
    }

    fn release(
        &self,
        lease: &Lease<C::Connection>,
        conn: Option<C::Connection>,
        created: Instant,
        needs_reset: bool,
        broken: bool,
    ) {
        let held_ms = lease.checked_out_at.elapsed().as_millis() as u64;
        let mut state = self.state.lock();
        state.leases.remove(&lease.id);
        let Some(conn) = conn else {
            drop(state);
            debug!(lease = lease.id, held_ms, "Severed connection released");
            self.release_slot();
            return;
        };

        let discard = state.closed || broken || self.severed.load(Ordering::SeqCst);
        if !discard {
            state.idle.push_back(IdleConnection {
                conn,
                created,
                idle_since: Instant::now(),
                needs_reset,
            });
            state.checked_out = state.checked_out.saturating_sub(1);
            drop(state);
            self.available.notify_one();
            debug!(lease = lease.id, held_ms, "Connection checked in");
            return;
        }
        drop(state);

        if broken {
            debug!(lease = lease.id, held_ms, "Connection invalidated");
        }
        let result = conn.close();
        let mut state = self.state.lock();
        match result {
            Ok(()) if state.closed => state.closed_on_release += 1,
            Err(e) if state.closed => state.release_errors.push(e.to_string()),
            Err(e) => debug!(error = %e, "Failed to close discarded connection"),
            Ok(()) => {}
        }
        drop(state);
        self.release_slot();
    }
}

fn close_quietly<T: Connection>(conn: T) {
    if let Err(e) = conn.close() {
        debug!(error = %e, "Error closing discarded connection");
    }
}

/// A connection checked out of a [`Pool`]; returns itself on drop.
pub struct PooledConnection<C: Connector> {
    lease: Arc<Lease<C::Connection>>,
    created: Instant,
    shared: Arc<Shared<C>>,
    needs_reset: bool,
    broken: bool,
}

impl<C: Connector> PooledConnection<C> {
    /// Access the raw connection. Fails once the pool has severed it.
    pub fn get_mut(&mut self) -> DbResult<MappedMutexGuard<'_, C::Connection>> {
        if self.is_severed() {
            return Err(severed_error());
        }
        MutexGuard::try_map(self.lease.conn.lock(), |slot| slot.as_mut())
            .map_err(|_| severed_error())
    }

    /// Run a statement on the connection.
    pub fn execute(&mut self, sql: &str) -> DbResult<u64> {
        if self.shared.config.echo {
            info!(lease = self.lease.id, sql, "Executing statement");
        }
        self.get_mut()?.execute(sql)
    }

    pub fn is_severed(&self) -> bool {
        self.shared.severed.load(Ordering::SeqCst)
    }

    /// Close the connection instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Roll back on next checkout before handing the connection out.
    pub fn mark_needs_reset(&mut self) {
        self.needs_reset = true;
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("lease", &self.lease.id)
            .field("url", &self.shared.url)
            .field("needs_reset", &self.needs_reset)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let conn = self.lease.conn.lock().take();
        self.shared
            .release(&self.lease, conn, self.created, self.needs_reset, self.broken);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryConnector;
    use crate::db::url::build;
    use crate::models::DatabaseKind;
    use std::thread;

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

    fn pool(connector: &MemoryConnector, config: PoolConfig) -> Pool<MemoryConnector> {
        let settings =
            ConnectionSettings::new(DatabaseKind::PostgreSQL, "localhost", 5432, "u", "p", "db");
        let url = build(&settings, DriverMode::Sync).unwrap();
        Pool::new(connector.clone(), url, config)
    }

    #[test]
    fn test_config_from_settings_defaults() {
        let settings =
            ConnectionSettings::new(DatabaseKind::MySQL, "localhost", 3306, "u", "p", "db")
                .with_pool_bounds(2, 7);
        let config = PoolConfig::from_settings(&settings);
        assert_eq!(config.min, 2);
        assert_eq!(config.max, 7);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert!(config.use_lifo);
        assert_eq!(
            config.init_statements,
            vec!["SET SESSION sql_mode = 'STRICT_TRANS_TABLES'"]
        );
        assert!(!config.echo);
    }

    #[test]
    fn test_init_statements_run_once_per_connection() {
        let connector = MemoryConnector::new();
        let mut cfg = config(2);
        cfg.init_statements = vec![
            "SET SESSION sql_mode = 'STRICT_TRANS_TABLES'".to_string(),
            "SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED".to_string(),
        ];
        let pool = pool(&connector, cfg);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);
        drop(b);
        drop(pool.acquire().unwrap());
        assert_eq!(connector.opened(), 2);
        assert_eq!(
            connector.count_statements("SET SESSION sql_mode = 'STRICT_TRANS_TABLES'"),
            2
        );
        assert_eq!(
            connector.statements()[..2],
            [
                "SET SESSION sql_mode = 'STRICT_TRANS_TABLES'",
                "SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED",
            ]
        );
    }

    #[test]
    fn test_failed_init_statement_releases_slot() {
        let connector = MemoryConnector::new();
        connector.fail_on("sql_mode");
        let mut cfg = config(1);
        cfg.init_statements = vec!["SET SESSION sql_mode = 'BOGUS'".to_string()];
        let pool = pool(&connector, cfg);
        assert!(matches!(pool.acquire(), Err(DbError::Database { .. })));
        assert_eq!(pool.status().checked_out, 0);
        assert_eq!(connector.live(), 0);
    }

    #[test]
    fn test_warm_up_probes_and_fills_min() {
        let connector = MemoryConnector::new();
        let mut cfg = config(5);
        cfg.min = 3;
        let pool = pool(&connector, cfg);
        pool.warm_up().unwrap();
        assert_eq!(connector.opened(), 3);
        assert_eq!(connector.count_statements("SELECT 1"), 1);
        assert_eq!(pool.status().idle, 3);
    }

    #[test]
    fn test_reuses_idle_connection() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(2));
        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());
        assert_eq!(connector.opened(), 1);
        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().checked_out, 0);
    }

    #[test]
    fn test_exhausted_after_timeout() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(2));
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        let started = Instant::now();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.status().checked_out, 2);
    }

    #[test]
    fn test_blocked_acquire_resumes_on_release() {
        let connector = MemoryConnector::new();
        let mut cfg = config(1);
        cfg.acquire_timeout = Duration::from_secs(5);
        let pool = pool(&connector, cfg);
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(connector.opened(), 1);
    }

    #[test]
    fn test_dead_connection_replaced_transparently() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(2));
        drop(pool.acquire().unwrap());
        connector.kill_all();
        let mut conn = pool.acquire().unwrap();
        assert!(conn.get_mut().unwrap().ping().is_ok());
        assert_eq!(connector.opened(), 2);
    }

    #[test]
    fn test_expired_connection_recycled() {
        let connector = MemoryConnector::new();
        let mut cfg = config(2);
        cfg.idle_timeout = Duration::from_millis(5);
        let pool = pool(&connector, cfg);
        drop(pool.acquire().unwrap());
        thread::sleep(Duration::from_millis(20));
        drop(pool.acquire().unwrap());
        assert_eq!(connector.opened(), 2);
        assert_eq!(connector.live(), 1);
    }

    #[test]
    fn test_pending_reset_applied_on_checkout() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(1));
        let mut conn = pool.acquire().unwrap();
        conn.mark_needs_reset();
        drop(conn);
        drop(pool.acquire().unwrap());
        assert_eq!(connector.count_statements("ROLLBACK"), 1);
    }

    #[test]
    fn test_failed_open_releases_slot() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(1));
        connector.refuse_connections(true);
        assert!(matches!(
            pool.acquire(),
            Err(DbError::ConnectionRefused { .. })
        ));
        assert_eq!(pool.status().checked_out, 0);
        connector.refuse_connections(false);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_dispose_closes_idle_and_rejects_acquire() {
        let connector = MemoryConnector::new();
        let mut cfg = config(3);
        cfg.min = 2;
        let pool = pool(&connector, cfg);
        pool.warm_up().unwrap();
        let report = pool.dispose();
        assert_eq!(report.closed, 2);
        assert!(report.is_clean());
        assert_eq!(connector.live(), 0);
        assert!(matches!(
            pool.acquire(),
            Err(DbError::NotInitialized { .. })
        ));
    }

    #[test]
    fn test_dispose_waits_for_returning_session() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(2));
        let held = pool.acquire().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        let report = pool.dispose_with_grace(Duration::from_secs(2));
        releaser.join().unwrap();
        assert_eq!(report.forced, 0);
        assert_eq!(report.closed, 1);
        assert_eq!(connector.live(), 0);
    }

    #[test]
    fn test_dispose_severs_after_grace() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, config(2));
        let mut held = pool.acquire().unwrap();
        let report = pool.dispose_with_grace(Duration::from_millis(20));
        assert_eq!(report.forced, 1);
        assert_eq!(report.closed, 1);
        assert!(!report.is_clean());
        assert_eq!(connector.live(), 0);
        assert!(held.get_mut().is_err());
        assert!(held.execute("SELECT 1").is_err());
        drop(held);
        assert_eq!(connector.live(), 0);
        assert_eq!(pool.status().checked_out, 0);
    }

    #[test]
    fn test_dispose_during_open_closes_new_connection() {
        let connector = MemoryConnector::new();
        connector.delay_connections(Duration::from_millis(50));
        let pool = pool(&connector, config(2));
        let opener = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(10));

        let report = pool.dispose_with_grace(Duration::from_secs(1));
        assert!(report.is_clean());
        assert!(matches!(
            opener.join().unwrap(),
            Err(DbError::NotInitialized { .. })
        ));
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.live(), 0);
        assert_eq!(pool.status().checked_out, 0);
        assert_eq!(pool.status().idle, 0);
    }
}
