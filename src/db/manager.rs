//! Connection pool lifecycle managers.
//!
//! [`SyncDatabaseManager`] and [`AsyncDatabaseManager`] own at most one pool
//! at a time and move through `uninitialized -> ready -> disposed`. A disposed
//! manager may be initialized again. [`ManagerRegistry`] gives an application
//! one process-wide slot per mode without preventing independent instances.

use crate::db::async_pool::AsyncPool;
use crate::db::connector::{AsyncConnector, BlockingSqlxConnector, Connector, SqlxConnector};
use crate::db::pool::{DisposeReport, Pool, PoolConfig, PoolStatus};
use crate::db::session::{AsyncSession, Session, SessionFuture};
use crate::db::url::{self, ConnectionUrl};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionSettings, DriverMode};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Where a manager is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    Disposed,
}

/// The live pool of a ready manager and the settings it was built from.
#[derive(Debug, Clone)]
pub struct PoolHandle<P> {
    pool: P,
    settings: ConnectionSettings,
}

impl<P> PoolHandle<P> {
    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
}

#[derive(Debug)]
enum Lifecycle<P> {
    Uninitialized,
    Ready(PoolHandle<P>),
    Disposed,
}

impl<P> Lifecycle<P> {
    fn state(&self) -> LifecycleState {
        match self {
            Self::Uninitialized => LifecycleState::Uninitialized,
            Self::Ready(_) => LifecycleState::Ready,
            Self::Disposed => LifecycleState::Disposed,
        }
    }
}

/// Capability shape of the blocking manager.
pub trait SessionManager {
    type Session;

    fn init(&self, settings: ConnectionSettings) -> DbResult<()>;

    fn acquire_session(&self) -> DbResult<Self::Session>;

    fn dispose(&self) -> DisposeReport;

    fn state(&self) -> LifecycleState;
}

/// Capability shape of the async manager.
pub trait AsyncSessionManager {
    type Session;

    fn init(&self, settings: ConnectionSettings) -> impl Future<Output = DbResult<()>> + Send;

    fn acquire_session(&self) -> impl Future<Output = DbResult<Self::Session>> + Send;

    fn dispose(&self) -> impl Future<Output = DisposeReport> + Send;

    fn state(&self) -> impl Future<Output = LifecycleState> + Send;
}

fn prepare(settings: &ConnectionSettings, mode: DriverMode) -> DbResult<ConnectionUrl> {
    settings.validate()?;
    url::build(settings, mode)
}

/// Blocking pool manager. Call it from plain threads, not from async tasks.
pub struct SyncDatabaseManager<C: Connector + Clone = BlockingSqlxConnector> {
    connector: C,
    lifecycle: parking_lot::RwLock<Lifecycle<Pool<C>>>,
}

impl SyncDatabaseManager<BlockingSqlxConnector> {
    /// Manager backed by sqlx on a private driver runtime.
    pub fn with_sqlx() -> DbResult<Self> {
        Ok(Self::new(BlockingSqlxConnector::new()?))
    }
}

impl<C: Connector + Clone> SyncDatabaseManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            lifecycle: parking_lot::RwLock::new(Lifecycle::Uninitialized),
        }
    }

    /// The ready pool handle, if any.
    pub fn handle(&self) -> DbResult<PoolHandle<Pool<C>>> {
        match &*self.lifecycle.read() {
            Lifecycle::Ready(handle) => Ok(handle.clone()),
            _ => Err(DbError::not_initialized(DriverMode::Sync.to_string())),
        }
    }

    pub fn status(&self) -> DbResult<PoolStatus> {
        Ok(self.handle()?.pool.status())
    }

    /// Run `f` in a session: commit when it returns `Ok`, roll back when it
    /// returns `Err`.
    pub fn with_session<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Session<C>) -> DbResult<T>,
    {
        let mut session = self.acquire_session()?;
        match f(&mut session) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = session.rollback() {
                    warn!(error = %rollback_err, "Rollback after failed session scope failed");
                }
                Err(e)
            }
        }
    }
}

impl<C: Connector + Clone> SessionManager for SyncDatabaseManager<C> {
    type Session = Session<C>;

    fn init(&self, settings: ConnectionSettings) -> DbResult<()> {
        let mut lifecycle = self.lifecycle.write();
        if matches!(*lifecycle, Lifecycle::Ready(_)) {
            return Err(DbError::already_initialized(DriverMode::Sync.to_string()));
        }

        let url = prepare(&settings, DriverMode::Sync)?;
        info!(
            kind = %settings.kind,
            url = %url,
            pool_min = settings.pool_min,
            pool_max = settings.pool_max,
            "Initializing blocking connection pool"
        );
        let pool = Pool::new(
            self.connector.clone(),
            url,
            PoolConfig::from_settings(&settings),
        );
        if let Err(e) = pool.warm_up() {
            warn!(error = %e, endpoint = %settings.endpoint(), "Connectivity probe failed");
            pool.dispose();
            return Err(e);
        }

        *lifecycle = Lifecycle::Ready(PoolHandle { pool, settings });
        info!("Blocking connection pool ready");
        Ok(())
    }

    fn acquire_session(&self) -> DbResult<Session<C>> {
        let pool = self.handle()?.pool;
        Ok(Session::new(pool.acquire()?))
    }

    fn dispose(&self) -> DisposeReport {
        let pool = {
            let mut lifecycle = self.lifecycle.write();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Disposed) {
                Lifecycle::Ready(handle) => handle.pool,
                other => {
                    *lifecycle = other;
                    return DisposeReport::default();
                }
            }
        };
        pool.dispose()
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.read().state()
    }
}

impl<C: Connector + Clone> std::fmt::Debug for SyncDatabaseManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDatabaseManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Async pool manager.
pub struct AsyncDatabaseManager<C: AsyncConnector + Clone = SqlxConnector> {
    connector: C,
    lifecycle: RwLock<Lifecycle<AsyncPool<C>>>,
}

impl Default for AsyncDatabaseManager<SqlxConnector> {
    fn default() -> Self {
        Self::new(SqlxConnector)
    }
}

impl<C: AsyncConnector + Clone> AsyncDatabaseManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
        }
    }

    pub async fn handle(&self) -> DbResult<PoolHandle<AsyncPool<C>>> {
        match &*self.lifecycle.read().await {
            Lifecycle::Ready(handle) => Ok(handle.clone()),
            _ => Err(DbError::not_initialized(DriverMode::Async.to_string())),
        }
    }

    pub async fn status(&self) -> DbResult<PoolStatus> {
        Ok(self.handle().await?.pool.status())
    }

    /// Run `f` in a session: commit when it resolves to `Ok`, roll back when
    /// it resolves to `Err`.
    ///
    /// ```ignore
    /// manager
    ///     .with_session(|s| Box::pin(async move { s.execute("UPDATE t SET x = 1").await }))
    ///     .await?;
    /// ```
    pub async fn with_session<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'s> FnOnce(&'s mut AsyncSession<C>) -> SessionFuture<'s, T>,
    {
        let mut session = self.acquire_session().await?;
        match f(&mut session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed session scope failed");
                }
                Err(e)
            }
        }
    }
}

impl<C: AsyncConnector + Clone> AsyncSessionManager for AsyncDatabaseManager<C> {
    type Session = AsyncSession<C>;

    async fn init(&self, settings: ConnectionSettings) -> DbResult<()> {
        let mut lifecycle = self.lifecycle.write().await;
        if matches!(*lifecycle, Lifecycle::Ready(_)) {
            return Err(DbError::already_initialized(DriverMode::Async.to_string()));
        }

        let url = prepare(&settings, DriverMode::Async)?;
        info!(
            kind = %settings.kind,
            url = %url,
            pool_min = settings.pool_min,
            pool_max = settings.pool_max,
            "Initializing async connection pool"
        );
        let pool = AsyncPool::new(
            self.connector.clone(),
            url,
            PoolConfig::from_settings(&settings),
        );
        if let Err(e) = pool.warm_up().await {
            warn!(error = %e, endpoint = %settings.endpoint(), "Connectivity probe failed");
            pool.dispose().await;
            return Err(e);
        }

        *lifecycle = Lifecycle::Ready(PoolHandle { pool, settings });
        info!("Async connection pool ready");
        Ok(())
    }

    async fn acquire_session(&self) -> DbResult<AsyncSession<C>> {
        let pool = self.handle().await?.pool;
        Ok(AsyncSession::new(pool.acquire().await?))
    }

    async fn dispose(&self) -> DisposeReport {
        let pool = {
            let mut lifecycle = self.lifecycle.write().await;
            match std::mem::replace(&mut *lifecycle, Lifecycle::Disposed) {
                Lifecycle::Ready(handle) => handle.pool,
                other => {
                    *lifecycle = other;
                    return DisposeReport::default();
                }
            }
        };
        pool.dispose().await
    }

    async fn state(&self) -> LifecycleState {
        self.lifecycle.read().await.state()
    }
}

impl<C: AsyncConnector + Clone> std::fmt::Debug for AsyncDatabaseManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDatabaseManager")
            .finish_non_exhaustive()
    }
}

/// Process-scoped slots holding at most one manager per mode.
pub struct ManagerRegistry<S = BlockingSqlxConnector, A = SqlxConnector>
where
    S: Connector + Clone,
    A: AsyncConnector + Clone,
{
    sync: parking_lot::RwLock<Option<Arc<SyncDatabaseManager<S>>>>,
    async_: parking_lot::RwLock<Option<Arc<AsyncDatabaseManager<A>>>>,
}

impl<S, A> Default for ManagerRegistry<S, A>
where
    S: Connector + Clone,
    A: AsyncConnector + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, A> ManagerRegistry<S, A>
where
    S: Connector + Clone,
    A: AsyncConnector + Clone,
{
    pub fn new() -> Self {
        Self {
            sync: parking_lot::RwLock::new(None),
            async_: parking_lot::RwLock::new(None),
        }
    }

    /// Install the blocking manager; fails if one is already installed.
    pub fn install_sync(
        &self,
        manager: SyncDatabaseManager<S>,
    ) -> DbResult<Arc<SyncDatabaseManager<S>>> {
        let mut slot = self.sync.write();
        if slot.is_some() {
            return Err(DbError::already_initialized(DriverMode::Sync.to_string()));
        }
        let manager = Arc::new(manager);
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    pub fn install_async(
        &self,
        manager: AsyncDatabaseManager<A>,
    ) -> DbResult<Arc<AsyncDatabaseManager<A>>> {
        let mut slot = self.async_.write();
        if slot.is_some() {
            return Err(DbError::already_initialized(DriverMode::Async.to_string()));
        }
        let manager = Arc::new(manager);
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    pub fn sync_manager(&self) -> DbResult<Arc<SyncDatabaseManager<S>>> {
        self.sync
            .read()
            .clone()
            .ok_or_else(|| DbError::not_initialized(DriverMode::Sync.to_string()))
    }

    pub fn async_manager(&self) -> DbResult<Arc<AsyncDatabaseManager<A>>> {
        self.async_
            .read()
            .clone()
            .ok_or_else(|| DbError::not_initialized(DriverMode::Async.to_string()))
    }

    /// Remove the blocking manager and dispose it.
    pub fn teardown_sync(&self) -> Option<DisposeReport> {
        let manager = self.sync.write().take()?;
        Some(manager.dispose())
    }

    /// Remove the async manager and dispose it.
    pub async fn teardown_async(&self) -> Option<DisposeReport> {
        let manager = self.async_.write().take()?;
        Some(manager.dispose().await)
    }
}

/// The process-wide manager registry.
pub fn global() -> &'static ManagerRegistry {
    static GLOBAL: OnceLock<ManagerRegistry> = OnceLock::new();
    GLOBAL.get_or_init(ManagerRegistry::new)
}
