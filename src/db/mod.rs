//! Database connectivity layer.
//!
//! This module provides:
//! - Connection URL construction for both driver modes
//! - The driver seam and its sqlx and in-memory implementations
//! - Blocking and async connection pools
//! - Transactional sessions
//! - Pool lifecycle managers and the process-wide manager registry

pub mod async_pool;
pub mod connector;
pub mod manager;
pub mod memory;
pub mod pool;
pub mod session;
pub mod url;

pub use async_pool::{AsyncPool, AsyncPooledConnection};
pub use connector::{
    AsyncConnection, AsyncConnector, BlockingDriverConnection, BlockingSqlxConnector, Connection,
    Connector, DriverConnection, SqlxConnector,
};
pub use manager::{
    AsyncDatabaseManager, AsyncSessionManager, LifecycleState, ManagerRegistry, PoolHandle,
    SessionManager, SyncDatabaseManager,
};
pub use memory::{MemoryConnection, MemoryConnector};
pub use pool::{DisposeReport, Pool, PoolConfig, PoolStatus, PooledConnection};
pub use session::{AsyncSession, Session, SessionFuture};
pub use self::url::{ConnectionUrl, build as build_url, build_pair as build_url_pair};
