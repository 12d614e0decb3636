//! Driver seam for the connection pools.
//!
//! The pools never talk to a database client directly. They open, probe and
//! close connections through the [`Connector`] (blocking) and
//! [`AsyncConnector`] (non-blocking) traits. Production code uses the
//! sqlx-backed connectors in this module; test harnesses can plug in
//! [`MemoryConnector`](crate::db::MemoryConnector).

use crate::db::url::ConnectionUrl;
use crate::error::{DbError, DbResult};
use crate::models::DatabaseKind;
use sqlx::Connection as _;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::debug;

/// A live connection used from blocking code.
pub trait Connection: Send + 'static {
    /// Run a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str) -> DbResult<u64>;

    /// Cheap liveness check.
    fn ping(&mut self) -> DbResult<()>;

    fn close(self) -> DbResult<()>
    where
        Self: Sized;
}

/// Opens blocking connections.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self, url: &ConnectionUrl) -> DbResult<Self::Connection>;
}

/// A live connection used from async tasks.
pub trait AsyncConnection: Send + 'static {
    /// Run a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str) -> impl Future<Output = DbResult<u64>> + Send;

    /// Cheap liveness check.
    fn ping(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn close(self) -> impl Future<Output = DbResult<()>> + Send
    where
        Self: Sized;
}

/// Opens async connections.
pub trait AsyncConnector: Send + Sync + 'static {
    type Connection: AsyncConnection;

    fn connect(
        &self,
        url: &ConnectionUrl,
    ) -> impl Future<Output = DbResult<Self::Connection>> + Send;
}

/// A single sqlx connection to one of the supported backends.
#[derive(Debug)]
pub enum DriverConnection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
}

impl DriverConnection {
    /// Open a connection from a rendered connection URL.
    pub async fn open(url: &ConnectionUrl) -> DbResult<Self> {
        let kind = url.kind();
        let driver_url = url.driver_url();
        debug!(url = %url, "Opening driver connection");

        match kind {
            DatabaseKind::PostgreSQL => {
                let options = PgConnectOptions::from_str(&driver_url).map_err(|e| {
                    DbError::invalid_configuration(format!(
                        "Invalid PostgreSQL connection string: {}",
                        e
                    ))
                })?;
                let conn = PgConnection::connect_with(&options)
                    .await
                    .map_err(|e| connect_error(kind, e))?;
                Ok(Self::Postgres(conn))
            }
            DatabaseKind::MySQL => {
                let options = MySqlConnectOptions::from_str(&driver_url).map_err(|e| {
                    DbError::invalid_configuration(format!(
                        "Invalid MySQL connection string: {}",
                        e
                    ))
                })?;
                let conn = MySqlConnection::connect_with(&options)
                    .await
                    .map_err(|e| connect_error(kind, e))?;
                Ok(Self::MySql(conn))
            }
        }
    }

    pub fn kind(&self) -> DatabaseKind {
        match self {
            Self::Postgres(_) => DatabaseKind::PostgreSQL,
            Self::MySql(_) => DatabaseKind::MySQL,
        }
    }
}

impl AsyncConnection for DriverConnection {
    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        let affected = match self {
            Self::Postgres(conn) => {
                sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql))
                    .await?
                    .rows_affected()
            }
            Self::MySql(conn) => {
                sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql))
                    .await?
                    .rows_affected()
            }
        };
        Ok(affected)
    }

    async fn ping(&mut self) -> DbResult<()> {
        match self {
            Self::Postgres(conn) => conn.ping().await?,
            Self::MySql(conn) => conn.ping().await?,
        }
        Ok(())
    }

    async fn close(self) -> DbResult<()> {
        match self {
            Self::Postgres(conn) => conn.close().await?,
            Self::MySql(conn) => conn.close().await?,
        }
        Ok(())
    }
}

/// Async connector backed by sqlx.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxConnector;

impl AsyncConnector for SqlxConnector {
    type Connection = DriverConnection;

    async fn connect(&self, url: &ConnectionUrl) -> DbResult<DriverConnection> {
        DriverConnection::open(url).await
    }
}

/// Blocking connector that drives sqlx on a private runtime.
///
/// Must not be used from inside an async context: calls block the current
/// thread until the driver finishes. Async callers should use
/// [`SqlxConnector`] or move the work onto `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct BlockingSqlxConnector {
    runtime: Arc<Runtime>,
}

impl BlockingSqlxConnector {
    pub fn new() -> DbResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("dbkit-blocking-driver")
            .enable_all()
            .build()
            .map_err(|e| DbError::internal(format!("Failed to start driver runtime: {}", e)))?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }
}

/// A sqlx connection driven synchronously.
#[derive(Debug)]
pub struct BlockingDriverConnection {
    inner: DriverConnection,
    runtime: Arc<Runtime>,
}

impl Connection for BlockingDriverConnection {
    fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.runtime.block_on(self.inner.execute(sql))
    }

    fn ping(&mut self) -> DbResult<()> {
        self.runtime.block_on(self.inner.ping())
    }

    fn close(self) -> DbResult<()> {
        self.runtime.block_on(self.inner.close())
    }
}

impl Connector for BlockingSqlxConnector {
    type Connection = BlockingDriverConnection;

    fn connect(&self, url: &ConnectionUrl) -> DbResult<BlockingDriverConnection> {
        let inner = self.runtime.block_on(DriverConnection::open(url))?;
        Ok(BlockingDriverConnection {
            inner,
            runtime: Arc::clone(&self.runtime),
        })
    }
}

/// Classify a connect failure, attaching a backend-specific suggestion.
fn connect_error(kind: DatabaseKind, error: sqlx::Error) -> DbError {
    let suggestion = connection_suggestion(kind, &error);
    match DbError::from(error) {
        DbError::ConnectionRefused { message, .. } => {
            DbError::connection_refused(message, suggestion)
        }
        DbError::Database { message, .. } => DbError::connection_refused(message, suggestion),
        other => other,
    }
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(kind: DatabaseKind, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!("Check that the {} server is running and accessible", kind);
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or enable a TLS feature of dbkit".to_string();
    }

    format!(
        "Verify host and port: {} listens on {} by default",
        kind,
        kind.default_port()
    )
}
