//! Scoped sessions over pooled connections.
//!
//! A session owns one checked-out connection for its whole lifetime. The
//! transaction starts lazily with the first statement; `commit()` ends it, and
//! leaving the scope without committing rolls it back. The connection goes
//! back to its pool in every case.

use crate::db::async_pool::AsyncPooledConnection;
use crate::db::connector::{AsyncConnector, Connector};
use crate::db::pool::PooledConnection;
use crate::error::{DbError, DbResult};
use parking_lot::MappedMutexGuard;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, warn};

/// Boxed future returned by the closures passed to
/// [`AsyncDatabaseManager::with_session`](crate::db::AsyncDatabaseManager::with_session).
pub type SessionFuture<'s, T> = Pin<Box<dyn Future<Output = DbResult<T>> + Send + 's>>;

/// Errors other than statement failures leave the connection in an unknown
/// state; such connections are closed rather than reused.
fn poisons_connection(error: &DbError) -> bool {
    !matches!(error, DbError::Database { .. })
}

/// A blocking unit of work bound to one pooled connection.
pub struct Session<C: Connector> {
    conn: PooledConnection<C>,
    in_transaction: bool,
}

impl<C: Connector> Session<C> {
    pub(crate) fn new(conn: PooledConnection<C>) -> Self {
        Self {
            conn,
            in_transaction: false,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Run a statement inside the session's transaction.
    pub fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.begin_if_needed()?;
        let result = self.conn.execute(sql);
        if let Err(e) = &result {
            if poisons_connection(e) {
                self.conn.mark_broken();
            }
        }
        result
    }

    /// The underlying connection, with the transaction already open.
    pub fn connection(&mut self) -> DbResult<MappedMutexGuard<'_, C::Connection>> {
        self.begin_if_needed()?;
        self.conn.get_mut()
    }

    /// Commit the transaction, if one was started.
    pub fn commit(mut self) -> DbResult<()> {
        self.finish("COMMIT")
    }

    /// Roll back the transaction, if one was started.
    pub fn rollback(mut self) -> DbResult<()> {
        self.finish("ROLLBACK")
    }

    fn begin_if_needed(&mut self) -> DbResult<()> {
        if self.in_transaction {
            return Ok(());
        }
        if let Err(e) = self.conn.execute("BEGIN") {
            self.conn.mark_broken();
            return Err(e);
        }
        self.in_transaction = true;
        Ok(())
    }

    fn finish(&mut self, statement: &str) -> DbResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        let result = self.conn.execute(statement).map(|_| ());
        if result.is_err() {
            self.conn.mark_broken();
        }
        result
    }
}

impl<C: Connector> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conn", &self.conn)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl<C: Connector> Drop for Session<C> {
    fn drop(&mut self) {
        if !self.in_transaction || self.conn.is_severed() {
            return;
        }
        debug!("Session dropped without commit; rolling back");
        if let Err(e) = self.finish("ROLLBACK") {
            warn!(error = %e, "Rollback on session drop failed; discarding connection");
        }
    }
}

/// A non-blocking unit of work bound to one pooled connection.
pub struct AsyncSession<C: AsyncConnector> {
    conn: Option<AsyncPooledConnection<C>>,
    in_transaction: bool,
}

impl<C: AsyncConnector> AsyncSession<C> {
    pub(crate) fn new(conn: AsyncPooledConnection<C>) -> Self {
        Self {
            conn: Some(conn),
            in_transaction: false,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Run a statement inside the session's transaction.
    pub async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.begin_if_needed().await?;
        let pooled = self.pooled()?;
        let result = pooled.execute(sql).await;
        if let Err(e) = &result {
            if poisons_connection(e) {
                pooled.mark_broken();
            }
        }
        result
    }

    /// The underlying connection, with the transaction already open.
    pub async fn connection(
        &mut self,
    ) -> DbResult<tokio::sync::MappedMutexGuard<'_, C::Connection>> {
        self.begin_if_needed().await?;
        self.pooled()?.get_mut().await
    }

    pub async fn commit(mut self) -> DbResult<()> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        self.finish("ROLLBACK").await
    }

    fn pooled(&mut self) -> DbResult<&mut AsyncPooledConnection<C>> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("session already released its connection"))
    }

    async fn begin_if_needed(&mut self) -> DbResult<()> {
        if self.in_transaction {
            return Ok(());
        }
        let pooled = self.pooled()?;
        if let Err(e) = pooled.execute("BEGIN").await {
            pooled.mark_broken();
            return Err(e);
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn finish(&mut self, statement: &str) -> DbResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        let pooled = self.pooled()?;
        let result = pooled.execute(statement).await.map(|_| ());
        if result.is_err() {
            pooled.mark_broken();
        }
        result
    }
}

impl<C: AsyncConnector> std::fmt::Debug for AsyncSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSession")
            .field("conn", &self.conn)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl<C: AsyncConnector> Drop for AsyncSession<C> {
    fn drop(&mut self) {
        let Some(mut pooled) = self.conn.take() else {
            return;
        };
        if !self.in_transaction || pooled.is_severed() {
            return;
        }

        // Roll back on the runtime; the connection (and its permit) is
        // released once the rollback finishes.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match pooled.execute("ROLLBACK").await {
                        Ok(_) => debug!("Session dropped without commit; rolled back"),
                        Err(e) => {
                            warn!(error = %e, "Rollback on session drop failed; discarding connection");
                            pooled.mark_broken();
                        }
                    }
                });
            }
            Err(_) => {
                debug!("No runtime available; deferring rollback to next checkout");
                pooled.mark_needs_reset();
            }
        }
    }
}
