//! In-memory connector for test harnesses.
//!
//! [`MemoryConnector`] implements both the blocking and the async connector
//! traits without a database server. It records every statement, counts
//! opened and closed connections, and can inject faults: refusing new
//! connections, rejecting credentials, slowing down connects, killing every
//! live connection, and failing statements that contain a given pattern.

use crate::db::connector::{AsyncConnection, AsyncConnector, Connection, Connector};
use crate::db::url::ConnectionUrl;
use crate::error::{DbError, DbResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct Faults {
    refuse_connections: bool,
    reject_credentials: bool,
    connect_delay: Option<Duration>,
    failing_patterns: Vec<String>,
}

#[derive(Debug, Default)]
struct Backend {
    faults: Mutex<Faults>,
    statements: Mutex<Vec<String>>,
    /// Connections opened before this generation are dead.
    generation: AtomicU64,
    next_id: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Cloneable handle to a shared in-memory backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    backend: Arc<Backend>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.backend.faults.lock().refuse_connections = refuse;
    }

    /// Reject (or accept again) credentials on connect.
    pub fn reject_credentials(&self, reject: bool) {
        self.backend.faults.lock().reject_credentials = reject;
    }

    /// Make every connect take at least `delay`.
    pub fn delay_connections(&self, delay: Duration) {
        self.backend.faults.lock().connect_delay = Some(delay);
    }

    /// Make every statement containing `pattern` fail.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.backend.faults.lock().failing_patterns.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        self.backend.faults.lock().failing_patterns.clear();
    }

    /// Kill every connection opened so far; their next use fails.
    pub fn kill_all(&self) {
        self.backend.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Total connections ever opened.
    pub fn opened(&self) -> usize {
        self.backend.opened.load(Ordering::SeqCst)
    }

    /// Total connections closed or dropped.
    pub fn closed(&self) -> usize {
        self.backend.closed.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn live(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.backend.statements.lock().clone()
    }

    pub fn count_statements(&self, sql: &str) -> usize {
        self.backend
            .statements
            .lock()
            .iter()
            .filter(|s| s.as_str() == sql)
            .count()
    }

    pub fn clear_statements(&self) {
        self.backend.statements.lock().clear();
    }

    fn connect_delay(&self) -> Option<Duration> {
        self.backend.faults.lock().connect_delay
    }

    fn open(&self, url: &ConnectionUrl) -> DbResult<MemoryConnection> {
        let faults = self.backend.faults.lock();
        if faults.refuse_connections {
            return Err(DbError::connection_refused(
                format!("memory backend refused connection to {}", url),
                format!("Check that the {} server is running and accessible", url.kind()),
            ));
        }
        if faults.reject_credentials {
            return Err(DbError::authentication_failed(format!(
                "memory backend rejected credentials for {}",
                url
            )));
        }
        drop(faults);

        let id = self.backend.next_id.fetch_add(1, Ordering::SeqCst);
        self.backend.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            id,
            generation: self.backend.generation.load(Ordering::SeqCst),
            backend: Arc::clone(&self.backend),
        })
    }
}

/// A connection to the in-memory backend.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    generation: u64,
    backend: Arc<Backend>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_alive(&self) -> DbResult<()> {
        if self.generation < self.backend.generation.load(Ordering::SeqCst) {
            return Err(DbError::connection_refused(
                format!("memory connection {} was terminated", self.id),
                "The server closed the connection",
            ));
        }
        Ok(())
    }

    fn run(&mut self, sql: &str) -> DbResult<u64> {
        self.check_alive()?;
        self.backend.statements.lock().push(sql.to_string());
        let faults = self.backend.faults.lock();
        if let Some(pattern) = faults.failing_patterns.iter().find(|p| sql.contains(p.as_str())) {
            return Err(DbError::database(
                format!("statement matched failing pattern '{}'", pattern),
                Some("XX000".to_string()),
            ));
        }
        let affected = match sql.trim().to_ascii_uppercase().as_str() {
            "BEGIN" | "COMMIT" | "ROLLBACK" => 0,
            _ => 1,
        };
        Ok(affected)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.backend.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Connection for MemoryConnection {
    fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.run(sql)
    }

    fn ping(&mut self) -> DbResult<()> {
        self.check_alive()
    }

    fn close(self) -> DbResult<()> {
        Ok(())
    }
}

impl AsyncConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        tokio::task::yield_now().await;
        self.run(sql)
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.check_alive()
    }

    async fn close(self) -> DbResult<()> {
        Ok(())
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn connect(&self, url: &ConnectionUrl) -> DbResult<MemoryConnection> {
        if let Some(delay) = self.connect_delay() {
            std::thread::sleep(delay);
        }
        self.open(url)
    }
}

impl AsyncConnector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, url: &ConnectionUrl) -> DbResult<MemoryConnection> {
        if let Some(delay) = self.connect_delay() {
            tokio::time::sleep(delay).await;
        }
        self.open(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::url::build;
    use crate::models::{ConnectionSettings, DatabaseKind, DriverMode};

    fn url() -> ConnectionUrl {
        let settings =
            ConnectionSettings::new(DatabaseKind::PostgreSQL, "localhost", 5432, "u", "p", "db");
        build(&settings, DriverMode::Sync).unwrap()
    }

    #[test]
    fn test_open_and_close_counts() {
        let connector = MemoryConnector::new();
        let conn = Connector::connect(&connector, &url()).unwrap();
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.live(), 1);
        Connection::close(conn).unwrap();
        assert_eq!(connector.closed(), 1);
        assert_eq!(connector.live(), 0);
    }

    #[test]
    fn test_statements_are_recorded() {
        let connector = MemoryConnector::new();
        let mut conn = Connector::connect(&connector, &url()).unwrap();
        Connection::execute(&mut conn, "BEGIN").unwrap();
        assert_eq!(Connection::execute(&mut conn, "SELECT 1").unwrap(), 1);
        assert_eq!(connector.statements(), vec!["BEGIN", "SELECT 1"]);
        assert_eq!(connector.count_statements("BEGIN"), 1);
    }

    #[test]
    fn test_fault_injection() {
        let connector = MemoryConnector::new();
        connector.refuse_connections(true);
        assert!(matches!(
            Connector::connect(&connector, &url()),
            Err(DbError::ConnectionRefused { .. })
        ));
        connector.refuse_connections(false);
        connector.reject_credentials(true);
        assert!(matches!(
            Connector::connect(&connector, &url()),
            Err(DbError::AuthenticationFailed { .. })
        ));
        connector.reject_credentials(false);

        let mut conn = Connector::connect(&connector, &url()).unwrap();
        connector.fail_on("boom");
        assert!(matches!(
            Connection::execute(&mut conn, "SELECT boom"),
            Err(DbError::Database { .. })
        ));
        connector.clear_failures();
        assert!(Connection::execute(&mut conn, "SELECT boom").is_ok());
    }

    #[test]
    fn test_kill_all_marks_existing_connections_dead() {
        let connector = MemoryConnector::new();
        let mut old = Connector::connect(&connector, &url()).unwrap();
        connector.kill_all();
        let mut fresh = Connector::connect(&connector, &url()).unwrap();
        assert!(Connection::ping(&mut old).is_err());
        assert!(Connection::ping(&mut fresh).is_ok());
    }
}
