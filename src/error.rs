//! Error types for dbkit.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Configuration and dialect errors are meant to be fatal at startup; pool exhaustion
//! and connectivity errors are surfaced to the caller, who decides whether to retry.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Unsupported database dialect: {dialect}")]
    UnsupportedDialect { dialect: String },

    #[error("{mode} database manager is already initialized; dispose it first")]
    AlreadyInitialized { mode: String },

    #[error("{mode} database manager is not initialized; call init() first")]
    NotInitialized { mode: String },

    #[error("Connection refused: {message}")]
    ConnectionRefused { message: String, suggestion: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Connection pool exhausted: no connection became available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Clock moved backward by {drift_ms}ms; refusing to generate id")]
    ClockMovedBackward { drift_ms: i64 },

    #[error("Duplicate table name '{table}' declared by '{first}' and '{second}'")]
    DuplicateTableName {
        table: String,
        first: String,
        second: String,
    },

    #[error("Model discovery failed in '{module}': {message}")]
    DiscoveryError { module: String, message: String },

    #[error("Model registry has not completed discovery")]
    RegistryNotReady,

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error(
        "Refusing to run {operation} against the {environment} environment without explicit confirmation"
    )]
    ConfirmationRequired {
        operation: String,
        environment: String,
    },

    #[error("Migration command '{command}' failed: {message}")]
    Migration { command: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create an unsupported dialect error.
    pub fn unsupported_dialect(dialect: impl Into<String>) -> Self {
        Self::UnsupportedDialect {
            dialect: dialect.into(),
        }
    }

    pub fn already_initialized(mode: impl Into<String>) -> Self {
        Self::AlreadyInitialized { mode: mode.into() }
    }

    pub fn not_initialized(mode: impl Into<String>) -> Self {
        Self::NotInitialized { mode: mode.into() }
    }

    /// Create a connection refused error with a helpful suggestion.
    pub fn connection_refused(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConnectionRefused {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error for a wait of the given length.
    pub fn pool_exhausted(waited: std::time::Duration) -> Self {
        Self::PoolExhausted {
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn clock_moved_backward(drift_ms: i64) -> Self {
        Self::ClockMovedBackward { drift_ms }
    }

    pub fn duplicate_table_name(
        table: impl Into<String>,
        first: impl Into<String>,
        second: impl Into<String>,
    ) -> Self {
        Self::DuplicateTableName {
            table: table.into(),
            first: first.into(),
            second: second.into(),
        }
    }

    pub fn discovery(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DiscoveryError {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    pub fn confirmation_required(
        operation: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self::ConfirmationRequired {
            operation: operation.into(),
            environment: environment.into(),
        }
    }

    pub fn migration(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Migration {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionRefused { suggestion, .. } => Some(suggestion),
            Self::AuthenticationFailed { .. } => {
                Some("Verify the username and password in the connection settings")
            }
            Self::PoolExhausted { .. } => {
                Some("Release sessions sooner, raise pool_max or increase the acquire timeout")
            }
            Self::RegistryNotReady => Some("Run model discovery before autogenerating revisions"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The core never retries on its own; callers use this to decide.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. } | Self::PoolExhausted { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::invalid_configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                if code.as_deref().is_some_and(is_auth_failure_code) {
                    DbError::authentication_failed(db_err.message())
                } else {
                    DbError::database(db_err.message(), code)
                }
            }
            sqlx::Error::Io(io_err) => DbError::connection_refused(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection_refused(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection_refused(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted { waited_ms: 0 },
            sqlx::Error::PoolClosed => DbError::not_initialized("driver"),
            sqlx::Error::RowNotFound => DbError::database("No rows returned", None),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// SQLSTATE / server codes that mean the credentials were rejected.
fn is_auth_failure_code(code: &str) -> bool {
    // 28P01/28000: PostgreSQL; 1045: MySQL "Access denied for user".
    matches!(code, "28P01" | "28000" | "1045")
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
