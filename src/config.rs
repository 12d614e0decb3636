//! Configuration handling for dbkit.
//!
//! Pool defaults, pool tuning options, environment-variable sourced connection
//! settings, and the command-line configuration of the `dbkit` binary.

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionSettings, DatabaseKind, IsolationLevel};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_POOL_MIN: u32 = 1;
pub const DEFAULT_POOL_MAX: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_MAX_LIFETIME_MS: u64 = 3_600_000;
pub const DEFAULT_DISPOSE_GRACE_MS: u64 = 5_000;
pub const DEFAULT_MYSQL_CHARSET: &str = "utf8mb4";
pub const DEFAULT_MYSQL_SQL_MODE: &str = "STRICT_TRANS_TABLES";

/// Environment variable prefix for the default connection profile.
pub const ENV_PREFIX: &str = "DATABASE_";

/// Prefix of environment variables carrying driver options, after `ENV_PREFIX`.
const OPTION_KEY_PREFIX: &str = "OPTION_";

/// Connection pool tuning options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// How long a caller waits for a free connection (default: 30s)
    pub acquire_timeout_ms: Option<u64>,
    /// Idle connections older than this are recycled on checkout (default: 600s)
    pub idle_timeout_ms: Option<u64>,
    /// Connections older than this are recycled on checkout (default: 3600s)
    pub max_lifetime_ms: Option<u64>,
    /// Whether to ping connections before handing them out (default: true)
    pub test_before_acquire: Option<bool>,
    /// Reuse the most recently returned connection first (default: true)
    pub use_lifo: Option<bool>,
    /// How long dispose waits for checked-out sessions (default: 5s)
    pub dispose_grace_ms: Option<u64>,
    /// MySQL connection charset (default: utf8mb4)
    pub charset: Option<String>,
    /// Transaction isolation set on every new connection (default: server default)
    pub isolation_level: Option<IsolationLevel>,
    /// MySQL `sql_mode` set on every new connection (default: STRICT_TRANS_TABLES)
    pub mysql_sql_mode: Option<String>,
    /// Extra statement run on every new MySQL connection
    pub mysql_init_command: Option<String>,
    /// Log every statement at info level (default: false)
    pub echo: Option<bool>,
}

impl PoolOptions {
    pub fn acquire_timeout_or_default(&self) -> Duration {
        Duration::from_millis(
            self.acquire_timeout_ms
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_MS),
        )
    }

    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS))
    }

    pub fn max_lifetime_or_default(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms.unwrap_or(DEFAULT_MAX_LIFETIME_MS))
    }

    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    pub fn use_lifo_or_default(&self) -> bool {
        self.use_lifo.unwrap_or(true)
    }

    pub fn dispose_grace_or_default(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms.unwrap_or(DEFAULT_DISPOSE_GRACE_MS))
    }

    pub fn charset_or_default(&self) -> &str {
        self.charset.as_deref().unwrap_or(DEFAULT_MYSQL_CHARSET)
    }

    pub fn mysql_sql_mode_or_default(&self) -> &str {
        self.mysql_sql_mode.as_deref().unwrap_or(DEFAULT_MYSQL_SQL_MODE)
    }

    pub fn echo_or_default(&self) -> bool {
        self.echo.unwrap_or(false)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.acquire_timeout_ms == Some(0) {
            return Err("acquire_timeout must be greater than 0".to_string());
        }
        if self.max_lifetime_ms == Some(0) {
            return Err("max_lifetime must be greater than 0".to_string());
        }
        if let Some(charset) = &self.charset {
            if charset.is_empty() || !charset.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(format!("invalid charset: '{}'", charset));
            }
        }
        if let Some(mode) = &self.mysql_sql_mode {
            if !mode.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ',') {
                return Err(format!("invalid mysql_sql_mode: '{}'", mode));
            }
        }
        Ok(())
    }
}

/// Load connection settings from the process environment.
///
/// Uses `DATABASE_TYPE`, `DATABASE_HOST`, `DATABASE_PORT`, `DATABASE_USER`,
/// `DATABASE_PASSWORD`, `DATABASE_NAME`, `DATABASE_POOL_MIN`, `DATABASE_POOL_MAX`
/// and friends; see [`settings_from_vars`].
pub fn settings_from_env(prefix: &str) -> DbResult<ConnectionSettings> {
    settings_from_vars(prefix, std::env::vars())
}

/// Build connection settings from `(name, value)` pairs sharing a prefix.
///
/// Required: `TYPE`, `HOST`, `USER`, `NAME`. Optional: `PORT` (defaults per
/// kind), `PASSWORD`, `POOL_MIN`, `POOL_MAX`, `ACQUIRE_TIMEOUT`, `IDLE_TIMEOUT`,
/// `MAX_LIFETIME`, `DISPOSE_GRACE` (all in seconds), `TEST_BEFORE_ACQUIRE`,
/// `USE_LIFO`, `CHARSET`, `ISOLATION_LEVEL`, `MYSQL_SQL_MODE`,
/// `MYSQL_INIT_COMMAND`, `ECHO`, and `OPTION_<KEY>` for driver options. Names
/// are matched case-insensitively.
pub fn settings_from_vars<I, K, V>(prefix: &str, vars: I) -> DbResult<ConnectionSettings>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let prefix = prefix.to_ascii_uppercase();
    let mut values: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in vars {
        let key = key.as_ref().to_ascii_uppercase();
        if let Some(name) = key.strip_prefix(&prefix) {
            values.insert(name.to_string(), value.into());
        }
    }

    let required = |name: &str| -> DbResult<String> {
        values
            .get(name)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                DbError::invalid_configuration(format!("{}{} is not set", prefix, name))
            })
    };

    let kind: DatabaseKind = required("TYPE")?.parse()?;
    let host = required("HOST")?;
    let username = required("USER")?;
    let database = required("NAME")?;
    let port = match values.get("PORT") {
        Some(v) => parse_number(&prefix, "PORT", v)?,
        None => kind.default_port(),
    };
    let password = values.get("PASSWORD").cloned().unwrap_or_default();

    let mut settings = ConnectionSettings::new(kind, host, port, username, password, database);
    if let Some(v) = values.get("POOL_MIN") {
        settings.pool_min = parse_number(&prefix, "POOL_MIN", v)?;
    }
    if let Some(v) = values.get("POOL_MAX") {
        settings.pool_max = parse_number(&prefix, "POOL_MAX", v)?;
    }

    let secs_as_ms = |name: &str| -> DbResult<Option<u64>> {
        values
            .get(name)
            .map(|v| {
                parse_number::<u64>(&prefix, name, v)?
                    .checked_mul(1000)
                    .ok_or_else(|| invalid_value(&prefix, name, v))
            })
            .transpose()
    };
    let flag = |name: &str| -> DbResult<Option<bool>> {
        values
            .get(name)
            .map(|v| parse_bool(v).ok_or_else(|| invalid_value(&prefix, name, v)))
            .transpose()
    };

    settings.pool_options = PoolOptions {
        acquire_timeout_ms: secs_as_ms("ACQUIRE_TIMEOUT")?,
        idle_timeout_ms: secs_as_ms("IDLE_TIMEOUT")?,
        max_lifetime_ms: secs_as_ms("MAX_LIFETIME")?,
        test_before_acquire: flag("TEST_BEFORE_ACQUIRE")?,
        use_lifo: flag("USE_LIFO")?,
        dispose_grace_ms: secs_as_ms("DISPOSE_GRACE")?,
        charset: values.get("CHARSET").cloned(),
        isolation_level: values
            .get("ISOLATION_LEVEL")
            .map(|v| {
                v.parse::<IsolationLevel>()
                    .map_err(|_| invalid_value(&prefix, "ISOLATION_LEVEL", v))
            })
            .transpose()?,
        mysql_sql_mode: values.get("MYSQL_SQL_MODE").cloned(),
        mysql_init_command: values.get("MYSQL_INIT_COMMAND").cloned(),
        echo: flag("ECHO")?,
    };

    for (name, value) in &values {
        if let Some(option) = name.strip_prefix(OPTION_KEY_PREFIX) {
            if !option.is_empty() {
                settings
                    .extra_options
                    .insert(option.to_ascii_lowercase(), value.clone());
            }
        }
    }

    Ok(settings)
}

fn parse_number<T: std::str::FromStr>(prefix: &str, name: &str, value: &str) -> DbResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid_value(prefix, name, value))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid_value(prefix: &str, name: &str, value: &str) -> DbError {
    DbError::invalid_configuration(format!("{}{} has invalid value '{}'", prefix, name, value))
}

/// Command-line configuration for the `dbkit` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dbkit",
    about = "Operational helper for dbkit: connectivity checks, snowflake ids and connection URLs",
    version,
    author
)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DBKIT_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBKIT_JSON_LOGS", global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Initialize a pool for an environment, run `SELECT 1` in a session and dispose
    Check {
        /// Migration environment whose settings to use (test or prod)
        #[arg(long, default_value = "test")]
        env: String,
        /// Use the blocking manager instead of the async one
        #[arg(long)]
        blocking: bool,
    },
    /// Generate snowflake ids
    Id {
        /// Number of ids to generate
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Worker id (0-1023); derived from host and process when omitted
        #[arg(long, env = "SNOWFLAKE_WORKER_ID")]
        worker: Option<u16>,
    },
    /// Decode a snowflake id into its components
    ParseId {
        id: i64,
    },
    /// Print the masked sync and async connection URLs for an environment
    Url {
        #[arg(long, default_value = "test")]
        env: String,
    },
}
