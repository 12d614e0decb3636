//! dbkit
//!
//! Embeddable database infrastructure for PostgreSQL and MySQL services:
//! connection URL building for blocking and async drivers, pooled
//! transactional sessions with an explicit lifecycle, snowflake ids, an
//! explicit model registry and migration environment resolution.

pub mod config;
pub mod db;
pub mod error;
pub mod migration;
pub mod models;
pub mod snowflake;

pub use config::{Config, PoolOptions};
pub use db::{AsyncDatabaseManager, ManagerRegistry, SyncDatabaseManager};
pub use error::{DbError, DbResult};
pub use models::{ConnectionSettings, DatabaseKind, DriverMode, Model, ModelRegistry};
pub use snowflake::Snowflake;
