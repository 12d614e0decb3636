//! dbkit - operational entry point.
//!
//! Connectivity checks against a configured environment, snowflake id
//! generation and decoding, and connection URL rendering.

use clap::Parser;
use dbkit::config::{Command, Config};
use dbkit::db::{
    AsyncDatabaseManager, AsyncSessionManager, DisposeReport, SessionManager, SqlxConnector,
    SyncDatabaseManager, build_url_pair,
};
use dbkit::error::{DbError, DbResult};
use dbkit::migration::{Environment, MigrationProfiles};
use dbkit::models::ConnectionSettings;
use dbkit::snowflake::{self, Snowflake, SnowflakeConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output stays machine-readable.
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn environment_settings(env: &str) -> DbResult<(Environment, ConnectionSettings)> {
    let environment: Environment = env.parse()?;
    let profiles = MigrationProfiles::from_env()?;
    let settings = profiles.settings(environment)?.clone();
    Ok((environment, settings))
}

fn log_dispose(report: &DisposeReport) {
    if report.is_clean() {
        info!(closed = report.closed, "Pool disposed");
    } else {
        warn!(
            closed = report.closed,
            forced = report.forced,
            errors = ?report.errors,
            "Pool disposed with warnings"
        );
    }
}

async fn check_async(settings: ConnectionSettings) -> DbResult<()> {
    let manager = AsyncDatabaseManager::<SqlxConnector>::default();
    manager.init(settings).await?;
    let result = manager
        .with_session(|s| Box::pin(async move { s.execute("SELECT 1").await }))
        .await;
    log_dispose(&manager.dispose().await);
    result.map(|_| ())
}

fn check_blocking(settings: ConnectionSettings) -> DbResult<()> {
    let manager = SyncDatabaseManager::with_sqlx()?;
    manager.init(settings)?;
    let result = manager.with_session(|s| s.execute("SELECT 1"));
    log_dispose(&manager.dispose());
    result.map(|_| ())
}

async fn run(command: Command) -> DbResult<()> {
    match command {
        Command::Check { env, blocking } => {
            let (environment, settings) = environment_settings(&env)?;
            info!(
                environment = %environment,
                endpoint = %settings.endpoint(),
                blocking,
                "Checking database connectivity"
            );
            if blocking {
                tokio::task::spawn_blocking(move || check_blocking(settings))
                    .await
                    .map_err(|e| DbError::internal(format!("Check task failed: {}", e)))??;
            } else {
                check_async(settings).await?;
            }
            println!("ok");
        }
        Command::Id { count, worker } => {
            let ids = match worker {
                Some(worker_id) => {
                    let generator = Snowflake::new(SnowflakeConfig::new(worker_id)?);
                    (0..count)
                        .map(|_| generator.next_id())
                        .collect::<DbResult<Vec<_>>>()?
                }
                None => (0..count)
                    .map(|_| snowflake::next_id())
                    .collect::<DbResult<Vec<_>>>()?,
            };
            for id in ids {
                println!("{}", id);
            }
        }
        Command::ParseId { id } => {
            let info = snowflake::parse(id)?;
            let rendered = serde_json::to_string_pretty(&info)
                .map_err(|e| DbError::internal(format!("Failed to render id: {}", e)))?;
            println!("{}", rendered);
        }
        Command::Url { env } => {
            let (_, settings) = environment_settings(&env)?;
            let (sync_url, async_url) = build_url_pair(&settings)?;
            println!("sync:  {}", sync_url.masked());
            println!("async: {}", async_url.masked());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    init_tracing(&config);

    if let Err(e) = run(config.command).await {
        error!(error = %e, "Command failed");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Hint: {}", suggestion);
        }
        return Err(e.into());
    }
    Ok(())
}
