//! Migration environment resolution.
//!
//! Schema migrations are executed by an external tool. This module picks the
//! connection settings for a named environment, renders the blocking-driver
//! URL, attaches the discovered model metadata and hands everything to a
//! [`MigrationTool`]. Guard rails run before the tool is invoked:
//!
//! - `downgrade` against production needs explicit confirmation
//! - `revision --autogenerate` needs a discovered model registry
//! - offline (SQL rendering) mode is only accepted by commands that support it

pub mod alembic;

pub use alembic::AlembicCli;

use crate::config::settings_from_vars;
use crate::db::{ConnectionUrl, build_url};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionSettings, DriverMode, ModelRegistry, RegistryHandle};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

pub const TEST_ENV_PREFIX: &str = "DATABASE_TEST_";
pub const PROD_ENV_PREFIX: &str = "DATABASE_PROD_";

/// Required variables; any one of them marks a profile as configured.
const PROFILE_KEYS: [&str; 4] = ["TYPE", "HOST", "USER", "NAME"];

/// Deployment environment a migration runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Test,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }

    /// Environment variable prefix of this environment's profile.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::Test => TEST_ENV_PREFIX,
            Self::Prod => PROD_ENV_PREFIX,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Prod)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" | "testing" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(DbError::invalid_configuration(format!(
                "Unknown environment '{}'. Expected test or prod",
                other
            ))),
        }
    }
}

/// Connection settings per environment.
#[derive(Debug, Clone, Default)]
pub struct MigrationProfiles {
    test: Option<ConnectionSettings>,
    prod: Option<ConnectionSettings>,
}

impl MigrationProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, environment: Environment, settings: ConnectionSettings) -> Self {
        match environment {
            Environment::Test => self.test = Some(settings),
            Environment::Prod => self.prod = Some(settings),
        }
        self
    }

    /// Load profiles from the process environment.
    pub fn from_env() -> DbResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load profiles from `DATABASE_TEST_*` and `DATABASE_PROD_*` variables.
    ///
    /// An environment none of whose required variables (`TYPE`, `HOST`,
    /// `USER`, `NAME`) is set has no profile. One with some of them must be
    /// complete.
    pub fn from_vars<I, K, V>(vars: I) -> DbResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let vars: Vec<(String, String)> = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_uppercase(), v.into()))
            .collect();

        let mut profiles = Self::new();
        for environment in [Environment::Test, Environment::Prod] {
            let prefix = environment.env_prefix();
            let configured = vars.iter().any(|(k, _)| {
                k.strip_prefix(prefix)
                    .is_some_and(|name| PROFILE_KEYS.contains(&name))
            });
            if !configured {
                continue;
            }
            let settings = settings_from_vars(prefix, vars.iter().cloned())?;
            profiles = profiles.with(environment, settings);
        }
        Ok(profiles)
    }

    pub fn get(&self, environment: Environment) -> Option<&ConnectionSettings> {
        match environment {
            Environment::Test => self.test.as_ref(),
            Environment::Prod => self.prod.as_ref(),
        }
    }

    pub fn settings(&self, environment: Environment) -> DbResult<&ConnectionSettings> {
        self.get(environment).ok_or_else(|| {
            DbError::invalid_configuration(format!(
                "No connection settings for the {} environment; set {}TYPE, {}HOST, {}USER and {}NAME",
                environment,
                environment.env_prefix(),
                environment.env_prefix(),
                environment.env_prefix(),
                environment.env_prefix(),
            ))
        })
    }
}

/// Everything the external tool needs for one environment.
#[derive(Debug, Clone)]
pub struct MigrationTarget {
    pub environment: Environment,
    pub settings: ConnectionSettings,
    /// Blocking-driver URL, which is what migration tools connect with.
    pub url: ConnectionUrl,
    /// Snapshot of the model registry, when discovery has completed.
    pub registry: Option<RegistryHandle>,
}

/// A primitive of the external migration tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationCommand {
    Upgrade { revision: String },
    Downgrade { revision: String },
    Revision { message: String, autogenerate: bool },
    Stamp { revision: String },
    History,
    Merge {
        revisions: Vec<String>,
        message: Option<String>,
    },
}

impl MigrationCommand {
    pub fn upgrade(revision: impl Into<String>) -> Self {
        Self::Upgrade {
            revision: revision.into(),
        }
    }

    pub fn downgrade(revision: impl Into<String>) -> Self {
        Self::Downgrade {
            revision: revision.into(),
        }
    }

    pub fn autogenerate(message: impl Into<String>) -> Self {
        Self::Revision {
            message: message.into(),
            autogenerate: true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Upgrade { .. } => "upgrade",
            Self::Downgrade { .. } => "downgrade",
            Self::Revision { .. } => "revision",
            Self::Stamp { .. } => "stamp",
            Self::History => "history",
            Self::Merge { .. } => "merge",
        }
    }

    /// Subcommand and its arguments, without global options.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![self.name().to_string()];
        match self {
            Self::Upgrade { revision } | Self::Downgrade { revision } | Self::Stamp { revision } => {
                args.push(revision.clone());
            }
            Self::Revision {
                message,
                autogenerate,
            } => {
                if *autogenerate {
                    args.push("--autogenerate".to_string());
                }
                args.push("-m".to_string());
                args.push(message.clone());
            }
            Self::History => {}
            Self::Merge { revisions, message } => {
                if let Some(message) = message {
                    args.push("-m".to_string());
                    args.push(message.clone());
                }
                args.extend(revisions.iter().cloned());
            }
        }
        args
    }

    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Downgrade { .. })
    }

    pub fn requires_registry(&self) -> bool {
        matches!(
            self,
            Self::Revision {
                autogenerate: true,
                ..
            }
        )
    }

    /// Commands that can render SQL instead of executing it.
    pub fn supports_offline(&self) -> bool {
        matches!(
            self,
            Self::Upgrade { .. } | Self::Downgrade { .. } | Self::Stamp { .. }
        )
    }
}

impl fmt::Display for MigrationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Render SQL instead of executing against the database.
    pub offline: bool,
    /// Explicit operator confirmation for destructive commands in production.
    pub confirmed: bool,
}

impl RunOptions {
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    pub fn confirmed() -> Self {
        Self {
            confirmed: true,
            ..Self::default()
        }
    }
}

/// Captured result of a tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Seam to the external migration tool.
pub trait MigrationTool: Send + Sync {
    fn run(
        &self,
        target: &MigrationTarget,
        command: &MigrationCommand,
        offline: bool,
    ) -> DbResult<MigrationOutput>;
}

/// Resolves environments to targets and runs guarded migration commands.
pub struct MigrationResolver<'r, T> {
    profiles: MigrationProfiles,
    registry: &'r ModelRegistry,
    tool: T,
}

impl<'r, T: MigrationTool> MigrationResolver<'r, T> {
    pub fn new(profiles: MigrationProfiles, registry: &'r ModelRegistry, tool: T) -> Self {
        Self {
            profiles,
            registry,
            tool,
        }
    }

    pub fn profiles(&self) -> &MigrationProfiles {
        &self.profiles
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    /// Validate the environment's settings and render its blocking-driver URL.
    pub fn resolve(&self, environment: Environment) -> DbResult<MigrationTarget> {
        let settings = self.profiles.settings(environment)?;
        settings.validate()?;
        let url = build_url(settings, DriverMode::Sync)?;
        Ok(MigrationTarget {
            environment,
            settings: settings.clone(),
            url,
            registry: self.registry.handle().ok(),
        })
    }

    pub fn run(
        &self,
        environment: Environment,
        command: &MigrationCommand,
        options: RunOptions,
    ) -> DbResult<MigrationOutput> {
        if command.is_destructive() && environment.is_production() && !options.confirmed {
            warn!(command = %command, environment = %environment, "Refusing unconfirmed migration");
            return Err(DbError::confirmation_required(
                command.name(),
                environment.as_str(),
            ));
        }
        if options.offline && !command.supports_offline() {
            return Err(DbError::invalid_configuration(format!(
                "'{}' cannot run in offline mode",
                command.name()
            )));
        }

        let target = self.resolve(environment)?;
        if command.requires_registry() && target.registry.is_none() {
            return Err(DbError::RegistryNotReady);
        }

        info!(
            command = %command,
            environment = %environment,
            url = %target.url,
            offline = options.offline,
            "Running migration command"
        );
        let output = self.tool.run(&target, command, options.offline)?;
        info!(command = command.name(), environment = %environment, "Migration command finished");
        Ok(output)
    }

    pub fn upgrade(
        &self,
        environment: Environment,
        revision: &str,
        options: RunOptions,
    ) -> DbResult<MigrationOutput> {
        self.run(environment, &MigrationCommand::upgrade(revision), options)
    }

    pub fn downgrade(
        &self,
        environment: Environment,
        revision: &str,
        options: RunOptions,
    ) -> DbResult<MigrationOutput> {
        self.run(environment, &MigrationCommand::downgrade(revision), options)
    }

    pub fn autogenerate(&self, environment: Environment, message: &str) -> DbResult<MigrationOutput> {
        self.run(
            environment,
            &MigrationCommand::autogenerate(message),
            RunOptions::default(),
        )
    }

    pub fn stamp(
        &self,
        environment: Environment,
        revision: &str,
        options: RunOptions,
    ) -> DbResult<MigrationOutput> {
        let command = MigrationCommand::Stamp {
            revision: revision.to_string(),
        };
        self.run(environment, &command, options)
    }

    pub fn history(&self, environment: Environment) -> DbResult<MigrationOutput> {
        self.run(environment, &MigrationCommand::History, RunOptions::default())
    }

    pub fn merge(
        &self,
        environment: Environment,
        revisions: &[&str],
        message: Option<&str>,
    ) -> DbResult<MigrationOutput> {
        let command = MigrationCommand::Merge {
            revisions: revisions.iter().map(|r| r.to_string()).collect(),
            message: message.map(str::to_string),
        };
        self.run(environment, &command, RunOptions::default())
    }
}
