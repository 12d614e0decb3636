//! Driver for the `alembic` command line.

use super::{MigrationCommand, MigrationOutput, MigrationTarget, MigrationTool};
use crate::error::{DbError, DbResult};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::debug;

pub const URL_VAR: &str = "DATABASE_URL";
pub const ENV_VAR: &str = "DATABASE_ENV";
pub const METADATA_VAR: &str = "DATABASE_METADATA";

/// Runs `alembic -c <ini> -x env=<env> <command> [--sql]`.
///
/// The tool's `env.py` reads the blocking-driver URL from `DATABASE_URL`, the
/// environment name from `DATABASE_ENV` and, when the model registry has been
/// discovered, the path of a JSON table-metadata file from `DATABASE_METADATA`.
#[derive(Debug, Clone)]
pub struct AlembicCli {
    program: PathBuf,
    leading_args: Vec<OsString>,
    config_path: PathBuf,
    working_dir: Option<PathBuf>,
}

impl AlembicCli {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("alembic"),
            leading_args: Vec::new(),
            config_path: config_path.into(),
            working_dir: None,
        }
    }

    /// Launch through another program, e.g. `python3 -m alembic`.
    pub fn with_program<I, S>(mut self, program: impl Into<PathBuf>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = program.into();
        self.leading_args = leading_args.into_iter().map(Into::into).collect();
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn command(
        &self,
        target: &MigrationTarget,
        command: &MigrationCommand,
        offline: bool,
        metadata: Option<&Path>,
    ) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg("-c")
            .arg(&self.config_path)
            .arg("-x")
            .arg(format!("env={}", target.environment))
            .args(command.args());
        if offline {
            cmd.arg("--sql");
        }
        cmd.env(URL_VAR, target.url.as_str())
            .env(ENV_VAR, target.environment.as_str());
        match metadata {
            Some(path) => {
                cmd.env(METADATA_VAR, path);
            }
            None => {
                cmd.env_remove(METADATA_VAR);
            }
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl MigrationTool for AlembicCli {
    fn run(
        &self,
        target: &MigrationTarget,
        command: &MigrationCommand,
        offline: bool,
    ) -> DbResult<MigrationOutput> {
        let name = command.name();

        // Kept alive until the child exits; removed on drop.
        let metadata_file = match &target.registry {
            Some(registry) => {
                let mut file = NamedTempFile::new().map_err(|e| {
                    DbError::migration(name, format!("Failed to create metadata file: {}", e))
                })?;
                serde_json::to_writer(&mut file, &registry.metadata_json())
                    .map_err(|e| DbError::internal(format!("Failed to write metadata: {}", e)))?;
                file.flush().map_err(|e| {
                    DbError::migration(name, format!("Failed to write metadata file: {}", e))
                })?;
                Some(file)
            }
            None => None,
        };

        let mut cmd = self.command(
            target,
            command,
            offline,
            metadata_file.as_ref().map(NamedTempFile::path),
        );
        debug!(program = %self.program.display(), command = %command, "Spawning alembic");

        let output = cmd.output().map_err(|e| {
            DbError::migration(
                name,
                format!("Failed to start {}: {}", self.program.display(), e),
            )
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let detail = stderr.trim();
            let message = match output.status.code() {
                Some(code) if detail.is_empty() => format!("exited with status {}", code),
                Some(code) => format!("exited with status {}: {}", code, detail),
                None if detail.is_empty() => "terminated by signal".to_string(),
                None => format!("terminated by signal: {}", detail),
            };
            return Err(DbError::migration(name, message));
        }

        Ok(MigrationOutput { stdout, stderr })
    }
}
