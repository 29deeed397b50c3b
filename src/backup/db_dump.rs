// backup-agent/src/backup/db_dump.rs
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info};

use super::{BackupExecutor, BackupReason, artifact_file_name};
use crate::config::Database;
use crate::errors::{AppError, Result};
use crate::utils::find_executable;

const DUMP_TOOL: &str = "sqlcmd";

/// Runs `BACKUP DATABASE` through `sqlcmd`.
#[derive(Debug, Clone)]
pub struct SqlCmdExecutor {
    tool: Option<PathBuf>,
    backup_dir: PathBuf,
    timeout: Duration,
}

impl SqlCmdExecutor {
    /// `tool` overrides the `PATH` lookup of `sqlcmd`.
    pub fn new(tool: Option<PathBuf>, backup_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            tool,
            backup_dir: backup_dir.into(),
            timeout,
        }
    }

    fn resolve_tool(&self) -> Result<PathBuf> {
        match &self.tool {
            Some(tool) => Ok(tool.clone()),
            None => find_executable(DUMP_TOOL),
        }
    }

    fn prepare_backup_dir(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.backup_dir)?;
        Ok(std::path::absolute(&self.backup_dir)?)
    }
}

/// `BACKUP DATABASE [name] TO DISK='path' WITH FORMAT, ...`, with `]` and `'`
/// escaped for their respective quoting.
pub fn backup_statement(database: &str, artifact: &Path) -> String {
    format!(
        "BACKUP DATABASE [{}] TO DISK='{}' WITH FORMAT, COMPRESSION, STATS=10",
        database.replace(']', "]]"),
        artifact.display().to_string().replace('\'', "''")
    )
}

#[async_trait]
impl BackupExecutor for SqlCmdExecutor {
    async fn run(
        &self,
        database: &Database,
        reason: &BackupReason,
        started_at: NaiveDateTime,
    ) -> Result<PathBuf> {
        let tool = self.resolve_tool()?;
        let backup_dir = self.prepare_backup_dir()?;
        let file_name = artifact_file_name(database, started_at, reason);
        let artifact = backup_dir.join(&file_name);

        // Always a fresh artifact, never appended to a previous one.
        if artifact.exists() {
            std::fs::remove_file(&artifact)?;
        }

        info!(database = %database.name, file = %file_name, %reason, "Starting backup");
        let mut command = Command::new(&tool);
        command
            .arg("-S")
            .arg(&database.server)
            .arg("-U")
            .arg(&database.user)
            .arg("-P")
            .arg(&database.pass)
            .arg("-b")
            .arg("-Q")
            .arg(backup_statement(&database.name, &artifact))
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output.map_err(|e| AppError::Command {
                stdout: String::new(),
                stderr: format!("Failed to execute {}: {}", tool.display(), e),
            })?,
            Err(_) => {
                error!(database = %database.name, timeout_secs = self.timeout.as_secs(), "Backup timed out");
                return Err(AppError::Timeout {
                    database: database.name.clone(),
                    after: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(AppError::Command {
                stdout,
                stderr: if stderr.trim().is_empty() {
                    format!("{} exited with {}", tool.display(), output.status)
                } else {
                    stderr
                },
            });
        }
        if !artifact.exists() {
            return Err(AppError::MissingArtifact(artifact));
        }

        info!(database = %database.name, file = %file_name, "Backup succeeded");
        Ok(artifact)
    }
}
