use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server returned {status} for {url}")]
    ServerStatus { url: String, status: u16 },

    #[error("Task configuration from server is missing the task definition")]
    MissingTaskConfig,

    #[error("Task configuration from server is missing the storage credentials")]
    MissingStorageConfig,

    #[error("Invalid schedule time '{0}', expected HH:MM")]
    InvalidSchedule(String),

    #[error("Backup tool not available: {0}")]
    ToolNotFound(String),

    #[error("Command execution failed: {stderr}")]
    Command { stdout: String, stderr: String },

    #[error("Backup of {database} timed out after {}s", .after.as_secs())]
    Timeout { database: String, after: Duration },

    #[error("Backup tool reported success but artifact {} does not exist", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Upload failed (status {status:?}): {code} - {message}")]
    Upload {
        status: Option<u16>,
        code: String,
        message: String,
    },

    #[error("Local storage error for {}: {message}", .path.display())]
    LocalStorage { path: PathBuf, message: String },
}

impl AppError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn local_storage(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::LocalStorage {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Network-class failures end the tick quietly; the next tick retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ServerStatus { .. })
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
