pub(crate) mod db_dump; // external dump tool invocation
pub(crate) mod s3_upload; // object storage upload

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{Database, StorageCredentials};
use crate::errors::Result;

pub use db_dump::SqlCmdExecutor;
pub use s3_upload::S3Uploader;

/// Why a backup was taken; ends up in the artifact filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupReason {
    Scheduled,
    Emergency,
}

impl BackupReason {
    pub fn tag(&self) -> String {
        match self {
            BackupReason::Scheduled => "SCHEDULED".to_string(),
            BackupReason::Emergency => "EMERGENCY".to_string(),
        }
    }
}

impl fmt::Display for BackupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// `{prefix}{name}_{YYYYMMDD_HHMMSS}_{REASON}.bak`
pub fn artifact_file_name(database: &Database, started_at: NaiveDateTime, reason: &BackupReason) -> String {
    format!(
        "{}{}_{}_{}.bak",
        database.prefix.as_deref().unwrap_or(""),
        database.name,
        started_at.format("%Y%m%d_%H%M%S"),
        reason.tag()
    )
}

/// `{folder}/{filename}`, or just the filename for an empty folder.
pub fn object_key(folder: &str, artifact: &Path) -> String {
    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| artifact.display().to_string());
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        file_name
    } else {
        format!("{}/{}", folder, file_name)
    }
}

/// Produces one local backup artifact for a database.
#[async_trait]
pub trait BackupExecutor: Send + Sync {
    /// Returns the artifact path only if the tool succeeded and the file
    /// exists on disk.
    async fn run(
        &self,
        database: &Database,
        reason: &BackupReason,
        started_at: NaiveDateTime,
    ) -> Result<PathBuf>;
}

/// Pushes one local artifact to object storage.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Returns the object key written.
    async fn upload(
        &self,
        storage: &StorageCredentials,
        folder: &str,
        artifact: &Path,
    ) -> Result<String>;
}
