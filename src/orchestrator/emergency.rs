// backup-agent/src/orchestrator/emergency.rs
use tracing::{error, info, warn};

use super::Orchestrator;
use super::scheduled::remove_artifact;
use crate::backup::BackupReason;
use crate::config::CachedConfig;
use crate::store::PendingUpload;

/// Result of one emergency run over all databases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmergencyOutcome {
    pub uploaded: Vec<String>,
    pub failed: Vec<String>,
    /// Whether the server accepted the completion call. The call is only
    /// made for a run in which every database was backed up and uploaded.
    pub completion_sent: bool,
}

impl EmergencyOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.uploaded.is_empty()
    }
}

impl Orchestrator {
    pub(super) async fn run_emergency(&self, config: &CachedConfig) -> EmergencyOutcome {
        let mut outcome = EmergencyOutcome::default();
        let databases = &config.task.databases;
        if databases.is_empty() {
            let _ = self
                .notify_failure("Emergency backup requested but the task has no databases configured")
                .await;
            return outcome;
        }

        info!(databases = databases.len(), "Emergency backup requested, backing up all databases");
        for database in databases {
            let started_at = self.clock.now();
            let artifact = match self
                .executor
                .run(database, &BackupReason::Emergency, started_at)
                .await
            {
                Ok(artifact) => artifact,
                Err(e) => {
                    let _ = self
                        .notify_failure(&format!(
                            "Emergency backup of database {} failed: {}",
                            database.name, e
                        ))
                        .await;
                    outcome.failed.push(database.name.clone());
                    continue;
                }
            };

            match self
                .uploader
                .upload(&config.storage, &config.task.folder, &artifact)
                .await
            {
                Ok(object_key) => {
                    info!(database = %database.name, %object_key, "Emergency backup uploaded");
                    remove_artifact(&artifact);
                    outcome.uploaded.push(database.name.clone());
                }
                Err(e) => {
                    if let Err(queue_err) = self.queue.enqueue(&PendingUpload::new(&artifact)) {
                        error!(file = %artifact.display(), error = %queue_err, "Failed to queue artifact; it stays on disk");
                    }
                    let _ = self
                        .notify_failure(&format!(
                            "Emergency backup of database {} could not be uploaded, queued for retry: {}",
                            database.name, e
                        ))
                        .await;
                    outcome.failed.push(database.name.clone());
                }
            }
        }

        if outcome.is_clean() {
            match self.server.complete_emergency_backup(&self.target()).await {
                Ok(()) => {
                    info!("Emergency backup completion reported to server");
                    outcome.completion_sent = true;
                }
                Err(e) => warn!(error = %e, "Could not report emergency completion; server will ask again"),
            }
        } else {
            warn!(failed = ?outcome.failed, "Emergency backup incomplete, not reporting completion");
        }
        outcome
    }
}
