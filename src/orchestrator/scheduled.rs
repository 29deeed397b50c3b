// backup-agent/src/orchestrator/scheduled.rs
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{Orchestrator, PointOutcome, PointResult};
use crate::backup::BackupReason;
use crate::config::{CachedConfig, Database};
use crate::schedule::{SchedulePoint, TimeOfDay};
use crate::store::{DrainSummary, PendingUpload};

impl Orchestrator {
    /// Retries everything in the failure queue before any new backup runs.
    /// Artifacts that belonged to a schedule point mark that point done as of
    /// the moment they were taken.
    pub(super) async fn drain_failure_queue(&self, config: &CachedConfig) -> DrainSummary {
        let uploader = Arc::clone(&self.uploader);
        let storage = config.storage.clone();
        let folder = config.task.folder.clone();

        let summary = self
            .queue
            .drain_and_retry(|entry: PendingUpload| {
                let uploader = Arc::clone(&uploader);
                let storage = storage.clone();
                let folder = folder.clone();
                async move {
                    uploader
                        .upload(&storage, &folder, &entry.path)
                        .await
                        .map(|_| ())
                }
            })
            .await;

        for entry in &summary.uploaded {
            let Some(origin) = &entry.origin else {
                continue;
            };
            match self.state.record_success(&origin.key, origin.backed_up_at) {
                Ok(true) => info!(point = %origin.key, at = %origin.backed_up_at, "Queued upload completed its schedule point"),
                Ok(false) => debug!(point = %origin.key, "A newer success is already recorded"),
                Err(e) => error!(point = %origin.key, error = %e, "Failed to record success of queued upload"),
            }
        }
        summary
    }

    /// Backs up every point that is due now, in database order.
    pub(super) async fn run_due_points(&self, config: &CachedConfig) -> Vec<PointOutcome> {
        let now = self.clock.now();
        let last_success = self.state.load();
        let queued = self.queue.pending();
        let mut outcomes = Vec::new();

        for (database, point) in config.task.schedule_points() {
            let key = point.key();
            let last = last_success.get(&key).copied();
            if !point.is_due(now, last) {
                continue;
            }

            let window_start = point.due_instant(now);
            let already_queued = queued.iter().any(|entry| {
                entry
                    .origin
                    .as_ref()
                    .is_some_and(|origin| origin.key == key && origin.backed_up_at >= window_start)
            });
            if already_queued {
                info!(point = %key, "Backup for this window is waiting in the retry queue, not dumping again");
                outcomes.push(PointOutcome {
                    key,
                    result: PointResult::AwaitingRetry,
                });
                continue;
            }

            info!(point = %key, due_at = %window_start, last_success = ?last, "Scheduled backup due");
            let result = self
                .backup_point(config, database, &point, &BackupReason::Scheduled)
                .await;
            outcomes.push(PointOutcome { key, result });
        }

        if outcomes.is_empty() {
            debug!("No scheduled backups due");
        }
        outcomes
    }

    /// Backs up every database once and records it under the `manual` point.
    pub(super) async fn run_manual(&self, config: &CachedConfig) -> Vec<PointOutcome> {
        let mut outcomes = Vec::new();
        for database in &config.task.databases {
            let point = SchedulePoint::new(database.name.clone(), TimeOfDay::manual());
            let result = self
                .backup_point(config, database, &point, &BackupReason::Scheduled)
                .await;
            outcomes.push(PointOutcome {
                key: point.key(),
                result,
            });
        }
        outcomes
    }

    /// Dump, upload, record. A failed upload leaves the artifact queued and
    /// the point unrecorded.
    async fn backup_point(
        &self,
        config: &CachedConfig,
        database: &Database,
        point: &SchedulePoint,
        reason: &BackupReason,
    ) -> PointResult {
        let key = point.key();
        let started_at = self.clock.now();

        let artifact = match self.executor.run(database, reason, started_at).await {
            Ok(artifact) => artifact,
            Err(e) => {
                let _ = self
                    .notify_failure(&format!("Backup of database {} failed: {}", database.name, e))
                    .await;
                return PointResult::BackupFailed(e.to_string());
            }
        };

        match self
            .uploader
            .upload(&config.storage, &config.task.folder, &artifact)
            .await
        {
            Ok(object_key) => {
                let finished_at = self.clock.now();
                if let Err(e) = self.state.record_success(&key, finished_at) {
                    error!(point = %key, error = %e, "Backup uploaded but success could not be recorded");
                }
                remove_artifact(&artifact);
                info!(point = %key, %object_key, "Scheduled backup complete");
                PointResult::Uploaded { object_key }
            }
            Err(e) => {
                warn!(point = %key, error = %e, "Upload failed, queueing artifact for retry");
                let entry = PendingUpload::for_point(&artifact, &key, started_at);
                if let Err(e) = self.queue.enqueue(&entry) {
                    error!(file = %artifact.display(), error = %e, "Failed to queue artifact; it stays on disk");
                }
                PointResult::Queued { artifact }
            }
        }
    }
}

pub(super) fn remove_artifact(artifact: &Path) {
    match std::fs::remove_file(artifact) {
        Ok(()) => debug!(file = %artifact.display(), "Local artifact removed"),
        Err(e) => warn!(file = %artifact.display(), error = %e, "Failed to remove local artifact"),
    }
}
