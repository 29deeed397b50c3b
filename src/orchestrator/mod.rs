// backup-agent/src/orchestrator/mod.rs
//! The per-cycle state machine tying config, schedules, the retry queue and
//! emergency requests together.

mod emergency;
mod scheduled;


use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, error, info, warn};

use crate::backup::{ArtifactUploader, BackupExecutor};
use crate::config::{CachedConfig, ConfigCache, ConfigSource, LocalSettings, SettingsDiff};
use crate::errors::Result;
use crate::remote::{ServerTarget, TaskServer};
use crate::store::{DrainSummary, FailureQueue, StateStore};
use crate::utils::{Clock, LogContext};

pub use emergency::EmergencyOutcome;

/// External collaborators the orchestrator drives.
pub struct Collaborators {
    pub config_source: Box<dyn ConfigSource>,
    pub server: Arc<dyn TaskServer>,
    pub executor: Arc<dyn BackupExecutor>,
    pub uploader: Arc<dyn ArtifactUploader>,
    pub clock: Arc<dyn Clock>,
}

/// Why a tick stopped before running every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAbort {
    /// Status endpoint unreachable or not 200.
    StatusUnavailable(String),
    /// No usable task config this cycle.
    ConfigUnavailable(String),
    /// A step panicked; the tick boundary caught it.
    Fatal(String),
}

/// What happened to one due schedule point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointResult {
    Uploaded { object_key: String },
    /// Backup succeeded, upload did not; the artifact is queued.
    Queued { artifact: PathBuf },
    BackupFailed(String),
    /// An artifact for this window is still waiting in the retry queue.
    AwaitingRetry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointOutcome {
    pub key: String,
    pub result: PointResult,
}

/// Summary of one cycle, mostly for logs and tests.
#[derive(Debug, Default)]
pub struct TickReport {
    pub settings_changed: Option<SettingsDiff>,
    pub aborted: Option<TickAbort>,
    pub retried: DrainSummary,
    pub scheduled: Vec<PointOutcome>,
    pub emergency: Option<EmergencyOutcome>,
}

impl TickReport {
    #[cfg(test)]
    pub fn completed(&self) -> bool {
        self.aborted.is_none()
    }
}

pub struct Orchestrator {
    settings: LocalSettings,
    config_source: Box<dyn ConfigSource>,
    server: Arc<dyn TaskServer>,
    executor: Arc<dyn BackupExecutor>,
    uploader: Arc<dyn ArtifactUploader>,
    clock: Arc<dyn Clock>,
    cache: ConfigCache,
    state: StateStore,
    queue: FailureQueue,
    log: LogContext,
    force_refresh: bool,
}

impl Orchestrator {
    pub fn new(settings: LocalSettings, parts: Collaborators, log: LogContext) -> Self {
        Self {
            cache: ConfigCache::new(settings.config_ttl),
            state: StateStore::new(&settings.state_file),
            queue: FailureQueue::new(&settings.failed_uploads_file),
            settings,
            config_source: parts.config_source,
            server: parts.server,
            executor: parts.executor,
            uploader: parts.uploader,
            clock: parts.clock,
            log,
            force_refresh: false,
        }
    }

    pub fn settings(&self) -> &LocalSettings {
        &self.settings
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn queue(&self) -> &FailureQueue {
        &self.queue
    }

    #[cfg(test)]
    pub fn log_context(&self) -> &LogContext {
        &self.log
    }

    fn target(&self) -> ServerTarget {
        ServerTarget::from_settings(&self.settings)
    }

    /// Runs one full cycle. Never fails: every problem ends up in the report
    /// and the logs.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            settings_changed: self.reload_local_settings(),
            ..TickReport::default()
        };

        let span = self.log.tick_span();
        let outcome = AssertUnwindSafe(self.run_steps(&mut report))
            .catch_unwind()
            .instrument(span)
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(abort)) => report.aborted = Some(abort),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %self.settings.task_id, %message, "Unexpected failure in backup cycle");
                let _ = self
                    .notify_failure(&format!("Unexpected failure in backup cycle: {}", message))
                    .await;
                report.aborted = Some(TickAbort::Fatal(message));
            }
        }
        report
    }

    /// Steps 2 to 6 of a cycle, in order.
    async fn run_steps(&mut self, report: &mut TickReport) -> std::result::Result<(), TickAbort> {
        let target = self.target();

        let status = match self.server.fetch_status(&target).await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Cannot get task status, waiting for next cycle");
                return Err(TickAbort::StatusUnavailable(e.to_string()));
            }
        };

        let config = match self.current_config(&target).await {
            Ok(config) => config,
            Err(e) => {
                if e.is_transient() {
                    warn!(error = %e, "Task config unavailable, waiting for next cycle");
                } else {
                    let _ = self
                        .notify_failure(&format!("Failed to load task config: {}", e))
                        .await;
                }
                return Err(TickAbort::ConfigUnavailable(e.to_string()));
            }
        };

        report.retried = self.drain_failure_queue(&config).await;
        report.scheduled = self.run_due_points(&config).await;

        if status.emergency_pending() {
            report.emergency = Some(self.run_emergency(&config).await);
        } else {
            info!(
                status = ?status.status,
                last_error = ?status.last_error,
                "No emergency backup requested"
            );
        }
        Ok(())
    }

    /// Cached task config, refreshed when stale or when local settings moved.
    async fn current_config(&mut self, target: &ServerTarget) -> Result<CachedConfig> {
        let now = self.clock.now();
        let config = self
            .cache
            .get_or_refresh(self.server.as_ref(), target, now, self.force_refresh)
            .await?
            .clone();
        self.force_refresh = false;
        Ok(config)
    }

    /// Picks up edits to the local settings file. Only the task id, server
    /// URL, API key and cache TTL apply live; everything else needs a restart.
    fn reload_local_settings(&mut self) -> Option<SettingsDiff> {
        let (current, diff) = match self.config_source.changed_since(&self.settings) {
            Ok(changed) => changed,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to reload local settings, keeping previous values");
                return None;
            }
        };
        if current.config_ttl != self.settings.config_ttl {
            info!(ttl_secs = current.config_ttl.as_secs(), "Config cache TTL changed");
            self.cache.set_ttl(current.config_ttl);
            self.settings.config_ttl = current.config_ttl;
        }
        if diff.is_empty() {
            return None;
        }

        if let Some((from, to)) = &diff.task_id {
            info!(%from, %to, "Task id changed in local settings");
            if let Err(e) = self.log.reconfigure(to) {
                error!(error = %e, "Failed to switch logging to the new task");
            }
        }
        if let Some(url) = &diff.server_url {
            info!(server_url = %url, "Server URL changed in local settings");
        }
        if diff.api_key_changed {
            info!("API key changed in local settings");
        }

        self.settings.task_id = current.task_id;
        self.settings.server_url = current.server_url;
        self.settings.api_key = current.api_key;
        if diff.requires_refresh() {
            self.force_refresh = true;
        }
        Some(diff)
    }

    /// Logs `message` and tells the server about it. A failed report is
    /// logged as well; callers do not act on the result.
    pub async fn notify_failure(&self, message: &str) -> Result<()> {
        error!(%message, "Backup failure");
        let target = self.target();
        match self.server.report_failure(&target, message).await {
            Ok(()) => {
                info!("Failure reported to server");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Could not report failure to server");
                Err(e)
            }
        }
    }

    /// One-shot emergency run outside the service loop, with a forced config
    /// refresh first.
    pub async fn run_emergency_now(&mut self) -> Result<EmergencyOutcome> {
        let config = self.fresh_config().await?;
        let span = self.log.tick_span();
        Ok(self.run_emergency(&config).instrument(span).await)
    }

    /// One-shot backup of every database, recorded under the `manual` point.
    pub async fn run_manual_now(&mut self) -> Result<Vec<PointOutcome>> {
        let config = self.fresh_config().await?;
        let span = self.log.tick_span();
        Ok(self.run_manual(&config).instrument(span).await)
    }

    async fn fresh_config(&mut self) -> Result<CachedConfig> {
        self.force_refresh = true;
        let target = self.target();
        match self.current_config(&target).await {
            Ok(config) => Ok(config),
            Err(e) => {
                if !e.is_transient() {
                    let _ = self
                        .notify_failure(&format!("Failed to load task config: {}", e))
                        .await;
                }
                Err(e)
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
