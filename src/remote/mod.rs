// backup-agent/src/remote/mod.rs
//! Client for the central task server.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{LocalSettings, TaskConfigPayload};
use crate::errors::{AppError, Result};

const CONFIG_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const API_KEY_HEADER: &str = "X-API-Key";

/// Which server and task the agent currently talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub base: Url,
    pub task_id: String,
    pub api_key: Option<String>,
}

impl ServerTarget {
    pub fn from_settings(settings: &LocalSettings) -> Self {
        Self {
            base: settings.server_url.clone(),
            task_id: settings.task_id.clone(),
            api_key: settings.api_key.clone(),
        }
    }

    /// `{base}/api/tasks/{task_id}/{action}`, with the task id encoded as a
    /// single path segment.
    pub fn endpoint(&self, action: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::config(format!("server_url cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .extend(["api", "tasks", self.task_id.as_str(), action]);
        Ok(url)
    }
}

/// Body of `GET /api/tasks/{id}/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub emergency_backup: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TaskStatus {
    /// Servers signal an emergency either through `emergency_backup` or by
    /// putting the emergency state itself in `status`.
    pub fn emergency_pending(&self) -> bool {
        self.emergency_backup.as_deref() == Some("pending") || self.status.as_deref() == Some("pending")
    }
}

#[derive(Debug, Serialize)]
struct FailureNotice<'a> {
    error: &'a str,
}

/// Operations the agent performs against the task server.
///
/// `report_failure` and `complete_emergency_backup` are best-effort: callers
/// log an `Err` and carry on.
#[async_trait]
pub trait TaskServer: Send + Sync {
    async fn fetch_config(&self, target: &ServerTarget) -> Result<TaskConfigPayload>;
    async fn fetch_status(&self, target: &ServerTarget) -> Result<TaskStatus>;
    async fn report_failure(&self, target: &ServerTarget, message: &str) -> Result<()>;
    async fn complete_emergency_backup(&self, target: &ServerTarget) -> Result<()>;
}

/// `reqwest` implementation of [`TaskServer`].
#[derive(Debug, Clone, Default)]
pub struct HttpTaskServer {
    client: Client,
}

impl HttpTaskServer {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn with_key(request: RequestBuilder, target: &ServerTarget) -> RequestBuilder {
        match &target.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    fn check_status(url: &Url, status: StatusCode) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(AppError::ServerStatus {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl TaskServer for HttpTaskServer {
    async fn fetch_config(&self, target: &ServerTarget) -> Result<TaskConfigPayload> {
        let url = target.endpoint("config")?;
        debug!(%url, "Fetching task config");
        let response = Self::with_key(self.client.get(url.clone()), target)
            .timeout(CONFIG_TIMEOUT)
            .send()
            .await?;
        Self::check_status(&url, response.status())?;
        Ok(TaskConfigPayload(response.json().await?))
    }

    async fn fetch_status(&self, target: &ServerTarget) -> Result<TaskStatus> {
        let url = target.endpoint("status")?;
        let response = Self::with_key(self.client.get(url.clone()), target)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        // Only a plain 200 counts as a usable status answer.
        if response.status() != StatusCode::OK {
            return Err(AppError::ServerStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    async fn report_failure(&self, target: &ServerTarget, message: &str) -> Result<()> {
        let url = target.endpoint("report-failure")?;
        let response = Self::with_key(self.client.post(url.clone()), target)
            .timeout(REQUEST_TIMEOUT)
            .json(&FailureNotice { error: message })
            .send()
            .await?;
        Self::check_status(&url, response.status())
    }

    async fn complete_emergency_backup(&self, target: &ServerTarget) -> Result<()> {
        let url = target.endpoint("complete-emergency-backup")?;
        let response = Self::with_key(self.client.post(url.clone()), target)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check_status(&url, response.status())
    }
}
