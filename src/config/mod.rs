// backup-agent/src/config/mod.rs
pub mod cache;
pub mod task;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub use cache::{CachedConfig, ConfigCache};
pub use task::{Database, StorageCredentials, TaskConfigPayload};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
const DEFAULT_CONFIG_TTL_SECS: u64 = 3600;
const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_BACKUP_DIR: &str = "backups";
const DEFAULT_LOG_DIR: &str = "logs";
const STATE_FILE_NAME: &str = "last_backup_times.json";
const FAILED_UPLOADS_FILE_NAME: &str = "failed_uploads.log";

// Struct for deserializing settings.json
#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonSettings {
    pub server_url: Option<String>,
    pub task_id: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub config_ttl_secs: Option<u64>,
    pub backup_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub failed_uploads_file: Option<PathBuf>,
    pub dump_tool: Option<PathBuf>,
    pub dump_timeout_secs: Option<u64>,
}

/// Validated local settings for one agent deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSettings {
    pub server_url: Url,
    pub task_id: String,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub config_ttl: Duration,
    pub backup_dir: PathBuf,
    pub log_dir: PathBuf,
    pub state_file: PathBuf,
    pub failed_uploads_file: PathBuf,
    pub dump_tool: Option<PathBuf>,
    pub dump_timeout: Duration,
}

impl LocalSettings {
    pub fn load_from_json(settings_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(settings_path).with_context(|| {
            format!("Failed to read settings file at {}", settings_path.display())
        })?;
        let raw: RawJsonSettings = serde_json::from_str(&content).with_context(|| {
            format!(
                "Failed to parse JSON from settings file at {}",
                settings_path.display()
            )
        })?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawJsonSettings) -> Result<Self> {
        let server_url = raw
            .server_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .context("server_url must be set in settings")?;
        let server_url = Url::parse(server_url)
            .with_context(|| format!("server_url is not a valid URL: {}", server_url))?;
        if server_url.cannot_be_a_base() {
            anyhow::bail!("server_url cannot be used as a base URL: {}", server_url);
        }

        let task_id = raw
            .task_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .context("task_id must be set in settings")?
            .to_string();

        let log_dir = raw.log_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        let state_file = raw
            .state_file
            .unwrap_or_else(|| log_dir.join(STATE_FILE_NAME));
        let failed_uploads_file = raw
            .failed_uploads_file
            .unwrap_or_else(|| log_dir.join(FAILED_UPLOADS_FILE_NAME));

        Ok(LocalSettings {
            server_url,
            task_id,
            api_key: raw.api_key.filter(|k| !k.trim().is_empty()),
            poll_interval: Duration::from_secs(
                raw.poll_interval_secs
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            config_ttl: Duration::from_secs(raw.config_ttl_secs.unwrap_or(DEFAULT_CONFIG_TTL_SECS)),
            backup_dir: raw
                .backup_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR)),
            log_dir,
            state_file,
            failed_uploads_file,
            dump_tool: raw.dump_tool,
            dump_timeout: Duration::from_secs(
                raw.dump_timeout_secs.unwrap_or(DEFAULT_DUMP_TIMEOUT_SECS),
            ),
        })
    }

    /// Field-by-field comparison of the values that can be hot-reloaded.
    pub fn diff(&self, newer: &LocalSettings) -> SettingsDiff {
        SettingsDiff {
            task_id: (self.task_id != newer.task_id)
                .then(|| (self.task_id.clone(), newer.task_id.clone())),
            server_url: (self.server_url != newer.server_url).then(|| newer.server_url.clone()),
            api_key_changed: self.api_key != newer.api_key,
        }
    }
}

/// What changed between two loads of the local settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsDiff {
    /// `(previous, current)` task identity.
    pub task_id: Option<(String, String)>,
    pub server_url: Option<Url>,
    pub api_key_changed: bool,
}

impl SettingsDiff {
    pub fn is_empty(&self) -> bool {
        self.task_id.is_none() && self.server_url.is_none() && !self.api_key_changed
    }

    /// Any change that points the agent at different remote config.
    pub fn requires_refresh(&self) -> bool {
        !self.is_empty()
    }
}

/// Where local settings come from.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<LocalSettings>;

    /// Reloads and compares against `last`, returning the fresh settings
    /// alongside the typed diff.
    fn changed_since(&self, last: &LocalSettings) -> Result<(LocalSettings, SettingsDiff)> {
        let current = self.load()?;
        let diff = last.diff(&current);
        Ok((current, diff))
    }
}

/// Reads settings from a JSON file on every call.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for JsonFileSource {
    fn load(&self) -> Result<LocalSettings> {
        LocalSettings::load_from_json(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawJsonSettings {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_settings_defaults() -> anyhow::Result<()> {
        let settings = LocalSettings::from_raw(raw(json!({
            "server_url": "http://backup.example.com:3000",
            "task_id": "task-1"
        })))?;

        assert_eq!(settings.task_id, "task-1");
        assert_eq!(settings.api_key, None);
        assert_eq!(settings.poll_interval, Duration::from_secs(15));
        assert_eq!(settings.config_ttl, Duration::from_secs(3600));
        assert_eq!(settings.dump_timeout, Duration::from_secs(3600));
        assert_eq!(settings.state_file, PathBuf::from("logs/last_backup_times.json"));
        assert_eq!(settings.failed_uploads_file, PathBuf::from("logs/failed_uploads.log"));
        assert_eq!(settings.backup_dir, PathBuf::from("backups"));
        Ok(())
    }

    #[test]
    fn test_settings_require_task_and_server() {
        assert!(LocalSettings::from_raw(raw(json!({ "task_id": "t" }))).is_err());
        assert!(LocalSettings::from_raw(raw(json!({ "server_url": "http://x" }))).is_err());
        assert!(
            LocalSettings::from_raw(raw(json!({ "server_url": "http://x", "task_id": "  " })))
                .is_err()
        );
        assert!(
            LocalSettings::from_raw(raw(json!({ "server_url": "not a url", "task_id": "t" })))
                .is_err()
        );
    }

    #[test]
    fn test_settings_diff_detects_task_change() -> anyhow::Result<()> {
        let a = LocalSettings::from_raw(raw(json!({
            "server_url": "http://x", "task_id": "a"
        })))?;
        let b = LocalSettings::from_raw(raw(json!({
            "server_url": "http://x", "task_id": "b", "api_key": "secret"
        })))?;

        assert!(a.diff(&a.clone()).is_empty());
        let diff = a.diff(&b);
        assert_eq!(diff.task_id, Some(("a".to_string(), "b".to_string())));
        assert!(diff.server_url.is_none());
        assert!(diff.api_key_changed);
        assert!(diff.requires_refresh());
        Ok(())
    }

    #[test]
    fn test_json_file_source_changed_since() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("settings.json");
        fs::write(&path, json!({ "server_url": "http://x", "task_id": "a" }).to_string())?;
        let source = JsonFileSource::new(&path);
        let first = source.load()?;

        let (_, unchanged) = source.changed_since(&first)?;
        assert!(unchanged.is_empty());

        fs::write(&path, json!({ "server_url": "http://y", "task_id": "a" }).to_string())?;
        let (current, diff) = source.changed_since(&first)?;
        assert_eq!(current.server_url.as_str(), "http://y/");
        assert!(diff.task_id.is_none());
        assert!(diff.server_url.is_some());
        Ok(())
    }
}
