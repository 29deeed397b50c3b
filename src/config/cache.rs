// backup-agent/src/config/cache.rs
use chrono::{NaiveDateTime, TimeDelta};
use std::time::Duration;
use tracing::info;

use super::task::{StorageCredentials, Task};
use crate::errors::{AppError, Result};
use crate::remote::{ServerTarget, TaskServer};

/// One successful fetch of task + storage config.
#[derive(Debug, Clone)]
pub struct CachedConfig {
    /// Task id the config was fetched for.
    pub task_id: String,
    pub task: Task,
    pub storage: StorageCredentials,
    pub fetched_at: NaiveDateTime,
}

/// Time-bounded copy of the remote task config.
#[derive(Debug)]
pub struct ConfigCache {
    ttl: TimeDelta,
    entry: Option<CachedConfig>,
}

impl ConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            entry: None,
        }
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    }

    /// Fresh means: fetched for this task, not in the future, younger than
    /// the TTL.
    pub fn is_fresh(&self, task_id: &str, now: NaiveDateTime) -> bool {
        self.entry.as_ref().is_some_and(|entry| {
            let age = now - entry.fetched_at;
            entry.task_id == task_id && age >= TimeDelta::zero() && age < self.ttl
        })
    }

    /// Returns the cached config, fetching it first when forced, missing or
    /// stale. A failed fetch leaves the previous entry in place.
    pub async fn get_or_refresh(
        &mut self,
        server: &dyn TaskServer,
        target: &ServerTarget,
        now: NaiveDateTime,
        force: bool,
    ) -> Result<&CachedConfig> {
        if force || !self.is_fresh(&target.task_id, now) {
            info!(task_id = %target.task_id, force, "Fetching task config from server");
            let payload = server.fetch_config(target).await?;
            let (task, storage) = payload.into_parts(&target.task_id)?;
            info!(
                task = %task.display_name(),
                databases = task.databases.len(),
                "Loaded and cached task config"
            );
            self.entry = Some(CachedConfig {
                task_id: target.task_id.clone(),
                task,
                storage,
                fetched_at: now,
            });
        }
        self.entry.as_ref().ok_or(AppError::MissingTaskConfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfigPayload;
    use crate::remote::TaskStatus;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::Mutex;
    use url::Url;

    struct ScriptedServer {
        responses: Mutex<Vec<Result<serde_json::Value>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedServer {
        fn new(responses: Vec<Result<serde_json::Value>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl TaskServer for ScriptedServer {
        async fn fetch_config(&self, _target: &ServerTarget) -> Result<TaskConfigPayload> {
            *self.calls.lock().unwrap() += 1;
            self.responses.lock().unwrap().remove(0).map(TaskConfigPayload)
        }
        async fn fetch_status(&self, _target: &ServerTarget) -> Result<TaskStatus> {
            Ok(TaskStatus::default())
        }
        async fn report_failure(&self, _target: &ServerTarget, _message: &str) -> Result<()> {
            Ok(())
        }
        async fn complete_emergency_backup(&self, _target: &ServerTarget) -> Result<()> {
            Ok(())
        }
    }

    fn payload(folder: &str) -> serde_json::Value {
        json!({
            "task": { "folder": folder, "databases": [{ "name": "orders", "times": "02:00" }] },
            "huawei_obs": { "ak": "a", "sk": "s", "endpoint": "e", "bucket_name": "b" }
        })
    }

    fn target(task_id: &str) -> ServerTarget {
        ServerTarget {
            base: Url::parse("http://server").unwrap(),
            task_id: task_id.to_string(),
            api_key: None,
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() -> anyhow::Result<()> {
        let server = ScriptedServer::new(vec![Ok(payload("one"))]);
        let mut cache = ConfigCache::new(Duration::from_secs(300));

        cache.get_or_refresh(&server, &target("t"), at(1, 0), false).await?;
        let hit = cache.get_or_refresh(&server, &target("t"), at(1, 4), false).await?;
        assert_eq!(hit.task.folder, "one");
        assert_eq!(server.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_refreshes_when_stale_forced_or_task_changes() -> anyhow::Result<()> {
        let server = ScriptedServer::new(vec![
            Ok(payload("one")),
            Ok(payload("two")),
            Ok(payload("three")),
            Ok(payload("four")),
        ]);
        let mut cache = ConfigCache::new(Duration::from_secs(300));

        cache.get_or_refresh(&server, &target("t"), at(1, 0), false).await?;
        let stale = cache.get_or_refresh(&server, &target("t"), at(1, 5), false).await?;
        assert_eq!(stale.task.folder, "two");
        let forced = cache.get_or_refresh(&server, &target("t"), at(1, 6), true).await?;
        assert_eq!(forced.task.folder, "three");
        let other = cache.get_or_refresh(&server, &target("u"), at(1, 7), false).await?;
        assert_eq!(other.task.folder, "four");
        assert_eq!(other.task.id, "u");
        assert_eq!(server.calls(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_entry() -> anyhow::Result<()> {
        let server = ScriptedServer::new(vec![
            Ok(payload("one")),
            Err(AppError::ServerStatus { url: "u".into(), status: 502 }),
            Ok(json!({ "task": { "databases": [] } })),
        ]);
        let mut cache = ConfigCache::new(Duration::from_secs(300));
        cache.get_or_refresh(&server, &target("t"), at(1, 0), false).await?;

        assert!(cache.get_or_refresh(&server, &target("t"), at(1, 1), true).await.is_err());
        let missing_storage = cache.get_or_refresh(&server, &target("t"), at(1, 2), true).await;
        assert!(matches!(missing_storage, Err(AppError::MissingStorageConfig)));

        let kept = cache.entry.as_ref().expect("previous entry kept");
        assert_eq!(kept.task.folder, "one");
        assert_eq!(kept.fetched_at, at(1, 0));
        Ok(())
    }
}
