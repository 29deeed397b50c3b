// backup-agent/src/config/task.rs
use serde::Deserialize;
use std::fmt;

use crate::errors::{AppError, Result};
use crate::schedule::{SchedulePoint, TimeOfDay, deserialize_times};

const DEFAULT_FOLDER: &str = "default_folder";
const DEFAULT_REGION: &str = "us-east-1";

/// Task definition as served by `GET /api/tasks/{id}/config`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default)]
    pub databases: Vec<Database>,
}

fn default_folder() -> String {
    DEFAULT_FOLDER.to_string()
}

impl Task {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.id)
    }

    /// Every `(database, time)` point of the task, in database order.
    pub fn schedule_points(&self) -> impl Iterator<Item = (&Database, SchedulePoint)> {
        self.databases.iter().flat_map(|db| {
            db.times
                .iter()
                .map(move |t| (db, SchedulePoint::new(db.name.clone(), t.clone())))
        })
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Database {
    pub name: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, alias = "password", alias = "secret")]
    pub pass: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default, deserialize_with = "deserialize_times")]
    pub times: Vec<TimeOfDay>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("user", &self.user)
            .field("pass", &"***")
            .field("prefix", &self.prefix)
            .field("times", &self.times)
            .finish()
    }
}

/// Object storage credentials delivered alongside the task.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct StorageCredentials {
    #[serde(default, alias = "access_key_id")]
    pub ak: String,
    #[serde(default, alias = "secret_access_key")]
    pub sk: String,
    #[serde(default, alias = "server", alias = "endpoint_url")]
    pub endpoint: String,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl StorageCredentials {
    pub fn is_complete(&self) -> bool {
        [&self.ak, &self.sk, &self.endpoint, &self.bucket_name]
            .iter()
            .all(|v| !v.trim().is_empty())
    }

    pub fn endpoint_url(&self) -> String {
        let endpoint = self.endpoint.trim();
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("https://{}", endpoint)
        }
    }

    pub fn region(&self) -> &str {
        self.region
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
    }
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("ak", &self.ak)
            .field("sk", &"***")
            .field("endpoint", &self.endpoint)
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .finish()
    }
}

/// The raw config response, before validation.
#[derive(Debug, Clone)]
pub struct TaskConfigPayload(pub serde_json::Value);

impl TaskConfigPayload {
    /// Splits the payload into task and storage. Either both are present and
    /// valid, or the payload is rejected as a whole.
    pub fn into_parts(self, task_id: &str) -> Result<(Task, StorageCredentials)> {
        let serde_json::Value::Object(mut body) = self.0 else {
            return Err(AppError::MissingTaskConfig);
        };

        let storage = body
            .remove("huawei_obs")
            .or_else(|| body.remove("storage"))
            .filter(|v| !v.is_null());

        let task_value = match body.remove("task") {
            Some(task) if !task.is_null() => task,
            _ if body.contains_key("databases") => serde_json::Value::Object(body),
            _ => return Err(AppError::MissingTaskConfig),
        };

        let mut task: Task = serde_json::from_value(task_value)?;
        if task.id.is_empty() {
            task.id = task_id.to_string();
        }

        let storage: StorageCredentials = match storage {
            Some(value) => serde_json::from_value(value)?,
            None => return Err(AppError::MissingStorageConfig),
        };
        if !storage.is_complete() {
            return Err(AppError::MissingStorageConfig);
        }

        Ok((task, storage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obs() -> serde_json::Value {
        json!({ "ak": "AK", "sk": "SK", "endpoint": "obs.cn-north-4.myhuaweicloud.com", "bucket_name": "bkt" })
    }

    #[test]
    fn test_payload_with_task_and_storage() -> anyhow::Result<()> {
        let payload = TaskConfigPayload(json!({
            "huawei_obs": obs(),
            "task": {
                "id": "t1",
                "name": "Nightly",
                "folder": "clinic",
                "databases": [
                    { "name": "orders", "server": "db01", "user": "sa", "pass": "pw", "times": "02:00,14:00" }
                ]
            }
        }));
        let (task, storage) = payload.into_parts("t1")?;

        assert_eq!(task.display_name(), "Nightly");
        assert_eq!(task.folder, "clinic");
        assert_eq!(task.databases[0].times.len(), 2);
        assert_eq!(storage.endpoint_url(), "https://obs.cn-north-4.myhuaweicloud.com");
        assert_eq!(storage.region(), "us-east-1");
        let keys: Vec<String> = task.schedule_points().map(|(_, p)| p.key()).collect();
        assert_eq!(keys, vec!["orders@02:00", "orders@14:00"]);
        Ok(())
    }

    #[test]
    fn test_payload_that_is_the_task_itself() -> anyhow::Result<()> {
        let payload = TaskConfigPayload(json!({
            "storage": obs(),
            "databases": [{ "name": "orders", "times": ["03:00"] }]
        }));
        let (task, _) = payload.into_parts("fallback-id")?;

        assert_eq!(task.id, "fallback-id");
        assert_eq!(task.display_name(), "fallback-id");
        assert_eq!(task.folder, "default_folder");
        Ok(())
    }

    #[test]
    fn test_payload_missing_parts() {
        let no_task = TaskConfigPayload(json!({ "huawei_obs": obs() }));
        assert!(matches!(no_task.into_parts("t"), Err(AppError::MissingTaskConfig)));

        let no_storage = TaskConfigPayload(json!({ "task": { "databases": [] } }));
        assert!(matches!(no_storage.into_parts("t"), Err(AppError::MissingStorageConfig)));

        let incomplete = TaskConfigPayload(json!({
            "task": { "databases": [] },
            "huawei_obs": { "ak": "AK", "sk": "", "endpoint": "e", "bucket_name": "b" }
        }));
        assert!(matches!(incomplete.into_parts("t"), Err(AppError::MissingStorageConfig)));
    }

    #[test]
    fn test_debug_redacts_secrets() -> anyhow::Result<()> {
        let db: Database = serde_json::from_value(json!({ "name": "orders", "password": "hunter2" }))?;
        assert_eq!(db.pass, "hunter2");
        assert!(!format!("{:?}", db).contains("hunter2"));
        let storage: StorageCredentials = serde_json::from_value(obs())?;
        assert!(!format!("{:?}", storage).contains("\"SK\""));
        Ok(())
    }
}
