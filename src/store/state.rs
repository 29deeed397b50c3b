// backup-agent/src/store/state.rs
use chrono::{DateTime, NaiveDateTime};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::write_atomically;
use crate::errors::Result;

/// Last successful backup+upload per `database@time` key.
///
/// The whole file is read and rewritten on every mutation. A missing or
/// unreadable file is treated as empty so a torn write never stops backups.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> BTreeMap<String, NaiveDateTime> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "State file unreadable, assuming empty state");
                return BTreeMap::new();
            }
        };
        let raw: BTreeMap<String, String> = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "State file corrupt, assuming empty state");
                return BTreeMap::new();
            }
        };
        raw.into_iter()
            .filter_map(|(key, value)| match parse_timestamp(&value) {
                Some(ts) => Some((key, ts)),
                None => {
                    warn!(%key, %value, "Dropping unparseable state entry");
                    None
                }
            })
            .collect()
    }

    pub fn save(&self, state: &BTreeMap<String, NaiveDateTime>) -> Result<()> {
        let raw: BTreeMap<&str, String> = state
            .iter()
            .map(|(key, ts)| (key.as_str(), ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()))
            .collect();
        let json = serde_json::to_vec_pretty(&raw)?;
        write_atomically(&self.path, &json)
    }

    #[cfg(test)]
    pub fn last_success(&self, key: &str) -> Option<NaiveDateTime> {
        self.load().get(key).copied()
    }

    /// Sets `key` to `at` unless a later success is already recorded.
    /// Returns whether the stored value changed.
    pub fn record_success(&self, key: &str, at: NaiveDateTime) -> Result<bool> {
        let mut state = self.load();
        if state.get(key).is_some_and(|existing| *existing > at) {
            info!(%key, "Newer success already recorded, keeping it");
            return Ok(false);
        }
        state.insert(key.to_string(), at);
        self.save(&state)?;
        info!(%key, at = %at, "Recorded successful backup");
        Ok(true)
    }
}

/// Accepts naive ISO-8601 (`2024-03-10T02:05:00.123456`) as well as RFC 3339
/// with an offset, which is converted to its local wall-clock reading.
fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    value
        .parse::<NaiveDateTime>()
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.naive_local()))
}
