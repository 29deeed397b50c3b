// backup-agent/src/store/failure_queue.rs
use chrono::NaiveDateTime;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::write_atomically;
use crate::errors::{AppError, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// An artifact whose upload failed.
///
/// On disk this is one line: the absolute path, optionally followed by a tab,
/// the originating `database@time` key, a tab and the backup timestamp.
/// Lines holding only a path are read as entries without schedule context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub path: PathBuf,
    pub origin: Option<UploadOrigin>,
}

/// The schedule point an artifact was produced for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOrigin {
    pub key: String,
    pub backed_up_at: NaiveDateTime,
}

impl PendingUpload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            origin: None,
        }
    }

    pub fn for_point(path: impl Into<PathBuf>, key: impl Into<String>, backed_up_at: NaiveDateTime) -> Self {
        Self {
            path: path.into(),
            origin: Some(UploadOrigin {
                key: key.into(),
                backed_up_at,
            }),
        }
    }

    fn to_line(&self) -> String {
        match &self.origin {
            Some(origin) => format!(
                "{}\t{}\t{}",
                self.path.display(),
                origin.key,
                origin.backed_up_at.format(TIMESTAMP_FORMAT)
            ),
            None => self.path.display().to_string(),
        }
    }

    fn from_line(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let path = fields.next().map(str::trim).filter(|p| !p.is_empty())?;
        let origin = match (fields.next(), fields.next()) {
            (Some(key), Some(ts)) if !key.is_empty() => ts
                .trim()
                .parse::<NaiveDateTime>()
                .ok()
                .map(|backed_up_at| UploadOrigin {
                    key: key.to_string(),
                    backed_up_at,
                }),
            _ => None,
        };
        Some(Self {
            path: PathBuf::from(path),
            origin,
        })
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Outcome of one pass over the queue.
#[derive(Debug, Default)]
pub struct DrainSummary {
    pub uploaded: Vec<PendingUpload>,
    pub missing: Vec<PendingUpload>,
    pub remaining: Vec<PendingUpload>,
}

impl DrainSummary {
    pub fn is_noop(&self) -> bool {
        self.uploaded.is_empty() && self.missing.is_empty() && self.remaining.is_empty()
    }
}

/// Durable newline-delimited list of artifacts awaiting upload.
#[derive(Debug, Clone)]
pub struct FailureQueue {
    path: PathBuf,
}

impl FailureQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry. Duplicates from a crash between write and sync are
    /// harmless: the second copy is dropped once the file is gone.
    pub fn enqueue(&self, entry: &PendingUpload) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| AppError::local_storage(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AppError::local_storage(&self.path, e))?;
        writeln!(file, "{}", entry.to_line())
            .and_then(|_| file.sync_data())
            .map_err(|e| AppError::local_storage(&self.path, e))?;
        warn!(file = %entry.file_name(), "Upload failed, artifact added to retry queue");
        Ok(())
    }

    /// Current queue contents, first occurrence of each path only.
    pub fn pending(&self) -> Vec<PendingUpload> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Retry queue unreadable, treating as empty");
                return Vec::new();
            }
        };
        let mut entries: Vec<PendingUpload> = Vec::new();
        for entry in content.lines().filter_map(PendingUpload::from_line) {
            if !entries.iter().any(|known| known.path == entry.path) {
                entries.push(entry);
            }
        }
        entries
    }

    /// Retries every queued upload once.
    ///
    /// Entries whose file vanished are dropped; successful uploads delete the
    /// local file and are dropped; failures stay. The file is then rewritten
    /// with exactly the remaining entries.
    pub async fn drain_and_retry<F, Fut>(&self, mut upload: F) -> DrainSummary
    where
        F: FnMut(PendingUpload) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let pending = self.pending();
        let mut summary = DrainSummary::default();
        if pending.is_empty() {
            return summary;
        }
        info!(count = pending.len(), "Retrying queued uploads");

        for entry in pending {
            if !entry.path.exists() {
                warn!(file = %entry.path.display(), "Queued artifact no longer exists, dropping it");
                summary.missing.push(entry);
                continue;
            }
            info!(file = %entry.file_name(), "Retrying upload");
            match upload(entry.clone()).await {
                Ok(()) => {
                    info!(file = %entry.file_name(), "Queued artifact uploaded");
                    if let Err(e) = fs::remove_file(&entry.path) {
                        error!(file = %entry.path.display(), error = %e, "Failed to delete uploaded artifact");
                    }
                    summary.uploaded.push(entry);
                }
                Err(e) => {
                    error!(file = %entry.file_name(), error = %e, "Retry failed, keeping artifact queued");
                    summary.remaining.push(entry);
                }
            }
        }

        let body: String = summary
            .remaining
            .iter()
            .map(|entry| entry.to_line() + "\n")
            .collect();
        if let Err(e) = write_atomically(&self.path, body.as_bytes()) {
            error!(error = %e, "Failed to rewrite retry queue");
        } else if summary.remaining.is_empty() {
            info!("All queued uploads resolved");
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::cell::RefCell;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn artifact(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"backup").unwrap();
        path
    }

    #[test]
    fn test_line_format_with_and_without_origin() {
        let with = PendingUpload::for_point("/b/orders.bak", "orders@02:00", at(2, 5));
        assert_eq!(with.to_line(), "/b/orders.bak\torders@02:00\t2024-03-10T02:05:00.000000");
        assert_eq!(PendingUpload::from_line(&with.to_line()), Some(with));

        let legacy = PendingUpload::from_line("C:\\backups\\orders_20240310_020500_SCHEDULED.bak").unwrap();
        assert!(legacy.origin.is_none());
        assert_eq!(PendingUpload::from_line("   "), None);
    }

    #[test]
    fn test_enqueue_appends_and_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let queue_path = dir.path().join("logs").join("failed_uploads.log");
        FailureQueue::new(&queue_path).enqueue(&PendingUpload::new("/b/one.bak"))?;
        FailureQueue::new(&queue_path)
            .enqueue(&PendingUpload::for_point("/b/two.bak", "orders@02:00", at(2, 5)))?;
        FailureQueue::new(&queue_path).enqueue(&PendingUpload::new("/b/one.bak"))?;

        let pending = FailureQueue::new(&queue_path).pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].path, PathBuf::from("/b/one.bak"));
        assert_eq!(pending[1].origin.as_ref().unwrap().key, "orders@02:00");
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_uploads_deletes_and_keeps_failures() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ok = artifact(dir.path(), "ok.bak");
        let bad = artifact(dir.path(), "bad.bak");
        let queue = FailureQueue::new(dir.path().join("failed_uploads.log"));
        queue.enqueue(&PendingUpload::new(&ok))?;
        queue.enqueue(&PendingUpload::new(&bad))?;

        let summary = queue
            .drain_and_retry(|entry| async move {
                if entry.path.ends_with("bad.bak") {
                    Err(AppError::Upload { status: Some(503), code: "SlowDown".into(), message: "busy".into() })
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(summary.uploaded.len(), 1);
        assert_eq!(summary.remaining.len(), 1);
        assert!(!ok.exists());
        assert!(bad.exists());
        assert_eq!(queue.pending(), vec![PendingUpload::new(&bad)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_drops_missing_artifacts_without_uploading() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let queue = FailureQueue::new(dir.path().join("failed_uploads.log"));
        queue.enqueue(&PendingUpload::new(dir.path().join("deleted-out-of-band.bak")))?;

        let attempts = RefCell::new(0);
        let summary = queue
            .drain_and_retry(|_| {
                *attempts.borrow_mut() += 1;
                async { Ok(()) }
            })
            .await;

        assert_eq!(*attempts.borrow(), 0);
        assert_eq!(summary.missing.len(), 1);
        assert!(queue.pending().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_twice_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let queue = FailureQueue::new(dir.path().join("failed_uploads.log"));
        queue.enqueue(&PendingUpload::new(artifact(dir.path(), "a.bak")))?;

        let first = queue.drain_and_retry(|_| async { Ok(()) }).await;
        assert_eq!(first.uploaded.len(), 1);
        assert!(queue.pending().is_empty());

        let attempts = RefCell::new(0);
        let second = queue
            .drain_and_retry(|_| {
                *attempts.borrow_mut() += 1;
                async { Ok(()) }
            })
            .await;
        assert!(second.is_noop());
        assert_eq!(*attempts.borrow(), 0);
        assert_eq!(fs::read_to_string(queue.path())?, "");
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_on_missing_queue_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FailureQueue::new(dir.path().join("never-written.log"));
        let summary = queue.drain_and_retry(|_| async { Ok(()) }).await;
        assert!(summary.is_noop());
        assert!(!queue.path().exists());
    }
}
