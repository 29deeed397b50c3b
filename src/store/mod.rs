// backup-agent/src/store/mod.rs
//! Durable state that survives restarts: last-success times per schedule
//! point and the queue of artifacts awaiting upload.

pub mod failure_queue;
pub mod state;

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::errors::{AppError, Result};

pub use failure_queue::{DrainSummary, FailureQueue, PendingUpload};
pub use state::StateStore;

/// Replaces `path` with `contents` via a temp file in the same directory and
/// a rename, so readers see either the old or the new file.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| AppError::local_storage(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| AppError::local_storage(dir, e))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| AppError::local_storage(path, e))?;
    tmp.persist(path)
        .map_err(|e| AppError::local_storage(path, e.error))?;
    Ok(())
}
