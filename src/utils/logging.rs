//! Logging context bound to the task the agent is serving.
//!
//! The global subscriber is installed once. The per-task file output sits
//! behind a `reload` handle owned by [`LogContext`], so switching tasks swaps
//! the file layer instead of rebuilding global state.

use std::path::{Path, PathBuf};

use tracing::{Span, info, info_span};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, reload};

use crate::errors::{AppError, Result};

type FileLayer = Box<dyn Layer<Registry> + Send + Sync>;

pub struct LogContext {
    task_id: String,
    log_dir: PathBuf,
    handle: Option<reload::Handle<FileLayer, Registry>>,
    guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogContext")
            .field("task_id", &self.task_id)
            .field("log_dir", &self.log_dir)
            .field("file_logging", &self.handle.is_some())
            .finish()
    }
}

/// Daily-rotated `task_{id}.log` in `log_dir`.
fn task_file_layer(log_dir: &Path, task_id: &str) -> Result<(FileLayer, WorkerGuard)> {
    std::fs::create_dir_all(log_dir).map_err(|e| AppError::local_storage(log_dir, e))?;
    let appender = tracing_appender::rolling::daily(log_dir, format!("task_{}.log", task_id));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .boxed();
    Ok((layer, guard))
}

impl LogContext {
    /// Tracks the task id only; no subscriber is touched.
    #[cfg(test)]
    pub fn detached(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            log_dir: PathBuf::new(),
            handle: None,
            guard: None,
        }
    }

    /// Installs the global subscriber: console output plus the task's log
    /// file. `RUST_LOG` overrides the default level.
    pub fn install(log_dir: impl Into<PathBuf>, task_id: impl Into<String>, verbose: bool) -> Result<Self> {
        let log_dir = log_dir.into();
        let task_id = task_id.into();
        let (file_layer, guard) = task_file_layer(&log_dir, &task_id)?;
        let (file_layer, handle) = reload::Layer::new(file_layer);

        let default_level = if verbose { "debug" } else { "info" };
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        tracing_subscriber::registry()
            .with(file_layer)
            .with(fmt::layer().with_target(false))
            .with(env_filter)
            .try_init()
            .map_err(|e| AppError::config(format!("Failed to install logging: {}", e)))?;

        Ok(Self {
            task_id,
            log_dir,
            handle: Some(handle),
            guard: Some(guard),
        })
    }

    #[cfg(test)]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Points file logging at `new_task_id`. No-op when the id is unchanged.
    pub fn reconfigure(&mut self, new_task_id: &str) -> Result<()> {
        if self.task_id == new_task_id {
            return Ok(());
        }
        if let Some(handle) = &self.handle {
            let (layer, guard) = task_file_layer(&self.log_dir, new_task_id)?;
            handle
                .reload(layer)
                .map_err(|e| AppError::config(format!("Failed to switch task log file: {}", e)))?;
            // Dropping the previous guard flushes the old task's file.
            self.guard = Some(guard);
        }
        info!(from = %self.task_id, to = %new_task_id, "Logging context switched to new task");
        self.task_id = new_task_id.to_string();
        Ok(())
    }

    /// Span every tick runs in.
    pub fn tick_span(&self) -> Span {
        info_span!("tick", task_id = %self.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_context_reconfigure() -> anyhow::Result<()> {
        let mut ctx = LogContext::detached("a");
        ctx.reconfigure("a")?;
        assert_eq!(ctx.task_id(), "a");
        ctx.reconfigure("b")?;
        assert_eq!(ctx.task_id(), "b");
        Ok(())
    }
}
