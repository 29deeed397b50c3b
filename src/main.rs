//! Database Backup Agent
//!
//! Polls a task server, runs scheduled and on-demand database backups and
//! ships the artifacts to object storage.

// backup-agent/src/main.rs
mod backup;
mod cli;
mod config;
mod errors;
mod orchestrator;
mod remote;
mod schedule;
mod store;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use backup::{S3Uploader, SqlCmdExecutor};
use cli::{Cli, Commands};
use config::{ConfigSource, JsonFileSource};
use orchestrator::{Collaborators, Orchestrator, PointResult, TickReport};
use remote::HttpTaskServer;
use utils::{LogContext, SystemClock};

/// Cycles between heartbeat log lines in the service loop.
const HEARTBEAT_CYCLES: u64 = 20;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Backup agent failed: {:#}", e);
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let source = JsonFileSource::new(&cli.settings);
    let settings = source
        .load()
        .with_context(|| format!("Failed to load settings from {}", cli.settings.display()))?;

    let log = LogContext::install(&settings.log_dir, &settings.task_id, cli.verbose)
        .context("Failed to set up logging")?;
    info!(
        task_id = %settings.task_id,
        server = %settings.server_url,
        settings_file = %cli.settings.display(),
        "Backup agent starting"
    );

    let executor = SqlCmdExecutor::new(
        settings.dump_tool.clone(),
        settings.backup_dir.clone(),
        settings.dump_timeout,
    );
    let parts = Collaborators {
        config_source: Box::new(source),
        server: Arc::new(HttpTaskServer::new()),
        executor: Arc::new(executor),
        uploader: Arc::new(S3Uploader::new()),
        clock: Arc::new(SystemClock),
    };
    let mut orchestrator = Orchestrator::new(settings, parts, log);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(&mut orchestrator).await,
        Commands::Tick => {
            let report = orchestrator.tick().await;
            log_report(&report);
            if let Some(abort) = report.aborted {
                anyhow::bail!("Backup cycle aborted: {:?}", abort);
            }
            Ok(())
        }
        Commands::Emergency => {
            let outcome = orchestrator
                .run_emergency_now()
                .await
                .context("Emergency backup could not start")?;
            if !outcome.is_clean() {
                anyhow::bail!("Emergency backup incomplete, failed: {:?}", outcome.failed);
            }
            info!(databases = outcome.uploaded.len(), "Emergency backup complete");
            Ok(())
        }
        Commands::Scheduled => {
            let outcomes = orchestrator
                .run_manual_now()
                .await
                .context("Manual backup could not start")?;
            let failed: Vec<_> = outcomes
                .iter()
                .filter(|o| !matches!(o.result, PointResult::Uploaded { .. }))
                .map(|o| o.key.as_str())
                .collect();
            if !failed.is_empty() {
                anyhow::bail!("Manual backup incomplete, failed: {:?}", failed);
            }
            info!(databases = outcomes.len(), "Manual backup complete");
            Ok(())
        }
    }
}

/// Ticks every poll interval until a stop signal arrives. A running cycle is
/// always finished before the loop exits.
async fn run_service(orchestrator: &mut Orchestrator) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    info!(
        poll_interval_secs = orchestrator.settings().poll_interval.as_secs(),
        state_file = %orchestrator.state().path().display(),
        retry_queue = %orchestrator.queue().path().display(),
        queued_uploads = orchestrator.queue().pending().len(),
        "Service loop started"
    );
    let mut cycle: u64 = 0;
    while !shutdown.is_cancelled() {
        cycle += 1;
        let report = orchestrator.tick().await;
        log_report(&report);

        if cycle % HEARTBEAT_CYCLES == 0 {
            info!(
                cycle,
                task_id = %orchestrator.settings().task_id,
                "Service heartbeat"
            );
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(orchestrator.settings().poll_interval) => {}
        }
    }
    info!("Service loop stopped");
    Ok(())
}

fn log_report(report: &TickReport) {
    if let Some(diff) = &report.settings_changed {
        info!(
            task_changed = diff.task_id.is_some(),
            server_changed = diff.server_url.is_some(),
            api_key_changed = diff.api_key_changed,
            "Cycle ran with reloaded local settings"
        );
    }
    if let Some(abort) = &report.aborted {
        warn!(reason = ?abort, "Cycle ended early");
        return;
    }
    if report.retried.is_noop() && report.scheduled.is_empty() && report.emergency.is_none() {
        return;
    }
    info!(
        retried_uploaded = report.retried.uploaded.len(),
        retried_remaining = report.retried.remaining.len(),
        scheduled = report.scheduled.len(),
        emergency = report.emergency.is_some(),
        "Cycle finished"
    );
}

fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        info!("Stop signal received, finishing current cycle");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, only Ctrl-C will stop the service");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
