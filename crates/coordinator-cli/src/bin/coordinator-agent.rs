//! Standalone worker process (C8): registers with a coordinator, claims
//! tasks, implements them inside an isolated workspace, and carries each
//! task through the merge queue's reaction protocol.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use coordinator_core::agent::{WorkerConfig, WorkerRuntime};
use coordinator_core::implementer::{Implementer, NoopImplementer};
use coordinator_core::isolation::create_isolation;

#[derive(Parser)]
#[command(name = "coordinator-agent", about = "Fleet worker process for a coordinator backlog")]
struct Cli {
    /// Base URL of the coordinator HTTP API.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    coordinator_url: String,
    /// Path to the repository this worker operates on.
    #[arg(long, default_value = ".")]
    repo_path: PathBuf,
    /// A label identifying this worker process in logs and the dashboard.
    #[arg(long, default_value = "worker")]
    session_tag: String,
    /// Base branch new task branches are created from and merged into.
    #[arg(long, default_value = "main")]
    base_branch: String,
    /// Shell command run in GATING before requesting merge; omit to skip local gating.
    #[arg(long)]
    test_command: Option<String>,
    /// Seconds between heartbeats.
    #[arg(long, default_value_t = 30)]
    heartbeat_interval_secs: u64,
    /// Open a PR after pushing (requires `gh` on PATH).
    #[arg(long)]
    open_pr: bool,
    /// Isolation backend for workspaces.
    #[arg(long, default_value = "worktree")]
    isolation_mode: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = WorkerConfig {
        coordinator_url: cli.coordinator_url,
        session_tag: cli.session_tag,
        base_branch: cli.base_branch,
        test_command: cli.test_command,
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
        open_pr: cli.open_pr,
    };

    let isolation = create_isolation(&cli.isolation_mode, &cli.repo_path)
        .context("failed to set up workspace isolation backend")?;
    let implementer: Arc<dyn Implementer> = Arc::new(NoopImplementer);

    let runtime = WorkerRuntime::new(config, isolation, implementer);

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested, finishing current task before exit");
        shutdown_cancel.cancel();
    });

    runtime.run(cancel).await
}
