mod cleanup_cmd;
mod config;
mod serve_cmd;
mod status_cmd;

#[cfg(test)]
mod test_util;

use anyhow::Context;
use clap::{Parser, Subcommand};

use coordinator_db::pool;

use config::CoordinatorConfig;

#[derive(Parser)]
#[command(name = "coordinator", about = "Fleet task-coordination server for LLM coding agents")]
struct Cli {
    /// Database URL (overrides COORDINATOR_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a coordinator config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/coordinator")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the coordinator database, run migrations, and ingest the backlog
    DbInit {
        /// Path to the backlog YAML file; overrides the config file's worker.backlog_path
        #[arg(long)]
        backlog: Option<String>,
    },
    /// Run the coordinator HTTP API plus its background workers
    Serve {
        /// Address to bind the HTTP server to
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to bind the HTTP server to
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Path to the repository the merge queue worker operates on
        #[arg(long, default_value = ".")]
        repo_path: String,
        /// Base branch the merge queue worker merges task branches into
        #[arg(long, default_value = "main")]
        base_branch: String,
        /// Shell command the merge queue worker runs after merging, expected to exit 0
        #[arg(long)]
        test_command: Option<String>,
    },
    /// Show a snapshot of workers, phases, and tasks
    Status,
    /// Run an on-demand recovery sweep (reclaim orphaned tasks, optionally retry failed ones)
    Cleanup {
        /// Also reset every `failed` task back to `pending`
        #[arg(long)]
        retry_failed: bool,
    },
}

/// Execute the `coordinator init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: db_url.to_string() },
        worker: config::WorkerSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `coordinator db-init` to create the database and ingest a backlog.");

    Ok(())
}

/// Execute the `coordinator db-init` command: create database, run migrations, ingest backlog.
async fn cmd_db_init(cli_db_url: Option<&str>, backlog_override: Option<&str>) -> anyhow::Result<()> {
    let resolved = CoordinatorConfig::resolve(cli_db_url)?;

    println!("Initializing coordinator database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    let backlog_path = backlog_override.unwrap_or(&resolved.backlog_path);
    if std::path::Path::new(backlog_path).exists() {
        let contents = std::fs::read_to_string(backlog_path)
            .with_context(|| format!("failed to read backlog file at {backlog_path}"))?;
        let backlog = coordinator_core::backlog::parse_backlog(&contents)
            .with_context(|| format!("invalid backlog file at {backlog_path}"))?;
        coordinator_core::backlog::ingest(&db_pool, &backlog).await.context("failed to ingest backlog")?;
        println!("Ingested backlog from {backlog_path} ({} tasks).", backlog.backlog.len());
    } else {
        println!("No backlog file found at {backlog_path}; skipping ingestion.");
    }

    db_pool.close().await;

    println!("coordinator db-init complete.");
    Ok(())
}

/// Execute the `coordinator serve` command: HTTP API plus background workers.
async fn cmd_serve(
    cli_db_url: Option<&str>,
    bind: &str,
    port: u16,
    repo_path: &str,
    base_branch: &str,
    test_command: Option<String>,
) -> anyhow::Result<()> {
    let resolved = CoordinatorConfig::resolve(cli_db_url)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let startup = coordinator_core::recovery::recover(
        &db_pool,
        false,
        chrono::Duration::seconds(resolved.agent_timeout_secs as i64),
    )
    .await
    .context("startup recovery failed")?;
    if startup.is_fresh_start {
        tracing::info!("fresh start, no recovery needed");
    } else {
        tracing::info!(
            orphaned_tasks_reset = startup.orphaned_tasks_reset,
            resumed_phase = ?startup.resumed_phase,
            "recovery complete"
        );
    }

    let notifier = std::sync::Arc::new(coordinator_core::notify::Notifier::new());
    let cancel = tokio_util::sync::CancellationToken::new();

    let sweeper_pool = db_pool.clone();
    let sweeper_cancel = cancel.clone();
    let sweeper_handle = tokio::spawn(coordinator_core::worker_registry::run_sweeper(sweeper_pool, sweeper_cancel));

    let merge_pool = db_pool.clone();
    let merge_notifier = notifier.clone();
    let merge_cancel = cancel.clone();
    let merge_config = coordinator_core::merge_queue::MergeQueueConfig {
        repo_path: std::path::PathBuf::from(repo_path),
        base_branch: base_branch.to_string(),
        test_command,
    };
    let merge_handle =
        tokio::spawn(coordinator_core::merge_queue::run_merge_worker(merge_pool, merge_config, merge_notifier, merge_cancel));

    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        server_cancel.cancel();
    });

    let serve_result =
        serve_cmd::run_serve(db_pool.clone(), notifier, bind, port, resolved.agent_timeout_secs).await;

    cancel.cancel();
    let _ = merge_handle.await;
    let _ = sweeper_handle.await;
    db_pool.close().await;

    serve_result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit { backlog } => {
            cmd_db_init(cli.database_url.as_deref(), backlog.as_deref()).await?;
        }
        Commands::Serve { bind, port, repo_path, base_branch, test_command } => {
            cmd_serve(cli.database_url.as_deref(), &bind, port, &repo_path, &base_branch, test_command).await?;
        }
        Commands::Status => {
            let resolved = CoordinatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Cleanup { retry_failed } => {
            let resolved = CoordinatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = cleanup_cmd::run_cleanup(&db_pool, resolved.agent_timeout_secs, retry_failed).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
