//! Worker registration, heartbeats, and the liveness sweeper (C4): a
//! background loop that reclaims work held by workers that have stopped
//! heartbeating.

use std::time::Duration;

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use coordinator_db::models::Worker;
use coordinator_db::queries::{tasks as task_db, workers as worker_db};

/// How often the sweeper checks for dead workers.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A worker is considered dead once its last heartbeat is older than this.
const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(180);

/// Register a new worker and mint its id.
pub async fn register(pool: &PgPool, session_tag: &str) -> Result<Worker> {
    worker_db::register_worker(pool, session_tag).await
}

/// Record a heartbeat for a worker. Returns `false` if the worker is not
/// registered (the caller should have it re-register).
pub async fn heartbeat(pool: &PgPool, worker_id: &str) -> Result<bool> {
    worker_db::heartbeat(pool, worker_id).await
}

/// Unregister a worker, reclaiming any task it currently holds back to
/// `pending` so another worker can claim it.
pub async fn unregister(pool: &PgPool, worker_id: &str) -> Result<()> {
    for task in task_db::list_tasks_for_worker(pool, worker_id).await? {
        task_db::reset_to_pending(pool, &task.id).await?;
    }
    worker_db::remove_worker(pool, worker_id).await
}

/// One sweep: find workers whose heartbeat is older than `timeout`, reset
/// any task they hold, and drop their registration.
///
/// Grounded on the original source's dead-agent cleanup service: the same
/// timeout comparison, lock release, task reset, and registry removal,
/// re-expressed against Postgres rows instead of Redis keys.
pub async fn sweep_once(pool: &PgPool, timeout: Duration) -> Result<Vec<String>> {
    let dead = worker_db::list_dead_workers(pool, ChronoDuration::from_std(timeout)?).await?;
    let mut reclaimed = Vec::new();

    for worker in &dead {
        for task in task_db::list_tasks_for_worker(pool, &worker.id).await? {
            tracing::warn!(
                worker_id = %worker.id,
                task_id = %task.id,
                "reclaiming task from dead worker"
            );
            task_db::reset_to_pending(pool, &task.id).await?;
        }
        worker_db::remove_worker(pool, &worker.id).await?;
        reclaimed.push(worker.id.clone());
    }

    Ok(reclaimed)
}

/// Run the liveness sweeper until `cancel` fires, sweeping every
/// [`SWEEP_INTERVAL`].
pub async fn run_sweeper(pool: PgPool, cancel: CancellationToken) {
    run_sweeper_with(pool, cancel, SWEEP_INTERVAL, DEFAULT_LIVENESS_TIMEOUT).await
}

async fn run_sweeper_with(
    pool: PgPool,
    cancel: CancellationToken,
    sweep_interval: Duration,
    liveness_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep_once(&pool, liveness_timeout).await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        tracing::info!(count = reclaimed.len(), "swept dead workers");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "liveness sweep failed"),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("liveness sweeper shutting down");
                return;
            }
        }
    }
}
