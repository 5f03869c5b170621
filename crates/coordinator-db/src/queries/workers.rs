//! Query functions for the `workers` table and the worker-id sequence.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Worker, WorkerStatus};

/// Mint the next worker id from a durable monotonic sequence and register a
/// worker row in `idle` status. Using a dedicated sequence (rather than
/// counting live workers) keeps ids unique across the lifetime of a backlog
/// even as workers come and go (SPEC_FULL §9 resolution).
pub async fn register_worker(pool: &PgPool, session_tag: &str) -> Result<Worker> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    let (next,): (i64,) = sqlx::query_as("SELECT nextval('worker_id_seq')")
        .fetch_one(&mut *tx)
        .await
        .context("failed to mint worker id")?;
    let id = format!("worker-{next}");

    let worker = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers (id, session_tag, status, registered_at, last_heartbeat, \
         tasks_completed, tasks_failed) \
         VALUES ($1, $2, 'idle', $3, $3, 0, 0) \
         RETURNING *",
    )
    .bind(&id)
    .bind(session_tag)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert worker")?;

    tx.commit().await.context("failed to commit worker registration")?;
    Ok(worker)
}

/// Fetch a single worker by id.
pub async fn get_worker(pool: &PgPool, id: &str) -> Result<Option<Worker>> {
    sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worker")
}

/// Record a heartbeat. Idempotent: always advances `last_heartbeat`.
pub async fn heartbeat(pool: &PgPool, id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE workers SET last_heartbeat = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to record heartbeat")?;
    Ok(result.rows_affected() == 1)
}

/// List every registered worker.
pub async fn list_workers(pool: &PgPool) -> Result<Vec<Worker>> {
    sqlx::query_as::<_, Worker>("SELECT * FROM workers ORDER BY registered_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list workers")
}

/// Workers whose last heartbeat is within `timeout` of now (C4 liveness check).
pub async fn list_live_workers(pool: &PgPool, timeout: chrono::Duration) -> Result<Vec<Worker>> {
    let cutoff: DateTime<Utc> = Utc::now() - timeout;
    sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE last_heartbeat >= $1")
        .bind(cutoff)
        .fetch_all(pool)
        .await
        .context("failed to list live workers")
}

/// Workers whose last heartbeat is older than `timeout` (the sweeper's targets).
pub async fn list_dead_workers(pool: &PgPool, timeout: chrono::Duration) -> Result<Vec<Worker>> {
    let cutoff: DateTime<Utc> = Utc::now() - timeout;
    sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE last_heartbeat < $1")
        .bind(cutoff)
        .fetch_all(pool)
        .await
        .context("failed to list dead workers")
}

/// Remove a worker's registration row (unregister, or sweeper reclamation).
pub async fn remove_worker(pool: &PgPool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM workers WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to remove worker")?;
    Ok(())
}

/// Mark a worker `working` on a claimed task, recording its role.
pub async fn set_worker_working(pool: &PgPool, id: &str, task_id: &str, role: &str) -> Result<()> {
    sqlx::query(
        "UPDATE workers SET status = 'working', current_task = $1, current_role = $2 \
         WHERE id = $3",
    )
    .bind(task_id)
    .bind(role)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark worker working")?;
    Ok(())
}

/// Mark a worker `idle` again after completing a task, bumping the
/// appropriate completion counter.
pub async fn set_worker_idle(pool: &PgPool, id: &str, success: bool) -> Result<()> {
    let column = if success { "tasks_completed" } else { "tasks_failed" };
    let sql = format!(
        "UPDATE workers SET status = 'idle', current_task = NULL, current_role = NULL, \
         {column} = {column} + 1 WHERE id = $1"
    );
    sqlx::query(&sql)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark worker idle")?;
    Ok(())
}

/// Map a textual status string to the typed enum, for callers building
/// queries dynamically (kept private-ish by re-exporting only the enum).
pub fn parse_status(s: &str) -> Result<WorkerStatus> {
    s.parse::<WorkerStatus>()
        .map_err(|e| anyhow::anyhow!(e.to_string()))
}
