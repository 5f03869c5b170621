//! Query functions for the `pending_notifications` table -- the durable
//! fallback for workers that miss a broadcast because they were not
//! connected at the moment it fired (SPEC_FULL §4.2/§6).

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use crate::models::PendingNotification;

/// Record a notification for later delivery.
pub async fn push_pending(
    pool: &PgPool,
    agent_id: &str,
    task_id: &str,
    event_type: &str,
    data: serde_json::Value,
) -> Result<PendingNotification> {
    sqlx::query_as::<_, PendingNotification>(
        "INSERT INTO pending_notifications (agent_id, task_id, event_type, data, created_at) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(agent_id)
    .bind(task_id)
    .bind(event_type)
    .bind(data)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to push pending notification")
}

/// List pending notifications for a worker, oldest first.
pub async fn list_pending(pool: &PgPool, agent_id: &str) -> Result<Vec<PendingNotification>> {
    sqlx::query_as::<_, PendingNotification>(
        "SELECT * FROM pending_notifications WHERE agent_id = $1 ORDER BY created_at ASC",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await
    .context("failed to list pending notifications")
}

/// Clear a single delivered notification.
pub async fn clear_pending(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM pending_notifications WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to clear pending notification")?;
    Ok(())
}

/// Clear every pending notification for a worker at once (used right after
/// a heartbeat response has drained the full backlog to the caller).
pub async fn clear_all_pending(pool: &PgPool, agent_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM pending_notifications WHERE agent_id = $1")
        .bind(agent_id)
        .execute(pool)
        .await
        .context("failed to clear pending notifications")?;
    Ok(())
}
