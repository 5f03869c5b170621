//! Query functions for the `merge_queue` table -- the FIFO queue consumed by
//! the merge queue worker (C6).

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use crate::models::MergeQueueEntry;

/// Enqueue a task's branch for merging, with `retry_count` 0.
pub async fn enqueue(
    pool: &PgPool,
    task_id: &str,
    branch_name: &str,
    pr_ref: Option<&str>,
    agent_id: &str,
) -> Result<MergeQueueEntry> {
    sqlx::query_as::<_, MergeQueueEntry>(
        "INSERT INTO merge_queue (task_id, branch_name, pr_ref, agent_id, queued_at, \
         retry_count, claimed_at) \
         VALUES ($1, $2, $3, $4, $5, 0, NULL) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(branch_name)
    .bind(pr_ref)
    .bind(agent_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to enqueue merge request")
}

/// Re-enqueue a task after a conflict/test-failure resolution attempt, with
/// `retry_count` incremented. Queued-at is reset to now so the entry goes to
/// the back of the FIFO queue.
pub async fn enqueue_retry(
    pool: &PgPool,
    task_id: &str,
    branch_name: &str,
    pr_ref: Option<&str>,
    agent_id: &str,
    retry_count: i32,
) -> Result<MergeQueueEntry> {
    sqlx::query_as::<_, MergeQueueEntry>(
        "INSERT INTO merge_queue (task_id, branch_name, pr_ref, agent_id, queued_at, \
         retry_count, claimed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, NULL) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(branch_name)
    .bind(pr_ref)
    .bind(agent_id)
    .bind(Utc::now())
    .bind(retry_count)
    .fetch_one(pool)
    .await
    .context("failed to re-enqueue merge request")
}

/// Pop the oldest unclaimed entry, marking it claimed. Uses
/// `FOR UPDATE SKIP LOCKED` so that only one merge worker task ever owns a
/// given entry, even if more than one worker loop is running.
pub async fn pop_next(pool: &PgPool) -> Result<Option<MergeQueueEntry>> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    let entry = sqlx::query_as::<_, MergeQueueEntry>(
        "SELECT * FROM merge_queue WHERE claimed_at IS NULL \
         ORDER BY queued_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
    )
    .fetch_optional(&mut *tx)
    .await
    .context("failed to pop merge queue entry")?;

    if let Some(ref entry) = entry {
        sqlx::query("UPDATE merge_queue SET claimed_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(entry.id)
            .execute(&mut *tx)
            .await
            .context("failed to mark merge queue entry claimed")?;
    }

    tx.commit().await.context("failed to commit merge queue pop")?;
    Ok(entry)
}

/// Remove an entry once it has been fully resolved (merged or handed off to
/// one of the conflict/test-failure/merge-failure handlers).
pub async fn delete_entry(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM merge_queue WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete merge queue entry")?;
    Ok(())
}

/// Number of entries currently queued (including claimed-but-in-flight ones).
pub async fn count_queue(pool: &PgPool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM merge_queue")
        .fetch_one(pool)
        .await
        .context("failed to count merge queue")?;
    Ok(count)
}
