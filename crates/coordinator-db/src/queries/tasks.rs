//! Query functions for the `tasks` and `task_dependencies` tables.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use crate::models::{Task, TaskDependency, TaskStatus, TaskType};

/// A task as read from the backlog, before it has a database row.
pub struct NewTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Option<String>,
    pub task_type: TaskType,
    pub priority: i32,
}

/// Insert a new task row in `pending` status. A no-op (returns the existing
/// row) if a task with the same id already exists, so that backlog
/// union-merge on recovery (SPEC_FULL §4.9 step 2d) is idempotent.
pub async fn insert_task_if_absent(pool: &PgPool, task: &NewTask) -> Result<Task> {
    let row = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, title, description, acceptance_criteria, task_type, priority, status) \
         VALUES ($1, $2, $3, $4, $5, $6, 'pending') \
         ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id \
         RETURNING *",
    )
    .bind(&task.id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(&task.acceptance_criteria)
    .bind(task.task_type)
    .bind(task.priority)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert task {}", task.id))?;

    Ok(row)
}

/// Insert a dependency edge `task_id` -> `depends_on`, ignoring duplicates.
pub async fn insert_dependency(pool: &PgPool, task_id: &str, depends_on: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on)
    .execute(pool)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Fetch a single task by id.
pub async fn get_task(pool: &PgPool, id: &str) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")
}

/// List every task in the backlog, ordered by creation time.
pub async fn list_all_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")
}

/// Return `true` if at least one task row exists (used to distinguish a
/// fresh start from a restart in recovery, SPEC_FULL §4.9 step 1).
pub async fn any_tasks_exist(pool: &PgPool) -> Result<bool> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
        .fetch_one(pool)
        .await
        .context("failed to count tasks")?;
    Ok(count.0 > 0)
}

/// Return every dependency edge in the backlog.
pub async fn list_all_dependencies(pool: &PgPool) -> Result<Vec<TaskDependency>> {
    sqlx::query_as::<_, TaskDependency>("SELECT * FROM task_dependencies")
        .fetch_all(pool)
        .await
        .context("failed to list task dependencies")
}

/// Return the dependency ids for a single task.
pub async fn get_dependencies(pool: &PgPool, task_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to fetch task dependencies")?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

/// Atomically claim a pending task for a worker: `pending -> in_progress`.
///
/// Returns `true` if this call won the race (the CAS primitive underlying
/// C5's claim algorithm, SPEC_FULL §4.4 step 2a/2b).
pub async fn claim_task(pool: &PgPool, task_id: &str, worker_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'in_progress', assigned_to = $1, started_at = $2 \
         WHERE id = $3 AND status = 'pending'",
    )
    .bind(worker_id)
    .bind(Utc::now())
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected() == 1)
}

/// Mark an in-progress task `done` (the worker committed and passed local
/// checks) or `failed` (worker-side failure, SPEC_FULL §4.8/§7 category 3).
/// Releases the task lock by clearing `assigned_to` only on failure; on
/// success `assigned_to` is left set until the merge queue resolves it, so
/// that the worker can still be identified for notification purposes.
pub async fn complete_task(pool: &PgPool, task_id: &str, success: bool) -> Result<()> {
    let status = if success { TaskStatus::Done } else { TaskStatus::Failed };
    let result = sqlx::query(
        "UPDATE tasks SET status = $1, completed_at = $2, \
         assigned_to = CASE WHEN $3 THEN assigned_to ELSE NULL END \
         WHERE id = $4 AND status = 'in_progress'",
    )
    .bind(status)
    .bind(Utc::now())
    .bind(success)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {task_id} was not in_progress");
    }
    Ok(())
}

/// Record branch/PR metadata produced when a worker finishes implementing.
pub async fn set_branch_and_pr(
    pool: &PgPool,
    task_id: &str,
    branch_name: Option<&str>,
    pr_ref: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET branch_name = $1, pr_ref = $2 WHERE id = $3")
        .bind(branch_name)
        .bind(pr_ref)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set branch/pr on task")?;
    Ok(())
}

/// Reset a task to `pending`, clearing assignment -- used by the liveness
/// sweeper (C4) and by unregister (both reclaim a worker's held task).
pub async fn reset_to_pending(pool: &PgPool, task_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET status = 'pending', assigned_to = NULL, started_at = NULL \
         WHERE id = $1",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to reset task to pending")?;
    Ok(())
}

/// Reset every `failed` task to `pending` (recovery's optional retry-failed
/// policy, SPEC_FULL §4.9 step 2c).
pub async fn retry_all_failed(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'pending', assigned_to = NULL, started_at = NULL \
         WHERE status = 'failed'",
    )
    .execute(pool)
    .await
    .context("failed to retry failed tasks")?;
    Ok(result.rows_affected())
}

/// Reset every `in_progress` task whose assignee is not among `live_worker_ids`
/// to `pending` (recovery's orphan reclamation, SPEC_FULL §4.9 step 2b).
pub async fn reset_orphaned_in_progress(pool: &PgPool, live_worker_ids: &[String]) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'pending', assigned_to = NULL, started_at = NULL \
         WHERE status = 'in_progress' AND NOT (assigned_to = ANY($1))",
    )
    .bind(live_worker_ids)
    .execute(pool)
    .await
    .context("failed to reset orphaned tasks")?;
    Ok(result.rows_affected())
}

/// Set a task `blocked` with a reason (C3 dependency-failure propagation).
/// No-op if the task is already terminal, preserving P2.
pub async fn set_blocked(pool: &PgPool, task_id: &str, reason: &str) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET status = 'blocked', blocked_reason = $1, completed_at = $2 \
         WHERE id = $3 AND status NOT IN ('merged', 'failed', 'blocked')",
    )
    .bind(reason)
    .bind(Utc::now())
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to block task")?;
    Ok(())
}

/// Optimistic-locking transition: `status` only moves from `from` to `to` if
/// it still reads `from` at the moment of the update. Returns whether this
/// call won the race, the primitive the state machine builds its transition
/// validation on top of.
pub async fn transition_status(
    pool: &PgPool,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<bool> {
    let result = if to == TaskStatus::Merged {
        sqlx::query(
            "UPDATE tasks SET status = $1, merged_at = $2 WHERE id = $3 AND status = $4",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(task_id)
        .bind(from)
        .execute(pool)
        .await
    } else {
        sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2 AND status = $3")
            .bind(to)
            .bind(task_id)
            .bind(from)
            .execute(pool)
            .await
    }
    .context("failed to transition task status")?;

    Ok(result.rows_affected() == 1)
}

/// Set a task's status unconditionally -- used by the merge queue worker to
/// move a task between its own non-terminal states (`conflict`,
/// `test_failed`, `merge_failed`) and to the terminal `merged` state.
pub async fn set_status(pool: &PgPool, task_id: &str, status: TaskStatus) -> Result<()> {
    let result = if status == TaskStatus::Merged {
        sqlx::query("UPDATE tasks SET status = $1, merged_at = $2 WHERE id = $3")
            .bind(status)
            .bind(Utc::now())
            .bind(task_id)
            .execute(pool)
            .await
    } else {
        sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(task_id)
            .execute(pool)
            .await
    }
    .context("failed to set task status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {task_id} not found");
    }
    Ok(())
}

/// List tasks currently held by a given worker (used on unregister).
pub async fn list_tasks_for_worker(pool: &PgPool, worker_id: &str) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE assigned_to = $1")
        .bind(worker_id)
        .fetch_all(pool)
        .await
        .context("failed to list tasks for worker")
}

#[cfg(test)]
mod tests {
    // Pure-logic helpers in this module are exercised indirectly through
    // coordinator-core's integration tests, which own a real database handle.
}
