//! Merge queue worker (C6): a single-consumer background task that drains
//! the FIFO merge queue, merges each branch into the base branch, runs the
//! repository's test command, and routes the three failure modes (conflict,
//! test failure, merge-infrastructure failure) to their handlers.
//!
//! Structural port of the original source's `merge_coordinator.py`
//! (`_process_merge` / `_handle_conflict` / `_handle_test_failure` /
//! `_handle_merge_failure`), using `std::process::Command` for git/test
//! subprocess calls the way this codebase's lifecycle manager commits agent
//! work, and driven by a tokio interval + `CancellationToken` the way the
//! liveness sweeper and orchestrator shut down.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use coordinator_db::models::{MergeQueueEntry, TaskStatus};
use coordinator_db::queries::merge_queue as queue_db;

use crate::notify::{Notifier, TaskEvent};
use crate::state::TaskStateMachine;

/// How long to wait between queue polls when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Retries before a merge request is abandoned to `merge_failed` for good.
const MAX_MERGE_RETRIES: i32 = 3;

/// Outcome of attempting to merge one queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflict,
    TestFailed,
    MergeInfraFailed(String),
}

/// Repository-level configuration the merge worker needs.
#[derive(Debug, Clone)]
pub struct MergeQueueConfig {
    pub repo_path: PathBuf,
    pub base_branch: String,
    /// Shell command run after merging, expected to exit 0 on success.
    pub test_command: Option<String>,
}

/// Run the merge queue worker until `cancel` fires.
pub async fn run_merge_worker(pool: PgPool, config: MergeQueueConfig, notifier: std::sync::Arc<Notifier>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("merge queue worker shutting down");
                return;
            }
            entry = queue_db::pop_next(&pool) => {
                match entry {
                    Ok(Some(entry)) => {
                        if let Err(e) = process_entry(&pool, &config, &notifier, &entry).await {
                            tracing::error!(task_id = %entry.task_id, error = %e, "failed to process merge queue entry");
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to pop merge queue");
                        tokio::select! {
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                }
            }
        }
    }
}

/// The six-step pipeline for a single queue entry:
/// 1. transition the task `done -> conflict/test_failed/merge_failed/merged` per outcome
/// 2. attempt the git merge
/// 3. on success, run the test command
/// 4. route failures to their handlers
/// 5. notify the owning worker (`conflict_detected` / `tests_failed` / `merge_failed` /
///    `merge_success`)
/// 6. remove the entry from the queue once resolved
async fn process_entry(
    pool: &PgPool,
    config: &MergeQueueConfig,
    notifier: &Notifier,
    entry: &MergeQueueEntry,
) -> Result<()> {
    let outcome = attempt_merge(&config.repo_path, &config.base_branch, &entry.branch_name, config.test_command.as_deref());

    match outcome {
        MergeOutcome::Merged => handle_success(pool, notifier, entry).await?,
        MergeOutcome::Conflict => handle_conflict(pool, notifier, entry).await?,
        MergeOutcome::TestFailed => handle_test_failure(pool, notifier, entry).await?,
        MergeOutcome::MergeInfraFailed(ref reason) => {
            handle_merge_failure(pool, notifier, entry, reason).await?
        }
    }

    queue_db::delete_entry(pool, entry.id).await
}

async fn handle_success(pool: &PgPool, notifier: &Notifier, entry: &MergeQueueEntry) -> Result<()> {
    TaskStateMachine::transition(pool, &entry.task_id, TaskStatus::Done, TaskStatus::Merged).await?;
    notify(notifier, pool, entry, "merge_success", serde_json::json!({})).await;
    crate::phase::check_advancement(pool).await?;
    Ok(())
}

async fn handle_conflict(pool: &PgPool, notifier: &Notifier, entry: &MergeQueueEntry) -> Result<()> {
    TaskStateMachine::transition(pool, &entry.task_id, TaskStatus::Done, TaskStatus::Conflict).await?;
    notify(notifier, pool, entry, "conflict_detected", serde_json::json!({"branch": entry.branch_name})).await;
    Ok(())
}

async fn handle_test_failure(pool: &PgPool, notifier: &Notifier, entry: &MergeQueueEntry) -> Result<()> {
    TaskStateMachine::transition(pool, &entry.task_id, TaskStatus::Done, TaskStatus::TestFailed).await?;
    TaskStateMachine::transition(pool, &entry.task_id, TaskStatus::TestFailed, TaskStatus::InProgress)
        .await
        .ok();
    notify(notifier, pool, entry, "tests_failed", serde_json::json!({"branch": entry.branch_name})).await;
    Ok(())
}

async fn handle_merge_failure(
    pool: &PgPool,
    notifier: &Notifier,
    entry: &MergeQueueEntry,
    reason: &str,
) -> Result<()> {
    if entry.retry_count >= MAX_MERGE_RETRIES {
        // Terminal: the task stays `merge_failed`, an operator-intervention
        // state, not `failed` -- it must not block its dependents.
        TaskStateMachine::transition(pool, &entry.task_id, TaskStatus::Done, TaskStatus::MergeFailed).await?;
        notify(notifier, pool, entry, "merge_failed", serde_json::json!({"reason": reason, "retrying": false})).await;
    } else {
        // Non-terminal: the task stays `done` across the retry, since it
        // goes straight back into the queue rather than to a worker.
        tokio::time::sleep(Duration::from_secs(5 * (entry.retry_count as u64 + 1))).await;
        queue_db::enqueue_retry(
            pool,
            &entry.task_id,
            &entry.branch_name,
            entry.pr_ref.as_deref(),
            &entry.agent_id,
            entry.retry_count + 1,
        )
        .await?;
        notify(
            notifier,
            pool,
            entry,
            "merge_failed",
            serde_json::json!({"reason": reason, "retrying": true, "retry_count": entry.retry_count + 1}),
        )
        .await;
    }
    Ok(())
}

async fn notify(notifier: &Notifier, pool: &PgPool, entry: &MergeQueueEntry, event_type: &str, data: serde_json::Value) {
    let event = TaskEvent { task_id: entry.task_id.clone(), event_type: event_type.to_string(), data };
    if let Err(e) = notifier.publish(pool, &entry.agent_id, event).await {
        tracing::warn!(task_id = %entry.task_id, error = %e, "failed to publish merge queue notification");
    }
}

/// Merge `branch` into `base_branch` inside `repo_path`, then run the test
/// command if configured. Distinguishes a git conflict (abort + `Conflict`)
/// from a passing merge with a failing test command (`TestFailed`) from any
/// other subprocess failure (`MergeInfraFailed`).
fn attempt_merge(repo_path: &Path, base_branch: &str, branch: &str, test_command: Option<&str>) -> MergeOutcome {
    if let Err(e) = run_git(repo_path, &["checkout", base_branch]) {
        return MergeOutcome::MergeInfraFailed(format!("checkout {base_branch} failed: {e}"));
    }

    match run_git(repo_path, &["merge", "--no-edit", branch]) {
        Ok(()) => {}
        Err(_) => {
            let _ = run_git(repo_path, &["merge", "--abort"]);
            return MergeOutcome::Conflict;
        }
    }

    if let Some(cmd) = test_command {
        match run_shell(repo_path, cmd) {
            Ok(true) => MergeOutcome::Merged,
            Ok(false) => {
                let _ = run_git(repo_path, &["reset", "--hard", "HEAD~1"]);
                MergeOutcome::TestFailed
            }
            Err(e) => MergeOutcome::MergeInfraFailed(format!("test command failed to run: {e}")),
        }
    } else {
        MergeOutcome::Merged
    }
}

fn run_git(repo_path: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .with_context(|| format!("failed to run git {args:?}"))?;
    if !output.status.success() {
        anyhow::bail!("git {args:?} failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

fn run_shell(repo_path: &Path, command: &str) -> Result<bool> {
    let output = Command::new("sh")
        .args(["-c", command])
        .current_dir(repo_path)
        .output()
        .with_context(|| format!("failed to run test command {command:?}"))?;
    Ok(output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_outcome_variants_are_distinct() {
        assert_ne!(MergeOutcome::Merged, MergeOutcome::Conflict);
        assert_ne!(MergeOutcome::TestFailed, MergeOutcome::MergeInfraFailed("x".into()));
    }
}
