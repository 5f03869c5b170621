//! `coordinator cleanup` command: run the same on-demand recovery sweep the
//! `/cleanup` HTTP route triggers (C9), without needing the server running.

use anyhow::Result;
use chrono::Duration;
use sqlx::PgPool;

use coordinator_core::recovery;

/// Run the cleanup command: reclaim orphaned in-progress tasks from dead
/// workers and, if `retry_failed` is set, re-queue failed tasks.
pub async fn run_cleanup(pool: &PgPool, agent_timeout_secs: u64, retry_failed: bool) -> Result<()> {
    let timeout = Duration::seconds(agent_timeout_secs as i64);
    let report = recovery::recover(pool, retry_failed, timeout).await?;

    if report.is_fresh_start {
        println!("Fresh start: no tasks to recover.");
        return Ok(());
    }

    println!("Orphaned tasks reset to pending: {}", report.orphaned_tasks_reset);
    if retry_failed {
        println!("Failed tasks retried: {}", report.failed_tasks_retried);
    }
    if report.phase_recomputed {
        match &report.resumed_phase {
            Some(name) => println!("Phases recomputed; resumed at: {name}"),
            None => println!("Phases recomputed; all phases complete."),
        }
    }

    Ok(())
}
