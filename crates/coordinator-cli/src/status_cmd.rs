//! `coordinator status` command: print a snapshot of workers, tasks, and
//! phase progress.

use anyhow::Result;
use sqlx::PgPool;

use coordinator_db::queries::{merge_queue as queue_db, phases as phase_db, tasks as task_db, workers as worker_db};

/// Run the status command: workers, phases, and per-task listing.
pub async fn run_status(pool: &PgPool) -> Result<()> {
    let phases = phase_db::list_phases(pool).await?;
    println!("Phases:");
    if phases.is_empty() {
        println!("  (none -- backlog not yet ingested)");
    }
    for phase in &phases {
        println!("  [{}] {} ({})", phase.id, phase.name, phase.status);
    }
    println!();

    let workers = worker_db::list_workers(pool).await?;
    println!("Workers:");
    if workers.is_empty() {
        println!("  (none registered)");
    }
    for worker in &workers {
        let current = worker.current_task.as_deref().unwrap_or("-");
        println!("  {} [{}] task={}", worker.id, worker.status, current);
    }
    println!();

    let tasks = task_db::list_all_tasks(pool).await?;
    println!("Tasks:");
    for task in &tasks {
        let assigned = task.assigned_to.as_deref().unwrap_or("-");
        println!("  [{}] {} ({}, assigned={})", task.status, task.id, task.title, assigned);
    }
    println!();

    let depth = queue_db::count_queue(pool).await?;
    println!("Merge queue depth: {depth}");

    Ok(())
}
