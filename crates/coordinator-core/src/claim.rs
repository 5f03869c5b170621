//! Task claiming (C5): picks the highest-priority claimable task for a
//! worker and atomically assigns it, retrying on contention.

use anyhow::Result;
use sqlx::PgPool;

use coordinator_db::models::{Task, TaskStatus, TaskType};
use coordinator_db::queries::phases as phase_db;
use coordinator_db::queries::tasks as task_db;

use crate::state::TaskStateMachine;

/// Bounded retries against claim contention, mirroring the original source's
/// `find_next_available_task` retry loop.
const MAX_CLAIM_ATTEMPTS: usize = 10;

/// The role a worker should adopt while executing a task, derived from its
/// type. Surfaced to the worker so it can select the right local tooling.
pub fn role_for_type(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Setup => "setup-specialist",
        TaskType::Development => "developer",
        TaskType::Testing => "tester",
        TaskType::Security => "security-auditor",
        TaskType::Documentation => "technical-writer",
        TaskType::Review => "code-reviewer",
    }
}

/// Find and claim the next eligible task for `worker_id`.
///
/// A task is eligible if it is `pending`, belongs to the active phase, and
/// every dependency has reached `merged`. Candidates are considered in
/// descending priority, then creation order, so that higher-priority work is
/// preferred. Returns `None` if no task is currently claimable (including
/// when there is no active phase).
pub async fn claim_next_task(pool: &PgPool, worker_id: &str) -> Result<Option<Task>> {
    let Some(phase) = phase_db::get_current_phase(pool).await? else {
        return Ok(None);
    };

    for attempt in 0..MAX_CLAIM_ATTEMPTS {
        let mut candidates: Vec<Task> = task_db::list_all_tasks(pool)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending && phase.task_ids.contains(&t.id))
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));

        let mut eligible = Vec::with_capacity(candidates.len());
        for task in candidates.drain(..) {
            if TaskStateMachine::dependencies_satisfied(pool, &task.id).await? {
                eligible.push(task);
            }
        }

        for task in eligible {
            if task_db::claim_task(pool, &task.id, worker_id).await? {
                return Ok(task_db::get_task(pool, &task.id).await?);
            }
            tracing::debug!(
                task_id = %task.id,
                worker_id = %worker_id,
                attempt,
                "lost claim race, trying next candidate"
            );
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_mapping_is_total() {
        for t in [
            TaskType::Setup,
            TaskType::Development,
            TaskType::Testing,
            TaskType::Security,
            TaskType::Documentation,
            TaskType::Review,
        ] {
            assert!(!role_for_type(t).is_empty());
        }
    }
}
