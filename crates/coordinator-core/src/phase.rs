//! Phase controller (C7): advances the active phase once every task in it
//! has reached a terminal state, and activates the next phase in sequence.

use anyhow::{Context, Result};
use sqlx::PgPool;

use coordinator_db::models::{Phase, TaskStatus};
use coordinator_db::queries::{phases as phase_db, tasks as task_db};

/// Outcome of checking whether the active phase can advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The active phase has tasks still in flight.
    StillActive,
    /// The active phase completed and the next phase was activated.
    Advanced { completed: String, next: Option<String> },
    /// The active phase completed and it was the last phase.
    AllPhasesComplete { completed: String },
    /// There was no active phase to check.
    NoActivePhase,
}

/// Check the current phase's member tasks; if every one has reached a
/// terminal status (`merged`, `failed`, or `blocked`), mark the phase
/// completed and activate the next pending phase.
///
/// Grounded on the original source's `_check_phase_advancement`: a phase is
/// "done" once nothing in it can still change state, regardless of whether
/// every task actually succeeded -- a phase with failed tasks still frees
/// its successors to start, since SPEC_FULL's dependency semantics only
/// require a dependency to be `merged` specifically, and any task depending
/// on a failed/blocked one will itself have already been blocked by
/// [`crate::state::TaskStateMachine::block_with_propagation`].
pub async fn check_advancement(pool: &PgPool) -> Result<AdvanceOutcome> {
    let Some(current) = phase_db::get_current_phase(pool).await? else {
        return Ok(AdvanceOutcome::NoActivePhase);
    };

    for task_id in &current.task_ids {
        let task = task_db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("phase member task {task_id} not found"))?;
        if !task.status.is_terminal() {
            return Ok(AdvanceOutcome::StillActive);
        }
    }

    phase_db::set_phase_completed(pool, current.id).await?;

    let phases = phase_db::list_phases(pool).await?;
    let next = phases.into_iter().find(|p| p.id > current.id);

    match next {
        Some(next_phase) => {
            phase_db::set_phase_active(pool, next_phase.id).await?;
            Ok(AdvanceOutcome::Advanced { completed: current.name, next: Some(next_phase.name) })
        }
        None => Ok(AdvanceOutcome::AllPhasesComplete { completed: current.name }),
    }
}

/// Whether every phase has reached `completed` -- the whole backlog is done.
pub async fn backlog_complete(pool: &PgPool) -> Result<bool> {
    let phases = phase_db::list_phases(pool).await?;
    Ok(!phases.is_empty() && phases.iter().all(|p: &Phase| p.status == coordinator_db::models::PhaseStatus::Completed))
}

/// Every task in a set of ids has reached a terminal status. Helper shared
/// by advancement checks and tests.
pub fn all_terminal(statuses: &[TaskStatus]) -> bool {
    statuses.iter().all(|s| s.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_terminal_requires_every_status_terminal() {
        assert!(all_terminal(&[TaskStatus::Merged, TaskStatus::Failed, TaskStatus::Blocked]));
        assert!(!all_terminal(&[TaskStatus::Merged, TaskStatus::InProgress]));
        assert!(all_terminal(&[]));
    }
}
