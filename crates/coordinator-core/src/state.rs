//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph and optimistic locking. Replaces the narrower
//! gate-pipeline graph this module started from with the richer status set
//! a task moves through on its way from the backlog to a merged commit.

use anyhow::{bail, Context, Result};
use sqlx::PgPool;

use coordinator_db::models::TaskStatus;
use coordinator_db::queries::tasks as db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending      -> in_progress  (claimed)
/// pending      -> blocked      (a dependency failed)
/// in_progress  -> done         (worker finished implementing)
/// in_progress  -> failed       (worker gave up)
/// in_progress  -> blocked      (a dependency failed while in flight)
/// done         -> merged       (merge queue succeeded)
/// done         -> conflict     (merge queue hit a git conflict)
/// done         -> test_failed  (merge queue's post-merge check failed)
/// done         -> merge_failed (merge queue hit an infrastructure error)
/// conflict     -> in_progress  (handed back to a worker to resolve)
/// conflict     -> blocked
/// test_failed  -> in_progress  (handed back to a worker to fix)
/// test_failed  -> blocked
/// merge_failed -> in_progress  (retried)
/// merge_failed -> blocked
/// ```
///
/// `merged`, `failed`, and `blocked` are terminal: once reached, a task
/// never re-enters another status except by explicit administrator reset.
pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, InProgress)
                | (Pending, Blocked)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (Done, Merged)
                | (Done, Conflict)
                | (Done, TestFailed)
                | (Done, MergeFailed)
                | (Conflict, InProgress)
                | (Conflict, Blocked)
                | (TestFailed, InProgress)
                | (TestFailed, Blocked)
                | (MergeFailed, InProgress)
                | (MergeFailed, Blocked)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Returns an error if the transition is not a valid edge, the task does
    /// not exist, or the current status no longer matches `from`.
    pub async fn transition(
        pool: &PgPool,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for task {task_id}");
        }

        let won = db::transition_status(pool, task_id, from, to)
            .await
            .with_context(|| format!("failed to transition task {task_id} from {from} to {to}"))?;

        if !won {
            let task = db::get_task(pool, task_id).await?;
            match task {
                None => bail!("task {task_id} not found"),
                Some(t) => {
                    bail!("optimistic lock failed: task {task_id} has status {}, expected {from}", t.status)
                }
            }
        }

        Ok(())
    }

    /// Block a task and propagate the same block to every task that
    /// (transitively) depends on it, because a blocked dependency can never
    /// resolve to satisfy a downstream task's precondition.
    ///
    /// Grounded on the original source's dependency-completion check: a task
    /// is only dispatchable once every dependency is complete, so a
    /// dependency that will never complete must sink the whole downstream
    /// subgraph rather than leave it stuck `pending` forever.
    pub async fn block_with_propagation(pool: &PgPool, task_id: &str, reason: &str) -> Result<Vec<String>> {
        db::set_blocked(pool, task_id, reason).await?;

        let mut blocked = vec![task_id.to_string()];
        let mut frontier = vec![task_id.to_string()];
        let all_deps = db::list_all_dependencies(pool).await?;

        while let Some(id) = frontier.pop() {
            for dep in &all_deps {
                if dep.depends_on == id && !blocked.contains(&dep.task_id) {
                    let downstream_reason = format!("upstream dependency {id} is blocked");
                    db::set_blocked(pool, &dep.task_id, &downstream_reason).await?;
                    blocked.push(dep.task_id.clone());
                    frontier.push(dep.task_id.clone());
                }
            }
        }

        Ok(blocked)
    }

    /// Whether every dependency of `task_id` has reached `merged` -- the
    /// precondition for a task becoming claimable.
    pub async fn dependencies_satisfied(pool: &PgPool, task_id: &str) -> Result<bool> {
        let dep_ids = db::get_dependencies(pool, task_id).await?;
        for dep_id in dep_ids {
            let dep = db::get_task(pool, &dep_id)
                .await?
                .with_context(|| format!("dependency task {dep_id} not found"))?;
            if dep.status != TaskStatus::Merged {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn claim_and_complete_are_valid() {
        assert!(TaskStateMachine::is_valid_transition(Pending, InProgress));
        assert!(TaskStateMachine::is_valid_transition(InProgress, Done));
        assert!(TaskStateMachine::is_valid_transition(InProgress, Failed));
    }

    #[test]
    fn merge_outcomes_are_valid_from_done() {
        assert!(TaskStateMachine::is_valid_transition(Done, Merged));
        assert!(TaskStateMachine::is_valid_transition(Done, Conflict));
        assert!(TaskStateMachine::is_valid_transition(Done, TestFailed));
        assert!(TaskStateMachine::is_valid_transition(Done, MergeFailed));
    }

    #[test]
    fn resolution_states_return_to_in_progress() {
        assert!(TaskStateMachine::is_valid_transition(Conflict, InProgress));
        assert!(TaskStateMachine::is_valid_transition(TestFailed, InProgress));
        assert!(TaskStateMachine::is_valid_transition(MergeFailed, InProgress));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for to in [Pending, InProgress, Done, Conflict, TestFailed, Merged, MergeFailed, Failed, Blocked] {
            assert!(!TaskStateMachine::is_valid_transition(Merged, to));
            assert!(!TaskStateMachine::is_valid_transition(Failed, to));
            assert!(!TaskStateMachine::is_valid_transition(Blocked, to));
        }
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(!TaskStateMachine::is_valid_transition(Pending, Done));
        assert!(!TaskStateMachine::is_valid_transition(Pending, Merged));
        assert!(!TaskStateMachine::is_valid_transition(Done, Failed));
    }
}
