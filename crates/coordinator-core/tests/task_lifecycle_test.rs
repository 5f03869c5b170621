//! Cross-component integration tests for the claim -> complete -> phase
//! advancement lifecycle (C3, C5, C7), and dependency-failure propagation
//! (C3). Mirrors the linear-chain and dependency-failure scenarios a
//! backlog runs through end to end, without a merge queue worker or HTTP
//! layer in the loop.

use coordinator_core::backlog::{self, parse_backlog};
use coordinator_core::claim;
use coordinator_core::phase::{self, AdvanceOutcome};
use coordinator_core::state::TaskStateMachine;
use coordinator_core::worker_registry;
use coordinator_db::models::TaskStatus;
use coordinator_db::queries::tasks as task_db;
use coordinator_test_utils::{create_test_db, drop_test_db};

const LINEAR_CHAIN: &str = r#"
backlog:
  - id: a
    title: Set up project
    description: Scaffold the repo.
    type: setup
  - id: b
    title: Implement feature
    description: Build the thing.
    type: development
    dependencies: [a]
  - id: c
    title: Write docs
    description: Document the thing.
    type: documentation
    dependencies: [b]
"#;

#[tokio::test]
async fn linear_chain_claims_and_merges_in_dependency_order() {
    let (pool, db_name) = create_test_db().await;

    let parsed = parse_backlog(LINEAR_CHAIN).unwrap();
    backlog::ingest(&pool, &parsed).await.unwrap();
    coordinator_db::queries::phases::set_phase_active(&pool, 1).await.unwrap();

    let worker = worker_registry::register(&pool, "test-worker").await.unwrap();

    // Only "a" has no unmet dependency, so it is the only claimable task.
    let claimed = claim::claim_next_task(&pool, &worker.id).await.unwrap().expect("a should be claimable");
    assert_eq!(claimed.id, "a");
    assert!(claim::claim_next_task(&pool, &worker.id).await.unwrap().is_none(), "b is still blocked on a");

    TaskStateMachine::transition(&pool, "a", TaskStatus::InProgress, TaskStatus::Done).await.unwrap();
    TaskStateMachine::transition(&pool, "a", TaskStatus::Done, TaskStatus::Merged).await.unwrap();

    let outcome = phase::check_advancement(&pool).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::StillActive), "phase 1 still has b and c pending");

    let claimed = claim::claim_next_task(&pool, &worker.id).await.unwrap().expect("b should now be claimable");
    assert_eq!(claimed.id, "b");

    worker_registry::unregister(&pool, &worker.id).await.unwrap();
    let task_b = task_db::get_task(&pool, "b").await.unwrap().unwrap();
    assert_eq!(task_b.status, TaskStatus::Pending, "unregister releases the held task back to pending");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failed_task_blocks_its_dependents() {
    let (pool, db_name) = create_test_db().await;

    let parsed = parse_backlog(LINEAR_CHAIN).unwrap();
    backlog::ingest(&pool, &parsed).await.unwrap();
    coordinator_db::queries::phases::set_phase_active(&pool, 1).await.unwrap();

    let worker = worker_registry::register(&pool, "test-worker").await.unwrap();
    claim::claim_next_task(&pool, &worker.id).await.unwrap().expect("a should be claimable");

    TaskStateMachine::transition(&pool, "a", TaskStatus::InProgress, TaskStatus::Failed).await.unwrap();
    let blocked = TaskStateMachine::block_with_propagation(&pool, "a", "worker reported failure").await.unwrap();
    assert!(blocked.contains(&"b".to_string()));
    assert!(blocked.contains(&"c".to_string()));

    let task_b = task_db::get_task(&pool, "b").await.unwrap().unwrap();
    assert_eq!(task_b.status, TaskStatus::Blocked);
    assert_eq!(task_b.blocked_reason.as_deref(), Some("worker reported failure"));

    assert!(claim::claim_next_task(&pool, &worker.id).await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dead_worker_sweep_reclaims_its_task() {
    let (pool, db_name) = create_test_db().await;

    let parsed = parse_backlog(LINEAR_CHAIN).unwrap();
    backlog::ingest(&pool, &parsed).await.unwrap();
    coordinator_db::queries::phases::set_phase_active(&pool, 1).await.unwrap();

    let worker = worker_registry::register(&pool, "test-worker").await.unwrap();
    claim::claim_next_task(&pool, &worker.id).await.unwrap().expect("a should be claimable");

    // A zero-second timeout makes every worker look dead for this test,
    // since we cannot fast-forward real clock time here.
    let reclaimed = worker_registry::sweep_once(&pool, std::time::Duration::from_secs(0)).await.unwrap();
    assert_eq!(reclaimed, vec![worker.id.clone()]);

    let task_a = task_db::get_task(&pool, "a").await.unwrap().unwrap();
    assert_eq!(task_a.status, TaskStatus::Pending);
    assert!(task_db::get_task(&pool, "a").await.unwrap().unwrap().assigned_to.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}
