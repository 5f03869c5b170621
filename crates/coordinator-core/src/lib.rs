//! Coordination logic for a fleet of workers executing a dependency-ordered
//! task backlog: dependency analysis and phase layering, the task state
//! machine, worker registration and liveness, task claiming, the merge
//! queue, phase advancement, recovery on restart, and the pub/sub
//! notification substrate.

pub mod agent;
pub mod backlog;
pub mod claim;
pub mod dependency;
pub mod implementer;
pub mod isolation;
pub mod merge_queue;
pub mod notify;
pub mod phase;
pub mod recovery;
pub mod state;
pub mod worker_registry;
pub mod worktree;
