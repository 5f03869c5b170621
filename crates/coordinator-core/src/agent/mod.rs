//! Worker runtime (C8): the standalone process a fleet member runs to pull
//! tasks from the coordinator's HTTP API, implement them inside an isolated
//! workspace, and carry the result through the merge queue's reaction
//! protocol.
//!
//! Grounded on `original_source/template/tools/orchestrator/agent_client.py`:
//! `task_loop` becomes [`runtime::WorkerRuntime::run`], the Redis
//! notification-listener thread becomes the background heartbeat task in
//! the same module, and `execute_task`/`wait_for_implementation`/
//! `wait_for_fix` become the `Implementing`/`Reacting` state handlers.

pub mod client;
pub mod runtime;

pub use client::{ClaimResponse, CompleteRequest, CoordinatorClient, HeartbeatResponse, RegisterResponse};
pub use runtime::{WorkerConfig, WorkerRuntime, WorkerState};
