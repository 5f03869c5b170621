//! The `Implementer` trait -- the pluggable interface a worker uses to
//! actually perform a task's work inside its isolated workspace.
//!
//! Renamed from this codebase's harness/adapter concept: where a harness
//! drives a conversational coding agent end-to-end, an implementer here is
//! a narrower capability a worker invokes once per task -- "make this
//! workspace satisfy this task's acceptance criteria" -- and reports back a
//! single success/failure verdict rather than a stream of events.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use coordinator_db::models::Task;

/// Adapter interface for implementing a task inside a worker's workspace.
///
/// Object-safe so it can be stored as `Arc<dyn Implementer>` in
/// [`ImplementerRegistry`].
#[async_trait]
pub trait Implementer: Send + Sync {
    /// Human-readable name for this implementer (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Attempt to implement `task` inside `workspace`. Returns `Ok(true)`
    /// if the implementer believes the task is done, `Ok(false)` if it
    /// gave up without an error, and `Err` on an unrecoverable failure.
    async fn implement(&self, task: &Task, workspace: &Path) -> Result<bool>;
}

/// A no-op implementer that reports success without touching the
/// workspace, matching this codebase's `NoopHarness` test double. Useful as
/// the default when a worker is driven by an external human or tool that
/// commits to the workspace directly and the coordinator only needs to
/// observe the result.
pub struct NoopImplementer;

#[async_trait]
impl Implementer for NoopImplementer {
    fn name(&self) -> &str {
        "noop"
    }

    async fn implement(&self, _task: &Task, _workspace: &Path) -> Result<bool> {
        Ok(true)
    }
}

/// A named collection of implementers a worker can select from by task type
/// or explicit configuration.
#[derive(Default)]
pub struct ImplementerRegistry {
    implementers: HashMap<String, Arc<dyn Implementer>>,
}

impl ImplementerRegistry {
    pub fn new() -> Self {
        Self { implementers: HashMap::new() }
    }

    pub fn register(&mut self, implementer: Arc<dyn Implementer>) {
        self.implementers.insert(implementer.name().to_string(), implementer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Implementer>> {
        self.implementers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.implementers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coordinator_db::models::{TaskStatus, TaskType};

    fn sample_task() -> Task {
        Task {
            id: "t1".to_string(),
            title: "Sample".to_string(),
            description: "A sample task.".to_string(),
            acceptance_criteria: None,
            task_type: TaskType::Development,
            priority: 0,
            status: TaskStatus::InProgress,
            assigned_to: Some("worker-1".to_string()),
            branch_name: None,
            pr_ref: None,
            blocked_reason: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            merged_at: None,
        }
    }

    #[test]
    fn implementer_is_object_safe() {
        let implementer: Arc<dyn Implementer> = Arc::new(NoopImplementer);
        assert_eq!(implementer.name(), "noop");
    }

    #[tokio::test]
    async fn noop_implementer_always_succeeds() {
        let implementer = NoopImplementer;
        let task = sample_task();
        let ok = implementer.implement(&task, Path::new("/tmp")).await.unwrap();
        assert!(ok);
    }

    #[test]
    fn registry_round_trips() {
        let mut registry = ImplementerRegistry::new();
        registry.register(Arc::new(NoopImplementer));
        assert!(registry.get("noop").is_some());
        assert_eq!(registry.list(), vec!["noop"]);
    }
}
