//! Workspace isolation abstraction.
//!
//! Decouples workspace creation from `WorktreeManager` behind a trait so a
//! worker's task execution never has to know it's looking at a git worktree.
//! The only backend this build ships is git worktrees; the trait exists so a
//! future backend doesn't require touching worker or merge-queue code.

pub mod worktree;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

/// Information about a created workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    /// Filesystem path to the workspace.
    pub path: PathBuf,
    /// Git branch checked out in this workspace.
    pub branch: Option<String>,
}

/// Trait for workspace isolation backends.
#[async_trait]
pub trait Isolation: Send + Sync {
    /// Human-readable name of the isolation backend (e.g. "worktree").
    fn name(&self) -> &str;

    /// Create an isolated workspace for a worker's task.
    async fn create_workspace(&self, worker_id: &str, task_id: &str) -> Result<WorkspaceInfo>;

    /// Remove a previously created workspace.
    async fn remove_workspace(&self, info: &WorkspaceInfo) -> Result<()>;
}

/// Factory function: create an isolation backend from a mode string.
pub fn create_isolation(mode: &str, repo_path: &Path) -> Result<Arc<dyn Isolation>> {
    match mode {
        "worktree" => {
            let mgr = crate::worktree::WorktreeManager::new(repo_path, None)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(Arc::new(worktree::WorktreeIsolation::new(mgr)))
        }
        other => {
            bail!("unknown isolation mode: {other:?} (expected \"worktree\")")
        }
    }
}
