//! Git worktree management for agent isolation.
//!
//! Each agent task runs in its own git worktree, providing filesystem
//! isolation without the overhead of full repository clones. Worktrees
//! share the object store of the main repository but have independent
//! working directories and index files.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The main repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The worktree path already exists but is associated with a different
    /// branch than expected.
    #[error(
        "worktree path exists but has unexpected branch: expected {expected}, found {found}"
    )]
    BranchMismatch { expected: String, found: String },

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in this worktree, if any.
    pub branch: Option<String>,
    /// HEAD commit SHA.
    pub head_commit: String,
}

/// Manages git worktrees for agent isolation.
///
/// The manager operates relative to a main repository and places worktrees
/// in a configurable base directory (defaulting to a sibling directory of
/// the main repo named `<repo-name>-coordinator-worktrees`).
///
/// Git does not support concurrent worktree operations on the same
/// repository (it uses a lock file on the shared object store). This
/// manager serialises all mutating git operations through an internal
/// mutex so that concurrent lifecycle tasks do not race.
#[derive(Debug)]
pub struct WorktreeManager {
    /// Path to the main git repository.
    repo_path: PathBuf,
    /// Base directory under which worktrees are created.
    worktree_base: PathBuf,
    /// Serialises git operations to avoid lock-file contention.
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a new `WorktreeManager`.
    ///
    /// # Arguments
    ///
    /// * `repo_path` - Path to the main git repository.
    /// * `worktree_base` - Optional override for the worktree base directory.
    ///   If `None`, defaults to `../<repo-name>-coordinator-worktrees/` relative to
    ///   `repo_path`.
    ///
    /// # Errors
    ///
    /// Returns [`WorktreeError::NotAGitRepo`] if `repo_path` is not a git
    /// repository.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        // Verify this is a git repo by running `git rev-parse --git-dir`.
        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-coordinator-worktrees");
            repo_path
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Return the base directory where worktrees are created.
    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Return the main repository path.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Build the conventional branch name for a worker/task pair.
    ///
    /// Format: `<worker_id>/task-<task_id>`
    pub fn branch_name(worker_id: &str, task_id: &str) -> String {
        format!("{worker_id}/task-{task_id}")
    }

    /// Create a new worktree with the given branch name.
    ///
    /// The worktree directory is placed under `worktree_base/<dir_name>`
    /// where `<dir_name>` is the branch name with `/` replaced by `--` for
    /// filesystem safety.
    ///
    /// This operation is **idempotent**: if a worktree already exists at the
    /// expected path with the expected branch, it is returned as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if the git command fails. Any partial state (e.g. a
    /// directory that was created before the failure) is cleaned up on a
    /// best-effort basis.
    pub fn create_worktree(
        &self,
        branch_name: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir_name = branch_name.replace('/', "--");
        let worktree_path = self.worktree_base.join(&dir_name);

        // Check if this worktree already exists.
        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            // Verify the branch matches.
            if let Some(ref branch) = existing.branch {
                if branch == branch_name {
                    tracing::info!(
                        path = %worktree_path.display(),
                        branch = branch_name,
                        "worktree already exists, returning existing"
                    );
                    return Ok(existing);
                }
                return Err(WorktreeError::BranchMismatch {
                    expected: branch_name.to_string(),
                    found: branch.clone(),
                });
            }
            // Detached HEAD at the path -- treat as existing and return.
            tracing::info!(
                path = %worktree_path.display(),
                "worktree exists with detached HEAD, returning existing"
            );
            return Ok(existing);
        }

        // Ensure the worktree base directory exists.
        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| {
                WorktreeError::GitCommand {
                    message: format!(
                        "failed to create worktree base directory: {}",
                        self.worktree_base.display()
                    ),
                    source: e,
                }
            })?;
        }

        // Check if the branch already exists. If so, check it out in a new
        // worktree rather than creating a new branch.
        let branch_exists = self.branch_exists(branch_name)?;

        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&worktree_path)
                .arg(branch_name)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: "failed to run git worktree add".into(),
                    source: e,
                })?
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(branch_name)
                .arg(&worktree_path)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: "failed to run git worktree add -b".into(),
                    source: e,
                })?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // Clean up partial state if a directory was created.
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        // Read back the worktree info to confirm creation.
        self.find_worktree_by_path(&worktree_path)
    }

    /// Remove a worktree by its path.
    ///
    /// This removes the worktree directory and unregisters it from git.
    /// If the worktree does not exist, this is a no-op (idempotent).
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        // Check if the worktree exists in git's list first.
        if self.find_worktree_by_path(path).is_err() {
            // Worktree not registered. Clean up the directory if it exists.
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but not registered as worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // If the error says the worktree doesn't exist, treat as success.
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// List all worktrees associated with the main repository.
    fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_porcelain_output(&stdout)
    }

    /// Prune stale worktree entries.
    ///
    /// Runs `git worktree prune` to clean up references to worktrees
    /// whose directories have been removed externally. Used on the
    /// best-effort cleanup path after a failed `create_worktree`.
    fn cleanup_stale(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Check whether a branch exists in the repository.
    fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;

        Ok(output.status.success())
    }

    /// Find a worktree by its path in the worktree list.
    fn find_worktree_by_path(
        &self,
        path: &Path,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        // Canonicalize for comparison where possible.
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt
                .path
                .canonicalize()
                .unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(WorktreeError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    /// Best-effort cleanup of a partially created worktree directory.
    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        // Also try to prune stale entries.
        let _ = self.cleanup_stale();
    }
}

/// Parse the porcelain output of `git worktree list --porcelain`.
///
/// The format consists of blocks separated by blank lines. Each block has:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// The main worktree may show `bare` instead of `branch`, and detached
/// worktrees show `detached` instead of `branch`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            // End of a block -- commit the current entry if we have one.
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take())
            {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            // Strip the refs/heads/ prefix to get the short branch name.
            let branch = rest
                .strip_prefix("refs/heads/")
                .unwrap_or(rest)
                .to_string();
            current_branch = Some(branch);
        }
        // Ignore `bare`, `detached`, `prunable`, etc.
    }

    // Handle the last block (porcelain output may not end with a blank line).
    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}
