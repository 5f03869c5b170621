//! The worker state machine (SPEC_FULL §4.8):
//!
//! ```text
//! REGISTERING -> IDLE <-> (CLAIMING -> PREPARING -> IMPLEMENTING -> GATING
//!                           -> REQUESTING_MERGE -> REACTING) -> IDLE | EXITING
//! ```
//!
//! Runs as two cooperating async tasks sharing a bounded channel: this
//! module's foreground loop drives the state machine, while a background
//! task (spawned by [`WorkerRuntime::run`]) heartbeats on an interval and
//! forwards any notifications the coordinator had queued for this worker.
//! Grounded on `original_source/.../agent_client.py`'s `task_loop` (main
//! loop + timing constants) and its background notification-listener
//! thread, collapsed into a channel instead of a second network connection
//! since this build folds notification delivery into the heartbeat
//! response (see `agent::client::HeartbeatResponse`).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use coordinator_db::models::Task;

use crate::agent::client::{ClaimResponse, CompleteRequest, CoordinatorClient};
use crate::implementer::Implementer;
use crate::isolation::Isolation;
use crate::notify::TaskEvent;

/// How long to sleep after finding no claimable task before retrying.
const NO_TASK_SLEEP: Duration = Duration::from_secs(3);

/// Default interval between heartbeats.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How often to poll the workspace's HEAD for a new commit while waiting on
/// implementation or a fix.
const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum time to wait for an implementation commit before giving up.
const IMPLEMENTING_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Maximum time to wait for a conflict/test-failure fix before giving up.
const REACTING_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Everything a worker needs to run independently of the coordinator process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub coordinator_url: String,
    pub session_tag: String,
    pub base_branch: String,
    /// Shell command run in GATING before requesting merge. `None` skips
    /// local gating entirely (the merge queue still runs its own check).
    pub test_command: Option<String>,
    pub heartbeat_interval: Duration,
    /// Whether to open a PR after pushing (requires `gh` on PATH).
    pub open_pr: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://127.0.0.1:8080".to_string(),
            session_tag: "worker".to_string(),
            base_branch: "main".to_string(),
            test_command: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            open_pr: false,
        }
    }
}

/// Coarse phase for observability; the actual control flow lives in
/// [`WorkerRuntime::run`]'s loop rather than as data carried between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Registering,
    Idle,
    Claiming,
    Preparing,
    Implementing,
    Gating,
    RequestingMerge,
    Reacting,
    Exiting,
}

/// A single worker process: holds the coordinator client, the isolation
/// backend used to create its workspace, and the implementer it drives
/// inside that workspace.
pub struct WorkerRuntime {
    config: WorkerConfig,
    client: CoordinatorClient,
    isolation: Arc<dyn Isolation>,
    implementer: Arc<dyn Implementer>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, isolation: Arc<dyn Isolation>, implementer: Arc<dyn Implementer>) -> Self {
        let client = CoordinatorClient::new(config.coordinator_url.clone());
        Self { config, client, isolation, implementer }
    }

    /// Run until `cancel` fires. Registers, then loops `IDLE -> ... -> IDLE`
    /// until cancellation is observed, at which point it unregisters and
    /// returns (`EXITING`).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(state = ?WorkerState::Registering, "worker starting");
        let registration = self.client.register(&self.config.session_tag).await.context("failed to register")?;
        let agent_id = registration.agent_id;
        tracing::info!(agent_id = %agent_id, "registered with coordinator");

        let (event_tx, mut event_rx) = mpsc::channel::<TaskEvent>(64);
        let heartbeat_cancel = cancel.clone();
        let heartbeat_client = self.client.clone();
        let heartbeat_agent_id = agent_id.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            run_heartbeat_loop(heartbeat_client, heartbeat_agent_id, heartbeat_interval, event_tx, heartbeat_cancel).await;
        });

        let result = self.idle_loop(&agent_id, &mut event_rx, &cancel).await;

        tracing::info!(state = ?WorkerState::Exiting, agent_id = %agent_id, "worker exiting");
        if let Err(e) = self.client.unregister(&agent_id).await {
            tracing::warn!(agent_id = %agent_id, error = %e, "failed to unregister cleanly");
        }
        heartbeat_task.abort();

        result
    }

    async fn idle_loop(&self, agent_id: &str, event_rx: &mut mpsc::Receiver<TaskEvent>, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            tracing::debug!(state = ?WorkerState::Claiming, "polling for claimable task");
            let claim = self.client.claim_task(agent_id).await.context("claim_task failed")?;

            let Some((task, role)) = claimed_task(claim) else {
                tokio::select! {
                    _ = tokio::time::sleep(NO_TASK_SLEEP) => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
                continue;
            };

            tracing::info!(task_id = %task.id, role = %role, "claimed task");
            if let Err(e) = self.run_task(agent_id, task, &role, event_rx, cancel).await {
                tracing::error!(error = %e, "task run failed");
            }
        }
    }

    /// Drive one claimed task through PREPARING -> IMPLEMENTING -> GATING ->
    /// REQUESTING_MERGE -> REACTING, reporting its outcome to the
    /// coordinator along the way.
    async fn run_task(
        &self,
        agent_id: &str,
        task: Task,
        role: &str,
        event_rx: &mut mpsc::Receiver<TaskEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::debug!(state = ?WorkerState::Preparing, task_id = %task.id, role, "preparing workspace");
        let workspace = self
            .isolation
            .create_workspace(agent_id, &task.id)
            .await
            .with_context(|| format!("failed to create workspace for task {}", task.id))?;
        write_task_brief(&workspace.path, &task)?;
        let branch = workspace.branch.clone().unwrap_or_else(|| self.config.base_branch.clone());

        tracing::debug!(state = ?WorkerState::Implementing, task_id = %task.id, "implementing");
        let implemented = self.implement_and_wait(&task, &workspace.path).await;

        let implemented = match implemented {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(task_id = %task.id, "implementer gave up without a commit");
                false
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "implementation failed");
                false
            }
        };

        if !implemented {
            self.report_failure(agent_id, &task).await?;
            self.isolation.remove_workspace(&workspace).await.ok();
            return Ok(());
        }

        tracing::debug!(state = ?WorkerState::Gating, task_id = %task.id, "running local checks");
        if !self.run_local_checks(&workspace.path)? {
            tracing::warn!(task_id = %task.id, "local checks failed");
            self.report_failure(agent_id, &task).await?;
            self.isolation.remove_workspace(&workspace).await.ok();
            return Ok(());
        }

        tracing::debug!(state = ?WorkerState::RequestingMerge, task_id = %task.id, "pushing and requesting merge");
        let pr_ref = self.push_and_open_pr(&workspace.path, &branch, &task)?;
        self.client
            .complete_task(&CompleteRequest {
                agent_id: agent_id.to_string(),
                task_id: task.id.clone(),
                success: true,
                pr_ref,
                branch_name: Some(branch.clone()),
            })
            .await
            .context("complete_task failed")?;

        tracing::debug!(state = ?WorkerState::Reacting, task_id = %task.id, "awaiting merge outcome");
        self.react_to_merge_outcome(agent_id, &task, &workspace.path, &branch, event_rx, cancel).await?;

        self.isolation.remove_workspace(&workspace).await.ok();
        Ok(())
    }

    /// Invoke the implementer, then wait for a new commit on HEAD (whether
    /// the implementer produced it directly or an external tool/human did),
    /// matching `wait_for_implementation`'s poll-HEAD-every-10s behavior.
    async fn implement_and_wait(&self, task: &Task, workspace: &Path) -> Result<bool> {
        let before = rev_parse_head(workspace)?;
        if !self.implementer.implement(task, workspace).await? {
            return Ok(false);
        }
        wait_for_new_commit(workspace, &before, IMPLEMENTING_TIMEOUT).await
    }

    fn run_local_checks(&self, workspace: &Path) -> Result<bool> {
        match &self.config.test_command {
            None => Ok(true),
            Some(cmd) => run_shell(workspace, cmd),
        }
    }

    fn push_and_open_pr(&self, workspace: &Path, branch: &str, task: &Task) -> Result<Option<String>> {
        commit_if_dirty(workspace, &task.id)?;
        run_git(workspace, &["push", "--force-with-lease", "-u", "origin", branch])
            .with_context(|| format!("failed to push branch {branch}"))?;

        if !self.config.open_pr {
            return Ok(None);
        }

        let output = Command::new("gh")
            .args([
                "pr",
                "create",
                "--fill",
                "--base",
                &self.config.base_branch,
                "--head",
                branch,
            ])
            .current_dir(workspace)
            .output();

        match output {
            Ok(out) if out.status.success() => {
                let url = String::from_utf8_lossy(&out.stdout).trim().to_string();
                Ok(if url.is_empty() { None } else { Some(url) })
            }
            Ok(out) => {
                tracing::warn!(stderr = %String::from_utf8_lossy(&out.stderr), "gh pr create failed");
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "gh not available, skipping PR creation");
                Ok(None)
            }
        }
    }

    async fn report_failure(&self, agent_id: &str, task: &Task) -> Result<()> {
        self.client
            .complete_task(&CompleteRequest {
                agent_id: agent_id.to_string(),
                task_id: task.id.clone(),
                success: false,
                pr_ref: None,
                branch_name: None,
            })
            .await
            .context("complete_task (failure) failed")
    }

    /// REACTING: wait for the merge queue to tell us what happened, handling
    /// `conflict_detected` (rebase, wait for a resolving commit, force-push)
    /// and `tests_failed` (wait for a fix, re-push) inline; `merge_success`
    /// and `merge_failed` just end the reaction and return to IDLE.
    async fn react_to_merge_outcome(
        &self,
        agent_id: &str,
        task: &Task,
        workspace: &Path,
        branch: &str,
        event_rx: &mut mpsc::Receiver<TaskEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + REACTING_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(task_id = %task.id, "timed out waiting for a merge outcome");
                return Ok(());
            }

            let event = tokio::select! {
                e = event_rx.recv() => e,
                _ = tokio::time::sleep(remaining) => None,
                _ = cancel.cancelled() => return Ok(()),
            };

            let Some(event) = event else {
                continue;
            };
            if event.task_id != task.id {
                continue;
            }

            match event.event_type.as_str() {
                "merge_success" | "merge_failed" => {
                    tracing::info!(task_id = %task.id, outcome = %event.event_type, "merge reaction complete");
                    return Ok(());
                }
                "conflict_detected" => {
                    run_git(workspace, &["fetch", "origin", &self.config.base_branch]).ok();
                    if run_git(workspace, &["rebase", &format!("origin/{}", self.config.base_branch)]).is_err() {
                        run_git(workspace, &["rebase", "--abort"]).ok();
                        tracing::warn!(task_id = %task.id, "automatic rebase failed, waiting for manual fix");
                    }
                    let before = rev_parse_head(workspace)?;
                    if wait_for_new_commit(workspace, &before, REACTING_TIMEOUT).await.unwrap_or(false) {
                        run_git(workspace, &["push", "--force-with-lease", "-u", "origin", branch]).ok();
                        self.resubmit(agent_id, task, branch).await?;
                    }
                }
                "tests_failed" => {
                    let before = rev_parse_head(workspace)?;
                    if wait_for_new_commit(workspace, &before, REACTING_TIMEOUT).await.unwrap_or(false) {
                        commit_if_dirty(workspace, &task.id)?;
                        run_git(workspace, &["push", "--force-with-lease", "-u", "origin", branch]).ok();
                        self.resubmit(agent_id, task, branch).await?;
                    }
                }
                other => {
                    tracing::debug!(task_id = %task.id, event_type = other, "ignoring unrecognized event type");
                }
            }
        }
    }

    async fn resubmit(&self, agent_id: &str, task: &Task, branch: &str) -> Result<()> {
        self.client
            .complete_task(&CompleteRequest {
                agent_id: agent_id.to_string(),
                task_id: task.id.clone(),
                success: true,
                pr_ref: None,
                branch_name: Some(branch.to_string()),
            })
            .await
            .context("resubmit after fix failed")
    }
}

fn claimed_task(response: ClaimResponse) -> Option<(Task, String)> {
    match (response.task, response.role) {
        (Some(task), Some(role)) => Some((task, role)),
        (Some(task), None) => Some((task, "developer".to_string())),
        _ => None,
    }
}

async fn run_heartbeat_loop(
    client: CoordinatorClient,
    agent_id: String,
    interval: Duration,
    events: mpsc::Sender<TaskEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match client.heartbeat(&agent_id).await {
                    Ok(resp) => {
                        for event in resp.events {
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(agent_id = %agent_id, error = %e, "heartbeat failed"),
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Write a short brief describing the task into the workspace so an
/// external implementer (human or AI tool) has the acceptance criteria at
/// hand, the same role `agent_client.py::prepare_task_workspace`'s
/// `CURRENT_TASK.md` file plays.
fn write_task_brief(workspace: &Path, task: &Task) -> Result<()> {
    let mut brief = format!("# {}\n\n{}\n", task.title, task.description);
    if let Some(criteria) = &task.acceptance_criteria {
        brief.push_str(&format!("\n## Acceptance criteria\n\n{criteria}\n"));
    }
    std::fs::write(workspace.join("CURRENT_TASK.md"), brief.as_bytes())
        .with_context(|| format!("failed to write task brief into {}", workspace.display()))
}

async fn wait_for_new_commit(workspace: &Path, before: &str, timeout: Duration) -> Result<bool> {
    wait_for_new_commit_with_poll(workspace, before, timeout, HEAD_POLL_INTERVAL).await
}

async fn wait_for_new_commit_with_poll(workspace: &Path, before: &str, timeout: Duration, poll: Duration) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if rev_parse_head(workspace)? != before {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll).await;
    }
}

fn rev_parse_head(workspace: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(workspace)
        .output()
        .context("failed to run git rev-parse HEAD")?;
    if !output.status.success() {
        bail!("git rev-parse HEAD failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn commit_if_dirty(workspace: &Path, task_id: &str) -> Result<bool> {
    run_git(workspace, &["add", "-A"])?;
    let status = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(workspace)
        .output()
        .context("failed to run git status")?;
    if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
        return Ok(false);
    }
    run_git(workspace, &["commit", "-m", &format!("task {task_id}")])?;
    Ok(true)
}

fn run_git(workspace: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .with_context(|| format!("failed to run git {args:?}"))?;
    if !output.status.success() {
        bail!("git {args:?} failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

fn run_shell(workspace: &Path, command: &str) -> Result<bool> {
    let output = Command::new("sh")
        .args(["-c", command])
        .current_dir(workspace)
        .output()
        .with_context(|| format!("failed to run test command {command:?}"))?;
    Ok(output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_db::models::{TaskStatus, TaskType};

    fn sample_task() -> Task {
        Task {
            id: "t1".to_string(),
            title: "Sample".to_string(),
            description: "A sample task.".to_string(),
            acceptance_criteria: Some("It works.".to_string()),
            task_type: TaskType::Development,
            priority: 0,
            status: TaskStatus::InProgress,
            assigned_to: Some("worker-1".to_string()),
            branch_name: None,
            pr_ref: None,
            blocked_reason: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            merged_at: None,
        }
    }

    #[test]
    fn claimed_task_requires_both_task_and_falls_back_role() {
        let resp = ClaimResponse { task: Some(sample_task()), role: None, reason: None };
        let (task, role) = claimed_task(resp).expect("should claim");
        assert_eq!(task.id, "t1");
        assert_eq!(role, "developer");
    }

    #[test]
    fn claimed_task_none_when_no_task() {
        let resp = ClaimResponse { task: None, role: None, reason: Some("no_tasks_available".to_string()) };
        assert!(claimed_task(resp).is_none());
    }

    #[test]
    fn write_task_brief_includes_acceptance_criteria() {
        let dir = tempfile::TempDir::new().unwrap();
        write_task_brief(dir.path(), &sample_task()).unwrap();
        let content = std::fs::read_to_string(dir.path().join("CURRENT_TASK.md")).unwrap();
        assert!(content.contains("Sample"));
        assert!(content.contains("It works."));
    }

    #[tokio::test]
    async fn wait_for_new_commit_times_out_without_a_commit() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = dir.path();
        run_git(repo, &["init"]).unwrap();
        run_git(repo, &["config", "user.email", "test@coordinator.dev"]).unwrap();
        run_git(repo, &["config", "user.name", "Coordinator Test"]).unwrap();
        std::fs::write(repo.join("f"), "x").unwrap();
        run_git(repo, &["add", "-A"]).unwrap();
        run_git(repo, &["commit", "-m", "initial"]).unwrap();

        let head = rev_parse_head(repo).unwrap();
        let found = wait_for_new_commit_with_poll(repo, &head, Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap();
        assert!(!found);
    }
}
