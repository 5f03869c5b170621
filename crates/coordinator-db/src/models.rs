use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of work a task represents. Drives the role mapping in the claim
/// service (`coordinator_core::claim::role_for_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Setup,
    Development,
    Testing,
    Security,
    Documentation,
    Review,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Setup => "setup",
            Self::Development => "development",
            Self::Testing => "testing",
            Self::Security => "security",
            Self::Documentation => "documentation",
            Self::Review => "review",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(Self::Setup),
            "development" => Ok(Self::Development),
            "testing" => Ok(Self::Testing),
            "security" => Ok(Self::Security),
            "documentation" => Ok(Self::Documentation),
            "review" => Ok(Self::Review),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a task. See SPEC_FULL.md §3 for the full lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Conflict,
    TestFailed,
    Merged,
    MergeFailed,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Terminal statuses are never re-entered except by explicit
    /// administrator reset (P2).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Blocked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Conflict => "conflict",
            Self::TestFailed => "test_failed",
            Self::Merged => "merged",
            Self::MergeFailed => "merge_failed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "conflict" => Ok(Self::Conflict),
            "test_failed" => Ok(Self::TestFailed),
            "merged" => Ok(Self::Merged),
            "merge_failed" => Ok(Self::MergeFailed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Working => "working",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a phase (a layer of the dependency DAG).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    Completed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for PhaseStatus {
    type Err = PhaseStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(PhaseStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseStatusParseError(pub String);

impl fmt::Display for PhaseStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase status: {:?}", self.0)
    }
}

impl std::error::Error for PhaseStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- a unit of work in the backlog.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Option<String>,
    pub task_type: TaskType,
    pub priority: i32,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub branch_name: Option<String>,
    pub pr_ref: Option<String>,
    pub blocked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
}

/// An edge in the task dependency DAG: `task_id` depends on `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: String,
    pub depends_on: String,
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub id: String,
    pub session_tag: String,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub current_role: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_completed: i32,
    pub tasks_failed: i32,
}

/// A phase -- a layer of the dependency DAG whose members may run in parallel.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Phase {
    pub id: i32,
    pub name: String,
    pub task_ids: Vec<String>,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An element of the merge queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MergeQueueEntry {
    pub id: i64,
    pub task_id: String,
    pub branch_name: String,
    pub pr_ref: Option<String>,
    pub agent_id: String,
    pub queued_at: DateTime<Utc>,
    pub retry_count: i32,
    /// Set while a merge worker has popped this entry and is processing it.
    /// Mirrors the `activeMerges` map from SPEC_FULL §6.
    pub claimed_at: Option<DateTime<Utc>>,
}

/// A pending notification for a worker that may not currently be connected.
/// Durable fallback for the in-process pub/sub channel (SPEC_FULL §4.2/§6).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingNotification {
    pub id: i64,
    pub agent_id: String,
    pub task_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_display_roundtrip() {
        let variants = [
            TaskType::Setup,
            TaskType::Development,
            TaskType::Testing,
            TaskType::Security,
            TaskType::Documentation,
            TaskType::Review,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_type_invalid() {
        assert!("nope".parse::<TaskType>().is_err());
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Conflict,
            TaskStatus::TestFailed,
            TaskStatus::Merged,
            TaskStatus::MergeFailed,
            TaskStatus::Failed,
            TaskStatus::Blocked,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("nope".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Merged.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Conflict.is_terminal());
        assert!(!TaskStatus::TestFailed.is_terminal());
        assert!(!TaskStatus::MergeFailed.is_terminal());
        assert!(!TaskStatus::Done.is_terminal());
    }

    #[test]
    fn worker_status_display_roundtrip() {
        for v in [WorkerStatus::Idle, WorkerStatus::Working] {
            let s = v.to_string();
            let parsed: WorkerStatus = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn worker_status_invalid() {
        assert!("nope".parse::<WorkerStatus>().is_err());
    }

    #[test]
    fn phase_status_display_roundtrip() {
        for v in [PhaseStatus::Pending, PhaseStatus::Active, PhaseStatus::Completed] {
            let s = v.to_string();
            let parsed: PhaseStatus = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn phase_status_invalid() {
        assert!("nope".parse::<PhaseStatus>().is_err());
    }
}
