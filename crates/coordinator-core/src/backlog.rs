//! Backlog ingestion: parses and validates a YAML backlog file, then
//! persists its tasks and dependency edges, and (re)computes phase
//! layering (C1's entry point).
//!
//! Replaces this codebase's TOML plan format (`plan/parser.rs`,
//! `plan/toml_format.rs`) with the YAML shape SPEC_FULL §6 defines; the
//! validation rules -- required fields, duplicate ids, dangling
//! dependencies -- are ported from the original source's
//! `validate_backlog_tasks`, just against YAML instead of a Python dict and
//! with unknown-dependency treated as a hard error rather than a warning,
//! since this implementation only accepts a backlog it can schedule.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgPool;
use thiserror::Error;

use coordinator_db::models::TaskType;
use coordinator_db::queries::{phases as phase_db, tasks as task_db};

use crate::dependency::{self, TaskNode};

#[derive(Debug, Deserialize)]
pub struct BacklogFile {
    pub backlog: Vec<BacklogTask>,
}

#[derive(Debug, Deserialize)]
pub struct BacklogTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "acceptanceCriteria")]
    pub acceptance_criteria: Option<String>,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("backlog must contain at least one task")]
    Empty,

    #[error("duplicate task id: {0:?}")]
    DuplicateId(String),

    #[error("task {task:?} has invalid type {value:?} (expected setup, development, testing, security, documentation, or review)")]
    InvalidType { task: String, value: String },

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error(transparent)]
    Dependency(#[from] dependency::DependencyError),
}

/// Parse and validate a backlog YAML document. Does not touch the database.
pub fn parse_backlog(content: &str) -> Result<BacklogFile, BacklogError> {
    let backlog: BacklogFile = serde_yaml::from_str(content)?;
    validate(&backlog)?;
    Ok(backlog)
}

fn validate(backlog: &BacklogFile) -> Result<(), BacklogError> {
    if backlog.backlog.is_empty() {
        return Err(BacklogError::Empty);
    }

    let mut seen = HashSet::new();
    for task in &backlog.backlog {
        if !seen.insert(task.id.as_str()) {
            return Err(BacklogError::DuplicateId(task.id.clone()));
        }
    }

    for task in &backlog.backlog {
        if task.task_type.parse::<TaskType>().is_err() {
            return Err(BacklogError::InvalidType { task: task.id.clone(), value: task.task_type.clone() });
        }
        for dep in &task.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(BacklogError::UnknownDependency { task: task.id.clone(), dependency: dep.clone() });
            }
        }
    }

    let nodes: Vec<TaskNode> = backlog
        .backlog
        .iter()
        .map(|t| TaskNode { id: t.id.clone(), depends_on: t.dependencies.clone() })
        .collect();
    dependency::compute_phases(&nodes)?;

    Ok(())
}

/// Ingest a validated backlog: insert every task and dependency edge
/// (idempotently, so re-ingesting an unchanged backlog on restart is a
/// no-op) and recompute phase layering.
pub async fn ingest(pool: &PgPool, backlog: &BacklogFile) -> Result<()> {
    for task in &backlog.backlog {
        let task_type: TaskType =
            task.task_type.parse().context("backlog task type should have been validated")?;
        task_db::insert_task_if_absent(
            pool,
            &task_db::NewTask {
                id: task.id.clone(),
                title: task.title.clone(),
                description: task.description.clone(),
                acceptance_criteria: task.acceptance_criteria.clone(),
                task_type,
                priority: task.priority,
            },
        )
        .await?;
    }

    for task in &backlog.backlog {
        for dep in &task.dependencies {
            task_db::insert_dependency(pool, &task.id, dep).await?;
        }
    }

    let nodes: Vec<TaskNode> = backlog
        .backlog
        .iter()
        .map(|t| TaskNode { id: t.id.clone(), depends_on: t.dependencies.clone() })
        .collect();
    let phases = dependency::compute_phases(&nodes).context("backlog should already be validated")?;
    let phase_rows: Vec<(String, Vec<String>)> = phases.into_iter().map(|p| (p.name, p.task_ids)).collect();
    phase_db::replace_phases(pool, &phase_rows).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
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
"#;

    #[test]
    fn parses_valid_backlog() {
        let backlog = parse_backlog(VALID).expect("should parse");
        assert_eq!(backlog.backlog.len(), 2);
    }

    #[test]
    fn rejects_empty_backlog() {
        let err = parse_backlog("backlog: []").unwrap_err();
        assert!(matches!(err, BacklogError::Empty));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let yaml = r#"
backlog:
  - id: a
    title: One
    description: First.
    type: setup
  - id: a
    title: Two
    description: Second.
    type: setup
"#;
        let err = parse_backlog(yaml).unwrap_err();
        assert!(matches!(err, BacklogError::DuplicateId(ref id) if id == "a"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let yaml = r#"
backlog:
  - id: a
    title: One
    description: First.
    type: setup
    dependencies: [missing]
"#;
        let err = parse_backlog(yaml).unwrap_err();
        assert!(matches!(err, BacklogError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_invalid_type() {
        let yaml = r#"
backlog:
  - id: a
    title: One
    description: First.
    type: nonsense
"#;
        let err = parse_backlog(yaml).unwrap_err();
        assert!(matches!(err, BacklogError::InvalidType { .. }));
    }

    #[test]
    fn rejects_cyclic_backlog() {
        let yaml = r#"
backlog:
  - id: a
    title: One
    description: First.
    type: setup
    dependencies: [b]
  - id: b
    title: Two
    description: Second.
    type: setup
    dependencies: [a]
"#;
        let err = parse_backlog(yaml).unwrap_err();
        assert!(matches!(err, BacklogError::Dependency(dependency::DependencyError::CycleDetected(_))));
    }
}
