//! Dependency analysis: validates the backlog's dependency graph is acyclic
//! and layers it into phases -- groups of tasks with no dependency on each
//! other, ordered so that every task's dependencies finish in an earlier
//! phase.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

/// A task id plus the ids of the tasks it depends on, as read from the
/// backlog before any database row exists.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: String,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),

    #[error("backlog must contain at least one task")]
    Empty,
}

/// A layer of the dependency DAG: tasks that may execute in parallel once
/// every task in an earlier layer has reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    pub task_ids: Vec<String>,
}

/// Validate the graph is acyclic and group it into phases.
///
/// Phase `N` contains every task whose dependencies are fully satisfied by
/// phases `0..N` (Kahn's algorithm, peeling one in-degree-zero layer at a
/// time rather than a single flat topological order). Within a phase, task
/// ids are sorted for deterministic output.
pub fn compute_phases(tasks: &[TaskNode]) -> Result<Vec<Phase>, DependencyError> {
    if tasks.is_empty() {
        return Err(DependencyError::Empty);
    }

    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(DependencyError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> =
        tasks.iter().map(|t| (t.id.as_str(), t.depends_on.len())).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.depends_on {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    let mut phases = Vec::new();
    let mut remaining = tasks.len();
    let mut frontier: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut phase_idx = 0;
    while !frontier.is_empty() {
        let mut layer: Vec<&str> = frontier.drain(..).collect();
        layer.sort_unstable();
        remaining -= layer.len();

        let mut next_frontier = Vec::new();
        for &id in &layer {
            if let Some(next_ids) = dependents.get(id) {
                for &next_id in next_ids {
                    let deg = in_degree.get_mut(next_id).expect("node must be tracked");
                    *deg -= 1;
                    if *deg == 0 {
                        next_frontier.push(next_id);
                    }
                }
            }
        }

        phases.push(Phase {
            name: format!("phase-{phase_idx}"),
            task_ids: layer.into_iter().map(String::from).collect(),
        });
        frontier.extend(next_frontier);
        phase_idx += 1;
    }

    if remaining != 0 {
        let mut cyclic: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(id, _)| *id)
            .collect();
        cyclic.sort_unstable();
        return Err(DependencyError::CycleDetected(cyclic.join(", ")));
    }

    Ok(phases)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, deps: &[&str]) -> TaskNode {
        TaskNode {
            id: id.to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn rejects_empty_backlog() {
        assert!(matches!(compute_phases(&[]), Err(DependencyError::Empty)));
    }

    #[test]
    fn single_task_is_one_phase() {
        let phases = compute_phases(&[node("a", &[])]).unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].task_ids, vec!["a".to_string()]);
    }

    #[test]
    fn chain_produces_one_phase_per_task() {
        let tasks = vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])];
        let phases = compute_phases(&tasks).unwrap();
        assert_eq!(phases.len(), 3);
        assert_eq!(phases[0].task_ids, vec!["a"]);
        assert_eq!(phases[1].task_ids, vec!["b"]);
        assert_eq!(phases[2].task_ids, vec!["c"]);
    }

    #[test]
    fn diamond_groups_parallel_tasks_into_one_phase() {
        let tasks =
            vec![node("a", &[]), node("b", &["a"]), node("c", &["a"]), node("d", &["b", "c"])];
        let phases = compute_phases(&tasks).unwrap();
        assert_eq!(phases.len(), 3);
        assert_eq!(phases[0].task_ids, vec!["a"]);
        assert_eq!(phases[1].task_ids, vec!["b", "c"]);
        assert_eq!(phases[2].task_ids, vec!["d"]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let tasks = vec![node("a", &["missing"])];
        assert!(matches!(
            compute_phases(&tasks),
            Err(DependencyError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn rejects_direct_cycle() {
        let tasks = vec![node("a", &["b"]), node("b", &["a"])];
        assert!(matches!(compute_phases(&tasks), Err(DependencyError::CycleDetected(_))));
    }

    #[test]
    fn rejects_transitive_cycle() {
        let tasks = vec![node("a", &["c"]), node("b", &["a"]), node("c", &["b"])];
        assert!(matches!(compute_phases(&tasks), Err(DependencyError::CycleDetected(_))));
    }
}
