//! Dependency graph validation and execution-group peeling

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::TaskList;

/// A problem with the task dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("task '{task}' depends on unknown task '{missing}'")]
    MissingReference { task: String, missing: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("duplicate task id '{0}'")]
    DuplicateId(String),
}

/// Tasks that may run concurrently once every earlier group is resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionGroup {
    pub index: usize,
    /// Positions in the task list
    pub task_indices: Vec<usize>,
    /// Task keys, in the same order as `task_indices`
    pub task_ids: Vec<String>,
}

/// Validate every dependency edge in `list`
///
/// Collects every missing reference and duplicate id, plus the first cycle
/// found, instead of stopping at the first problem.
pub fn validate_dependencies(list: &TaskList) -> Result<(), Vec<DependencyError>> {
    debug!(project = %list.project, tasks = list.tasks.len(), "validate_dependencies: called");
    let mut errors = Vec::new();

    let mut graph: HashMap<&str, &[String]> = HashMap::new();
    for task in &list.tasks {
        if graph.insert(task.key(), task.deps()).is_some() {
            errors.push(DependencyError::DuplicateId(task.key().to_string()));
        }
    }

    for task in &list.tasks {
        for dep in task.deps() {
            if !graph.contains_key(dep.as_str()) {
                errors.push(DependencyError::MissingReference {
                    task: task.key().to_string(),
                    missing: dep.clone(),
                });
            }
        }
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut cycle_path = Vec::new();
    for task in &list.tasks {
        let key = task.key();
        if !visited.contains(key) && has_cycle_dfs(key, &graph, &mut visited, &mut rec_stack, &mut cycle_path) {
            errors.push(DependencyError::Cycle { path: trim_to_cycle(cycle_path) });
            break;
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        warn!(count = errors.len(), "validate_dependencies: invalid dependency graph");
        Err(errors)
    }
}

fn has_cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    cycle_path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    cycle_path.push(node.to_string());

    if let Some(deps) = graph.get(node) {
        for dep in deps.iter() {
            let dep = dep.as_str();
            if !visited.contains(dep) {
                if let Some((key, _)) = graph.get_key_value(dep) {
                    if has_cycle_dfs(*key, graph, visited, rec_stack, cycle_path) {
                        return true;
                    }
                }
            } else if rec_stack.contains(dep) {
                cycle_path.push(dep.to_string());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    cycle_path.pop();
    false
}

/// Drop the lead-in before the node that closes the cycle
fn trim_to_cycle(path: Vec<String>) -> Vec<String> {
    let start = match path.last() {
        Some(last) => path.iter().position(|n| n == last).unwrap_or(0),
        None => 0,
    };
    path[start..].to_vec()
}

/// Partition the list into execution groups by repeated topological peeling
///
/// Group 0 holds every task without dependencies; group k+1 holds every
/// remaining task whose dependencies all sit in groups 0..=k. Done tasks are
/// placed like any other so group indices stay stable across a resume.
pub fn compute_execution_groups(list: &TaskList) -> Result<Vec<ExecutionGroup>, Vec<DependencyError>> {
    debug!(project = %list.project, "compute_execution_groups: called");
    validate_dependencies(list)?;

    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<usize> = (0..list.tasks.len()).collect();
    let mut groups = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<usize>, Vec<usize>) = remaining
            .iter()
            .partition(|&&i| list.tasks[i].deps().iter().all(|d| placed.contains(d.as_str())));

        if ready.is_empty() {
            // validation guarantees progress; this only triggers on a graph it missed
            let path = blocked.iter().map(|&i| list.tasks[i].key().to_string()).collect();
            return Err(vec![DependencyError::Cycle { path }]);
        }

        for &i in &ready {
            placed.insert(list.tasks[i].key());
        }
        let group = ExecutionGroup {
            index: groups.len(),
            task_ids: ready.iter().map(|&i| list.tasks[i].key().to_string()).collect(),
            task_indices: ready,
        };
        debug!(index = group.index, tasks = ?group.task_ids, "compute_execution_groups: group");
        groups.push(group);
        remaining = blocked;
    }

    Ok(groups)
}
