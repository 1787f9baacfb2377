//! Task and TaskList domain types
//!
//! The task list (PRD) is the unit of work the agent executes against. It is
//! owned by the file on disk: the agent may rewrite it between iterations, so
//! callers re-load it at every iteration boundary instead of caching it.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single work item in the task list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable identifier; legacy lists omit it and are keyed by title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Short title shown to the agent and used for branch names
    pub title: String,

    /// Longer description of the work
    #[serde(default)]
    pub description: String,

    /// Ordered implementation steps
    #[serde(default)]
    pub steps: Vec<String>,

    /// Whether the task has been completed
    #[serde(default)]
    pub done: bool,

    /// Ids of tasks that must complete before this one (parallel mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
}

impl Task {
    /// Create a new pending task with only a title
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: String::new(),
            steps: Vec::new(),
            done: false,
            depends_on: None,
        }
    }

    /// Builder: set id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Builder: set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: set steps
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    /// Builder: set dependencies
    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.depends_on = Some(deps.iter().map(|d| d.to_string()).collect());
        self
    }

    /// Builder: mark done
    pub fn completed(mut self) -> Self {
        self.done = true;
        self
    }

    /// Identity of the task: the id when present, otherwise the title
    pub fn key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.title)
    }

    /// Dependencies as a slice (empty when none declared)
    pub fn deps(&self) -> &[String] {
        self.depends_on.as_deref().unwrap_or(&[])
    }
}

/// The next pending task in list order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextTask {
    pub title: String,
    pub index: usize,
}

/// Ordered task list for a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    /// Project name, used in notifications and prompts
    pub project: String,

    /// Tasks in priority order
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TaskList {
    /// Create a task list
    pub fn new(project: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            project: project.into(),
            tasks,
        }
    }

    /// First task that is not done, with its position
    pub fn next_task_with_index(&self) -> Option<NextTask> {
        let next = self
            .tasks
            .iter()
            .enumerate()
            .find(|(_, t)| !t.done)
            .map(|(index, t)| NextTask {
                title: t.title.clone(),
                index,
            });
        debug!(project = %self.project, ?next, "TaskList::next_task_with_index: called");
        next
    }

    /// True when every task is done (an empty list is complete)
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.done)
    }

    /// Number of tasks marked done
    pub fn done_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.done).count()
    }

    /// Number of tasks still pending
    pub fn pending_count(&self) -> usize {
        self.tasks.len() - self.done_count()
    }

    /// Position of the task with the given key
    pub fn position_of(&self, key: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.key() == key)
    }

    /// Look up a task by key
    pub fn get(&self, key: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.key() == key)
    }

    /// Mark the task with the given key done; returns false if it was not found
    pub fn mark_done(&mut self, key: &str) -> bool {
        debug!(%key, "TaskList::mark_done: called");
        match self.tasks.iter_mut().find(|t| t.key() == key) {
            Some(task) => {
                task.done = true;
                true
            }
            None => {
                debug!(%key, "TaskList::mark_done: task not found");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskList {
        TaskList::new(
            "demo",
            vec![
                Task::new("Set up project").completed(),
                Task::new("Add login").with_id("login"),
                Task::new("Add logout"),
            ],
        )
    }

    #[test]
    fn test_key_prefers_id() {
        let list = sample();
        assert_eq!(list.tasks[0].key(), "Set up project");
        assert_eq!(list.tasks[1].key(), "login");
    }

    #[test]
    fn test_next_task_with_index_skips_done() {
        let next = sample().next_task_with_index().unwrap();
        assert_eq!(next.title, "Add login");
        assert_eq!(next.index, 1);
    }

    #[test]
    fn test_is_complete() {
        let mut list = sample();
        assert!(!list.is_complete());
        assert!(list.mark_done("login"));
        assert!(list.mark_done("Add logout"));
        assert!(list.is_complete());
        assert!(list.next_task_with_index().is_none());
        assert!(TaskList::new("empty", vec![]).is_complete());
    }

    #[test]
    fn test_mark_done_unknown_key() {
        let mut list = sample();
        assert!(!list.mark_done("nope"));
        assert_eq!(list.pending_count(), 2);
    }

    #[test]
    fn test_deserialize_legacy_and_camel_case() {
        let json = r#"{
            "project": "demo",
            "tasks": [
                {"title": "A"},
                {"id": "b", "title": "B", "done": true, "dependsOn": ["A"], "steps": ["one"]}
            ]
        }"#;
        let list: TaskList = serde_json::from_str(json).unwrap();
        assert_eq!(list.tasks[0].id, None);
        assert!(!list.tasks[0].done);
        assert_eq!(list.tasks[1].deps(), ["A".to_string()]);
        assert_eq!(list.done_count(), 1);

        let out = serde_json::to_string(&list).unwrap();
        assert!(out.contains("dependsOn"));
        assert!(!out.contains("\"id\":null"));
    }
}
