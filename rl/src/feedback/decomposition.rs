//! Task decomposition requested by the agent
//!
//! The agent asks to split its current task by printing a JSON payload
//! between [`DECOMPOSE_OPEN`] and [`DECOMPOSE_CLOSE`]. A valid request
//! replaces the task in place and the iteration restarts.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{DecompositionSummary, Task, TaskList};

pub const DECOMPOSE_OPEN: &str = "<decompose-task>";
pub const DECOMPOSE_CLOSE: &str = "</decompose-task>";

/// Upper bound on subtasks per request
pub const MAX_SUBTASKS: usize = 10;

/// Times a single iteration may restart because of decomposition
pub const MAX_DECOMPOSITIONS_PER_ITERATION: u32 = 3;

static PAYLOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<decompose-task>\s*(.*?)\s*</decompose-task>").expect("decompose pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedSubtask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompositionRequest {
    pub original_task_title: String,
    #[serde(default)]
    pub reason: String,
    pub suggested_subtasks: Vec<SuggestedSubtask>,
}

impl DecompositionRequest {
    pub fn summary(&self) -> DecompositionSummary {
        DecompositionSummary {
            original_task_title: self.original_task_title.clone(),
            reason: self.reason.clone(),
            subtask_count: self.suggested_subtasks.len(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("malformed decomposition payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("decomposition must propose 1 to 10 subtasks, got {0}")]
    SubtaskCount(usize),

    #[error("subtask {0} has an empty title")]
    EmptyTitle(usize),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("task '{0}' is already done")]
    AlreadyDone(String),
}

/// Find a decomposition request in agent text
///
/// `None` when the text carries no request; the last request wins when the
/// agent printed several.
pub fn parse_decomposition(text: &str) -> Option<Result<DecompositionRequest, DecompositionError>> {
    let payload = PAYLOAD.captures_iter(text).last()?.get(1)?.as_str();
    debug!(len = payload.len(), "parse_decomposition: found payload");
    Some(decode(payload))
}

fn decode(payload: &str) -> Result<DecompositionRequest, DecompositionError> {
    let request: DecompositionRequest = serde_json::from_str(strip_fence(payload))?;
    let count = request.suggested_subtasks.len();
    if count == 0 || count > MAX_SUBTASKS {
        return Err(DecompositionError::SubtaskCount(count));
    }
    if let Some(i) = request.suggested_subtasks.iter().position(|s| s.title.trim().is_empty()) {
        return Err(DecompositionError::EmptyTitle(i + 1));
    }
    Ok(request)
}

/// Agents like to wrap JSON in a markdown fence
fn strip_fence(payload: &str) -> &str {
    let trimmed = payload.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.strip_suffix("```").unwrap_or(rest).trim()
        }
        None => trimmed,
    }
}

/// Keys of the tasks that replaced the original
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompositionOutcome {
    pub index: usize,
    pub subtask_keys: Vec<String>,
}

/// Replace the requested task with its subtasks, in place
///
/// Subtasks get ids `<id>.1`, `<id>.2`, ... when the original had an id, and
/// inherit its dependencies. Every task that depended on the original now
/// depends on all of the subtasks.
pub fn apply_decomposition(
    list: &mut TaskList,
    request: &DecompositionRequest,
) -> Result<DecompositionOutcome, DecompositionError> {
    debug!(original = %request.original_task_title, "apply_decomposition: called");
    let index = list
        .tasks
        .iter()
        .position(|t| t.title == request.original_task_title || t.id.as_deref() == Some(request.original_task_title.as_str()))
        .ok_or_else(|| DecompositionError::TaskNotFound(request.original_task_title.clone()))?;

    let original = list.tasks[index].clone();
    if original.done {
        warn!(task = %original.title, "apply_decomposition: task already done");
        return Err(DecompositionError::AlreadyDone(original.title));
    }

    let subtasks: Vec<Task> = request
        .suggested_subtasks
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let mut task = Task::new(s.title.trim())
                .with_description(s.description.clone())
                .with_steps(s.steps.clone());
            if let Some(id) = &original.id {
                task = task.with_id(format!("{}.{}", id, i + 1));
            }
            task.depends_on = original.depends_on.clone();
            task
        })
        .collect();
    let subtask_keys: Vec<String> = subtasks.iter().map(|t| t.key().to_string()).collect();

    list.tasks.splice(index..=index, subtasks);

    let original_key = original.key();
    for task in list.tasks.iter_mut() {
        let Some(deps) = task.depends_on.as_mut() else {
            continue;
        };
        if deps.iter().any(|d| d == original_key) {
            deps.retain(|d| d != original_key);
            for key in &subtask_keys {
                if !deps.contains(key) {
                    deps.push(key.clone());
                }
            }
        }
    }

    info!(
        original = %original.title,
        subtasks = subtask_keys.len(),
        reason = %request.reason,
        "apply_decomposition: task decomposed"
    );
    Ok(DecompositionOutcome { index, subtask_keys })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(title: &str, subtasks: &[&str]) -> DecompositionRequest {
        DecompositionRequest {
            original_task_title: title.to_string(),
            reason: "too big".to_string(),
            suggested_subtasks: subtasks
                .iter()
                .map(|t| SuggestedSubtask {
                    title: t.to_string(),
                    description: String::new(),
                    steps: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn test_parse_absent() {
        assert!(parse_decomposition("just some output").is_none());
    }

    #[test]
    fn test_parse_valid_payload() {
        let text = r#"thinking...
<decompose-task>
{"originalTaskTitle": "Build API", "reason": "too large",
 "suggestedSubtasks": [{"title": "Routes"}, {"title": "Handlers", "steps": ["write"]}]}
</decompose-task>
done"#;
        let req = parse_decomposition(text).unwrap().unwrap();
        assert_eq!(req.original_task_title, "Build API");
        assert_eq!(req.suggested_subtasks.len(), 2);
        assert_eq!(req.suggested_subtasks[1].steps, vec!["write"]);
        assert_eq!(req.summary().subtask_count, 2);
    }

    #[test]
    fn test_parse_fenced_payload() {
        let text = "<decompose-task>```json\n{\"originalTaskTitle\":\"X\",\"suggestedSubtasks\":[{\"title\":\"a\"}]}\n```</decompose-task>";
        let req = parse_decomposition(text).unwrap().unwrap();
        assert_eq!(req.original_task_title, "X");
    }

    #[test]
    fn test_parse_rejects_bad_counts_and_titles() {
        let empty = "<decompose-task>{\"originalTaskTitle\":\"X\",\"suggestedSubtasks\":[]}</decompose-task>";
        assert!(matches!(
            parse_decomposition(empty),
            Some(Err(DecompositionError::SubtaskCount(0)))
        ));

        let blank = "<decompose-task>{\"originalTaskTitle\":\"X\",\"suggestedSubtasks\":[{\"title\":\"a\"},{\"title\":\" \"}]}</decompose-task>";
        assert!(matches!(
            parse_decomposition(blank),
            Some(Err(DecompositionError::EmptyTitle(2)))
        ));

        let junk = "<decompose-task>not json</decompose-task>";
        assert!(matches!(parse_decomposition(junk), Some(Err(DecompositionError::Malformed(_)))));
    }

    #[test]
    fn test_parse_rejects_too_many() {
        let subtasks: Vec<String> = (0..11).map(|i| format!("{{\"title\":\"s{}\"}}", i)).collect();
        let text = format!(
            "<decompose-task>{{\"originalTaskTitle\":\"X\",\"suggestedSubtasks\":[{}]}}</decompose-task>",
            subtasks.join(",")
        );
        assert!(matches!(
            parse_decomposition(&text),
            Some(Err(DecompositionError::SubtaskCount(11)))
        ));
    }

    #[test]
    fn test_apply_in_place_with_ids_and_rewiring() {
        let mut list = TaskList::new(
            "demo",
            vec![
                Task::new("Setup").with_id("setup"),
                Task::new("Build API").with_id("api").with_deps(&["setup"]),
                Task::new("Docs").with_id("docs").with_deps(&["api"]),
            ],
        );
        let outcome = apply_decomposition(&mut list, &request("Build API", &["Routes", "Handlers"])).unwrap();

        assert_eq!(outcome.index, 1);
        assert_eq!(outcome.subtask_keys, vec!["api.1", "api.2"]);
        let titles: Vec<&str> = list.tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Setup", "Routes", "Handlers", "Docs"]);
        assert_eq!(list.tasks[1].deps(), ["setup".to_string()]);
        assert_eq!(list.tasks[3].deps(), ["api.1".to_string(), "api.2".to_string()]);
    }

    #[test]
    fn test_apply_legacy_list_without_ids() {
        let mut list = TaskList::new("demo", vec![Task::new("Big"), Task::new("After")]);
        let outcome = apply_decomposition(&mut list, &request("Big", &["One", "Two", "Three"])).unwrap();
        assert_eq!(outcome.subtask_keys, vec!["One", "Two", "Three"]);
        assert_eq!(list.tasks.len(), 4);
        assert!(list.tasks.iter().all(|t| t.id.is_none()));
    }

    #[test]
    fn test_apply_unknown_or_done() {
        let mut list = TaskList::new("demo", vec![Task::new("Done").completed()]);
        assert!(matches!(
            apply_decomposition(&mut list, &request("Missing", &["a"])),
            Err(DecompositionError::TaskNotFound(_))
        ));
        assert!(matches!(
            apply_decomposition(&mut list, &request("Done", &["a"])),
            Err(DecompositionError::AlreadyDone(_))
        ));
        assert_eq!(list.tasks.len(), 1);
    }
}
