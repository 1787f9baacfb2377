//! Prompt rendering for agent invocations
//!
//! Templates are looked up as `<state-dir>/prompts/{name}.pmt` first and fall
//! back to the copies embedded in the binary.

use std::path::{Path, PathBuf};

use eyre::{Result, eyre};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use crate::agent::COMPLETION_SENTINEL;
use crate::domain::{Task, TaskList};
use crate::feedback::decomposition::{DECOMPOSE_CLOSE, DECOMPOSE_OPEN};

/// Template used for every iteration
pub const ITERATION_TEMPLATE: &str = "iteration";

const EMBEDDED_ITERATION: &str = include_str!("../../prompts/iteration.pmt");

fn get_embedded(name: &str) -> Option<&'static str> {
    match name {
        ITERATION_TEMPLATE => Some(EMBEDDED_ITERATION),
        _ => None,
    }
}

/// Task as shown to the agent
#[derive(Debug, Clone, Serialize)]
pub struct PromptTask {
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub steps: Vec<String>,
    /// 1-based position in the task list
    pub position: usize,
}

impl PromptTask {
    pub fn new(task: &Task, index: usize) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            steps: task.steps.clone(),
            position: index + 1,
        }
    }
}

/// Values available to templates
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub project: String,
    pub prd_file: String,
    pub task: Option<PromptTask>,
    pub done_count: usize,
    pub total_count: usize,
    pub parallel: bool,
    pub learnings: Option<String>,
    pub verification_failure: Option<String>,
    pub retry_context: Option<String>,
    pub completion_sentinel: &'static str,
    pub decompose_open: &'static str,
    pub decompose_close: &'static str,
}

impl PromptContext {
    pub fn new(list: &TaskList, prd_file: impl Into<String>) -> Self {
        debug!(project = %list.project, tasks = list.tasks.len(), "PromptContext::new: called");
        Self {
            project: list.project.clone(),
            prd_file: prd_file.into(),
            task: None,
            done_count: list.done_count(),
            total_count: list.tasks.len(),
            parallel: false,
            learnings: None,
            verification_failure: None,
            retry_context: None,
            completion_sentinel: COMPLETION_SENTINEL,
            decompose_open: DECOMPOSE_OPEN,
            decompose_close: DECOMPOSE_CLOSE,
        }
    }

    pub fn with_task(mut self, task: &Task, index: usize) -> Self {
        self.task = Some(PromptTask::new(task, index));
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_learnings(mut self, learnings: Option<String>) -> Self {
        self.learnings = learnings.filter(|l| !l.trim().is_empty());
        self
    }

    pub fn with_verification_failure(mut self, report: Option<String>) -> Self {
        self.verification_failure = report;
        self
    }
}

/// Loads and renders prompt templates
pub struct PromptLoader {
    hbs: Handlebars<'static>,
    user_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Loader honouring overrides in `<state_dir>/prompts`
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let user_dir = state_dir.as_ref().join("prompts");
        let exists = user_dir.is_dir();
        debug!(?user_dir, exists, "PromptLoader::new: called");
        Self {
            hbs: Self::engine(),
            user_dir: exists.then_some(user_dir),
        }
    }

    /// Loader that only uses embedded prompts
    pub fn embedded_only() -> Self {
        Self {
            hbs: Self::engine(),
            user_dir: None,
        }
    }

    fn engine() -> Handlebars<'static> {
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);
        hbs
    }

    fn load_template(&self, name: &str) -> Result<String> {
        debug!(%name, "PromptLoader::load_template: called");
        if let Some(user_dir) = &self.user_dir {
            let path = user_dir.join(format!("{}.pmt", name));
            if path.exists() {
                debug!(?path, "PromptLoader::load_template: found user override");
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read prompt {}: {}", path.display(), e));
            }
        }
        get_embedded(name)
            .map(str::to_string)
            .ok_or_else(|| eyre!("Prompt template not found: {}", name))
    }

    /// Render a template with the given context
    pub fn render(&self, template_name: &str, context: &PromptContext) -> Result<String> {
        debug!(%template_name, "PromptLoader::render: called");
        let template = self.load_template(template_name)?;
        self.hbs
            .render_template(&template, context)
            .map_err(|e| eyre!("Failed to render template {}: {}", template_name, e))
    }

    /// Render the iteration prompt
    pub fn iteration_prompt(&self, context: &PromptContext) -> Result<String> {
        self.render(ITERATION_TEMPLATE, context)
    }
}

/// Append a retry context block to a rendered prompt
pub fn with_retry_context(prompt: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.trim().is_empty() => format!("{}\n\n{}\n", prompt.trim_end(), ctx.trim()),
        _ => prompt.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn list() -> TaskList {
        TaskList {
            project: "demo".to_string(),
            tasks: vec![
                Task::new("Setup").completed(),
                Task::new("Build API")
                    .with_id("api")
                    .with_description("REST endpoints")
                    .with_steps(vec!["GET /items".to_string()]),
            ],
        }
    }

    #[test]
    fn test_render_iteration_prompt() {
        let list = list();
        let ctx = PromptContext::new(&list, "prd.json").with_task(&list.tasks[1], 1);
        let prompt = PromptLoader::embedded_only().iteration_prompt(&ctx).unwrap();

        assert!(prompt.contains("\"demo\""));
        assert!(prompt.contains("1 of 2 tasks are done"));
        assert!(prompt.contains("Current task (2 of 2): Build API"));
        assert!(prompt.contains("- GET /items"));
        assert!(prompt.contains("<promise>COMPLETE</promise>"));
        assert!(prompt.contains("<decompose-task>"));
        assert!(!prompt.contains("previous iteration failed verification"));
    }

    #[test]
    fn test_render_includes_feedback_sections() {
        let list = list();
        let ctx = PromptContext::new(&list, "prd.json")
            .with_learnings(Some("- LESSON: run migrations first".to_string()))
            .with_verification_failure(Some("test: exit 1".to_string()));
        let prompt = PromptLoader::embedded_only().iteration_prompt(&ctx).unwrap();
        assert!(prompt.contains("run migrations first"));
        assert!(prompt.contains("test: exit 1"));
    }

    #[test]
    fn test_user_override() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("prompts")).unwrap();
        std::fs::write(temp.path().join("prompts/iteration.pmt"), "Do {{project}}").unwrap();

        let ctx = PromptContext::new(&list(), "prd.json");
        let prompt = PromptLoader::new(temp.path()).iteration_prompt(&ctx).unwrap();
        assert_eq!(prompt, "Do demo");
    }

    #[test]
    fn test_with_retry_context() {
        assert_eq!(with_retry_context("p", None), "p");
        assert_eq!(with_retry_context("p\n", Some("ctx")), "p\n\nctx\n");
    }
}
