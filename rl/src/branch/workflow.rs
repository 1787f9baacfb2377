//! Per-task branch lifecycle
//!
//! initialize (once) -> start_task -> complete_task {commit, push, PR, return to base}

use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::git::{Git, GitOutcome};
use super::provider::{PrProvider, PullRequest, detect_provider};
use crate::config::BranchConfig;

/// Longest slug taken from a task title
const MAX_SLUG_LEN: usize = 40;

/// Result of [`BranchWorkflow::initialize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchModeInit {
    pub is_valid: bool,
    pub base_branch: Option<String>,
    pub error: Option<String>,
}

impl BranchModeInit {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            base_branch: None,
            error: Some(error.into()),
        }
    }
}

/// Branch a task runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBranch {
    pub name: String,
    pub outcome: GitOutcome,
}

/// Everything that happened when a task finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    pub commit: GitOutcome,
    pub push: GitOutcome,
    pub pull_request: GitOutcome,
    pub return_to_base: GitOutcome,
}

/// Deterministic branch name: `<prefix>task-<n>-<slug>` with a 1-based `n`
pub fn branch_name(prefix: &str, index: usize, title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug: String = slug.trim_matches('-').chars().take(MAX_SLUG_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        format!("{}task-{}", prefix, index + 1)
    } else {
        format!("{}task-{}-{}", prefix, index + 1, slug)
    }
}

pub struct BranchWorkflow {
    git: Git,
    config: BranchConfig,
    base_branch: Option<String>,
    provider: Option<Box<dyn PrProvider>>,
}

impl BranchWorkflow {
    pub fn new(config: BranchConfig, dir: impl Into<PathBuf>) -> Self {
        Self {
            git: Git::new(dir),
            config,
            base_branch: None,
            provider: None,
        }
    }

    /// Paths, relative to the working directory, that never dirty the tree or get committed
    pub fn with_excluded(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.git = self.git.with_excluded(paths);
        self
    }

    /// Use this provider instead of detecting one from the remote
    pub fn with_provider(mut self, provider: Box<dyn PrProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn base_branch(&self) -> Option<&str> {
        self.base_branch.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.base_branch.is_some()
    }

    /// Require a clean repository and record the base branch
    pub async fn initialize(&mut self) -> BranchModeInit {
        debug!(dir = ?self.git.dir(), "BranchWorkflow::initialize: called");
        if !self.git.is_repo().await {
            return BranchModeInit::invalid("branch mode requires a git repository");
        }
        match self.git.is_clean().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("BranchWorkflow::initialize: working tree is dirty");
                return BranchModeInit::invalid(
                    "working tree has uncommitted or untracked changes; commit or stash them before enabling branch mode",
                );
            }
            Err(e) => return BranchModeInit::invalid(e.to_string()),
        }
        match self.git.current_branch().await {
            Ok(base) => {
                info!(%base, "BranchWorkflow::initialize: branch mode ready");
                self.base_branch = Some(base.clone());
                BranchModeInit {
                    is_valid: true,
                    base_branch: Some(base),
                    error: None,
                }
            }
            Err(e) => BranchModeInit::invalid(e.to_string()),
        }
    }

    /// Check out the task's branch, creating it when missing
    pub async fn start_task(&self, index: usize, title: &str) -> TaskBranch {
        let name = branch_name(&self.config.prefix, index, title);
        debug!(%name, "BranchWorkflow::start_task: called");
        let outcome = match self.git.branch_exists(&name).await {
            Ok(true) => self.git.checkout(&name).await,
            Ok(false) => self.git.create_branch(&name).await,
            Err(e) => GitOutcome::Error(e.to_string()),
        };
        if outcome.is_error() {
            warn!(%name, error = outcome.message(), "BranchWorkflow::start_task: checkout failed");
        }
        TaskBranch { name, outcome }
    }

    /// Commit, push, open a PR and go back to the base branch, as configured
    ///
    /// Push and PR problems are logged and reported, never escalated.
    pub async fn complete_task(&self, branch: &str, title: &str) -> TaskCompletion {
        debug!(%branch, "BranchWorkflow::complete_task: called");
        let commit = if self.config.auto_commit {
            self.git.commit_all(&format!("ralph: {}", title)).await
        } else {
            GitOutcome::Skipped("auto-commit disabled".to_string())
        };
        if commit.is_error() {
            warn!(%branch, error = commit.message(), "BranchWorkflow::complete_task: commit failed");
        }

        let push = if self.config.auto_push {
            let push = self.git.push(&self.config.remote, branch).await;
            if push.is_error() {
                warn!(%branch, error = push.message(), "BranchWorkflow::complete_task: push failed, continuing");
            }
            push
        } else {
            GitOutcome::Skipped("auto-push disabled".to_string())
        };

        let pull_request = if !self.config.create_pr {
            GitOutcome::Skipped("pull requests disabled".to_string())
        } else if push.is_error() {
            GitOutcome::Skipped("branch was not pushed".to_string())
        } else {
            self.open_pull_request(branch, title).await
        };

        let return_to_base = match (&self.base_branch, self.config.return_to_base) {
            (Some(base), true) => self.git.checkout(base).await,
            _ => GitOutcome::Skipped("staying on task branch".to_string()),
        };

        TaskCompletion {
            commit,
            push,
            pull_request,
            return_to_base,
        }
    }

    async fn open_pull_request(&self, branch: &str, title: &str) -> GitOutcome {
        let Some(base) = self.base_branch.clone() else {
            return GitOutcome::Skipped("branch mode not initialized".to_string());
        };
        let pr = PullRequest {
            title: title.to_string(),
            body: format!("Automated change for task: {}", title),
            head: branch.to_string(),
            base,
        };

        let detected;
        let provider: &dyn PrProvider = match &self.provider {
            Some(provider) => provider.as_ref(),
            None => {
                let Some(url) = self.git.remote_url(&self.config.remote).await else {
                    return GitOutcome::Skipped(format!("no remote named {}", self.config.remote));
                };
                match detect_provider(&url) {
                    Ok(p) => {
                        detected = p;
                        detected.as_ref()
                    }
                    Err(e) => {
                        info!(error = %e, "BranchWorkflow: skipping pull request");
                        return GitOutcome::Skipped(e.to_string());
                    }
                }
            }
        };

        match provider.create(self.git.dir(), &pr).await {
            Ok(url) => GitOutcome::Success(url),
            Err(e) if e.is_unavailable() => {
                info!(provider = provider.name(), error = %e, "BranchWorkflow: skipping pull request");
                GitOutcome::Skipped(e.to_string())
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "BranchWorkflow: pull request failed");
                GitOutcome::Error(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::git::tests::setup_git_repo;
    use crate::branch::provider::ProviderError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn config() -> BranchConfig {
        BranchConfig {
            enabled: true,
            prefix: "ralph/".to_string(),
            auto_commit: true,
            auto_push: false,
            create_pr: false,
            return_to_base: true,
            remote: "origin".to_string(),
        }
    }

    struct RecordingProvider {
        seen: Arc<Mutex<Vec<PullRequest>>>,
        result: fn() -> Result<String, ProviderError>,
    }

    #[async_trait]
    impl PrProvider for RecordingProvider {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn create(&self, _dir: &Path, pr: &PullRequest) -> Result<String, ProviderError> {
            self.seen.lock().unwrap().push(pr.clone());
            (self.result)()
        }
    }

    #[test]
    fn test_branch_name_sanitized() {
        assert_eq!(branch_name("ralph/", 0, "Add user login!"), "ralph/task-1-add-user-login");
        assert_eq!(branch_name("", 4, "  --Fix: API (v2)  "), "task-5-fix-api-v2");
        assert_eq!(branch_name("r/", 2, "???"), "r/task-3");
        let long = branch_name("r/", 0, &"word ".repeat(30));
        assert!(long.len() <= "r/task-1-".len() + MAX_SLUG_LEN);
        assert!(!long.ends_with('-'));
    }

    #[tokio::test]
    async fn test_initialize_rejects_untracked_changes() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        std::fs::write(temp.path().join("stray.txt"), "x").unwrap();

        let mut workflow = BranchWorkflow::new(config(), temp.path());
        let init = workflow.initialize().await;
        assert!(!init.is_valid);
        assert!(init.error.unwrap().contains("uncommitted or untracked changes"));
        assert!(!workflow.is_initialized());

        let branches = Git::new(temp.path()).run(&["branch", "--list"]).await.unwrap();
        assert_eq!(branches.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_excluded_state_does_not_block_or_get_committed() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        std::fs::create_dir_all(temp.path().join(".ralphloop")).unwrap();
        std::fs::write(temp.path().join(".ralphloop/session.json"), "{}").unwrap();

        let mut workflow = BranchWorkflow::new(config(), temp.path()).with_excluded([".ralphloop".to_string()]);
        assert!(workflow.initialize().await.is_valid);

        let branch = workflow.start_task(0, "Work").await;
        std::fs::write(temp.path().join("work.txt"), "w").unwrap();
        let done = workflow.complete_task(&branch.name, "Work").await;
        assert!(done.commit.is_success());

        let files = Git::new(temp.path())
            .run(&["ls-tree", "-r", "--name-only", &branch.name])
            .await
            .unwrap();
        assert_eq!(files, "work.txt");
        assert!(temp.path().join(".ralphloop/session.json").exists());
    }

    #[tokio::test]
    async fn test_initialize_outside_repo() {
        let temp = tempdir().unwrap();
        let mut workflow = BranchWorkflow::new(config(), temp.path());
        assert!(!workflow.initialize().await.is_valid);
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let mut workflow = BranchWorkflow::new(config(), temp.path());
        let init = workflow.initialize().await;
        assert!(init.is_valid);
        let base = init.base_branch.unwrap();

        let branch = workflow.start_task(0, "Add login").await;
        assert_eq!(branch.name, "ralph/task-1-add-login");
        assert!(branch.outcome.is_success());

        std::fs::write(temp.path().join("login.rs"), "fn login() {}").unwrap();
        let done = workflow.complete_task(&branch.name, "Add login").await;
        assert!(done.commit.is_success());
        assert!(done.push.is_skipped());
        assert!(done.pull_request.is_skipped());
        assert!(done.return_to_base.is_success());

        let git = Git::new(temp.path());
        assert_eq!(git.current_branch().await.unwrap(), base);

        // existing branch is checked out, not recreated
        let again = workflow.start_task(0, "Add login").await;
        assert!(again.outcome.is_success());
        assert_eq!(git.current_branch().await.unwrap(), "ralph/task-1-add-login");
    }

    #[tokio::test]
    async fn test_nothing_to_commit_is_skipped() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let mut workflow = BranchWorkflow::new(config(), temp.path());
        workflow.initialize().await;
        let branch = workflow.start_task(1, "Noop").await;
        let done = workflow.complete_task(&branch.name, "Noop").await;
        assert!(done.commit.is_skipped());
    }

    #[tokio::test]
    async fn test_push_failure_degrades() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let mut cfg = config();
        cfg.auto_push = true;
        cfg.create_pr = true;
        let mut workflow = BranchWorkflow::new(cfg, temp.path());
        workflow.initialize().await;
        let branch = workflow.start_task(0, "Push me").await;
        std::fs::write(temp.path().join("a.txt"), "a").unwrap();

        let done = workflow.complete_task(&branch.name, "Push me").await;
        assert!(done.commit.is_success());
        assert!(done.push.is_error());
        assert!(done.pull_request.is_skipped());
        assert!(done.return_to_base.is_success());
    }

    #[tokio::test]
    async fn test_pull_request_through_provider() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let mut cfg = config();
        cfg.create_pr = true;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let provider = RecordingProvider {
            seen: Arc::clone(&seen),
            result: || Ok("https://example.com/pr/1".to_string()),
        };
        let mut workflow = BranchWorkflow::new(cfg, temp.path()).with_provider(Box::new(provider));
        let base = workflow.initialize().await.base_branch.unwrap();
        let branch = workflow.start_task(0, "Feature").await;

        let done = workflow.complete_task(&branch.name, "Feature").await;
        assert_eq!(done.pull_request, GitOutcome::Success("https://example.com/pr/1".to_string()));
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].head, branch.name);
        assert_eq!(seen[0].base, base);
    }

    #[tokio::test]
    async fn test_provider_auth_missing_is_skipped() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let mut cfg = config();
        cfg.create_pr = true;
        let provider = RecordingProvider {
            seen: Arc::new(Mutex::new(Vec::new())),
            result: || Err(ProviderError::AuthMissing("gh")),
        };
        let mut workflow = BranchWorkflow::new(cfg, temp.path()).with_provider(Box::new(provider));
        workflow.initialize().await;
        let branch = workflow.start_task(0, "Feature").await;
        assert!(workflow.complete_task(&branch.name, "Feature").await.pull_request.is_skipped());
    }

    #[tokio::test]
    async fn test_pull_request_without_remote_is_skipped() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let mut cfg = config();
        cfg.create_pr = true;
        let mut workflow = BranchWorkflow::new(cfg, temp.path());
        workflow.initialize().await;
        let branch = workflow.start_task(0, "Feature").await;
        let done = workflow.complete_task(&branch.name, "Feature").await;
        assert!(done.pull_request.is_skipped());
    }
}
