//! Thin async wrapper around the `git` CLI

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// Result of a git operation that may legitimately have nothing to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOutcome {
    Success(String),
    /// Nothing to do, e.g. nothing to commit
    Skipped(String),
    Error(String),
}

impl GitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success(m) | Self::Skipped(m) | Self::Error(m) => m,
        }
    }
}

impl From<Result<String, GitError>> for GitOutcome {
    fn from(result: Result<String, GitError>) -> Self {
        match result {
            Ok(out) => Self::Success(out),
            Err(e) => Self::Error(e.to_string()),
        }
    }
}

/// Git commands run in one working directory
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
    /// Paths, relative to `dir`, that status and commits never see
    excluded: Vec<String>,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            excluded: Vec::new(),
        }
    }

    /// Leave these paths out of `status` and `commit_all`
    pub fn with_excluded(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.excluded = paths.into_iter().filter(|p| !p.is_empty()).collect();
        self
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    /// `args` followed by the whole-repo pathspec minus the excluded paths
    fn with_pathspecs(&self, args: &[&str]) -> Vec<String> {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        if !self.excluded.is_empty() {
            full.push("--".to_string());
            full.push(":/".to_string());
            full.extend(self.excluded.iter().map(|p| format!(":(exclude){}", p)));
        }
        full
    }

    async fn run_scoped(&self, args: &[&str]) -> Result<String, GitError> {
        let full = self.with_pathspecs(args);
        let full: Vec<&str> = full.iter().map(String::as_str).collect();
        self.run(&full).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run git with `args`; stdout on success
    pub async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        debug!(?args, dir = ?self.dir, "Git::run: called");
        let output = Command::new("git").args(args).current_dir(&self.dir).output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stderr = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            debug!(?args, %stderr, "Git::run: command failed");
            Err(GitError::Command {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr,
            })
        }
    }

    pub async fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"]).await.is_ok_and(|out| out == "true")
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    /// `git status --porcelain`, untracked files included, excluded paths left out
    pub async fn status(&self) -> Result<String, GitError> {
        self.run_scoped(&["status", "--porcelain", "--untracked-files=all"]).await
    }

    pub async fn is_clean(&self) -> Result<bool, GitError> {
        Ok(self.status().await?.is_empty())
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{}", name);
        match self.run(&["rev-parse", "--verify", "--quiet", &reference]).await {
            Ok(_) => Ok(true),
            Err(GitError::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn checkout(&self, name: &str) -> GitOutcome {
        self.run(&["checkout", name]).await.map(|_| format!("checked out {}", name)).into()
    }

    pub async fn create_branch(&self, name: &str) -> GitOutcome {
        self.run(&["checkout", "-b", name])
            .await
            .map(|_| format!("created {}", name))
            .into()
    }

    /// Stage everything and commit; `Skipped` when the tree is clean
    pub async fn commit_all(&self, message: &str) -> GitOutcome {
        if let Err(e) = self.run_scoped(&["add", "-A"]).await {
            return GitOutcome::Error(e.to_string());
        }
        match self.run(&["diff", "--cached", "--quiet"]).await {
            Ok(_) => return GitOutcome::Skipped("nothing to commit".to_string()),
            Err(GitError::Command { .. }) => {}
            Err(e) => return GitOutcome::Error(e.to_string()),
        }
        match self.run(&["commit", "-m", message]).await {
            Ok(out) => GitOutcome::Success(out),
            Err(GitError::Command { stderr, .. }) if stderr.contains("nothing to commit") => {
                GitOutcome::Skipped("nothing to commit".to_string())
            }
            Err(e) => GitOutcome::Error(e.to_string()),
        }
    }

    pub async fn push(&self, remote: &str, branch: &str) -> GitOutcome {
        self.run(&["push", "-u", remote, branch])
            .await
            .map(|_| format!("pushed {} to {}", branch, remote))
            .into()
    }

    pub async fn remote_url(&self, remote: &str) -> Option<String> {
        self.run(&["remote", "get-url", remote]).await.ok().filter(|u| !u.is_empty())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["config", "commit.gpgsign", "false"],
            vec!["commit", "--allow-empty", "-q", "-m", "initial"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_repo_detection() {
        let temp = tempdir().unwrap();
        let git = Git::new(temp.path());
        assert!(!git.is_repo().await);
        setup_git_repo(temp.path()).await;
        assert!(git.is_repo().await);
        assert!(git.is_clean().await.unwrap());
    }

    #[tokio::test]
    async fn test_untracked_file_makes_tree_dirty() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        std::fs::write(temp.path().join("new.txt"), "x").unwrap();
        let git = Git::new(temp.path());
        assert!(!git.is_clean().await.unwrap());
    }

    #[tokio::test]
    async fn test_excluded_paths_stay_out_of_status_and_commits() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        std::fs::create_dir_all(temp.path().join(".state/logs")).unwrap();
        std::fs::write(temp.path().join(".state/logs/session.json"), "{}").unwrap();
        std::fs::write(temp.path().join("prd.json"), "{}").unwrap();

        let git = Git::new(temp.path()).with_excluded([".state".to_string(), "prd.json".to_string()]);
        assert!(git.is_clean().await.unwrap());
        assert!(!Git::new(temp.path()).is_clean().await.unwrap());

        std::fs::write(temp.path().join("feature.txt"), "x").unwrap();
        assert!(!git.is_clean().await.unwrap());
        assert!(git.commit_all("add feature").await.is_success());
        assert!(git.is_clean().await.unwrap());

        let tracked = git.run(&["ls-files"]).await.unwrap();
        assert_eq!(tracked, "feature.txt");
        assert!(git.commit_all("again").await.is_skipped());
    }

    #[tokio::test]
    async fn test_branch_create_and_exists() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = Git::new(temp.path());
        let base = git.current_branch().await.unwrap();

        assert!(!git.branch_exists("feature/x").await.unwrap());
        assert!(git.create_branch("feature/x").await.is_success());
        assert!(git.branch_exists("feature/x").await.unwrap());
        assert_eq!(git.current_branch().await.unwrap(), "feature/x");
        assert!(git.checkout(&base).await.is_success());
        assert!(git.checkout("missing").await.is_error());
    }

    #[tokio::test]
    async fn test_commit_all_tri_state() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = Git::new(temp.path());

        assert!(git.commit_all("empty").await.is_skipped());

        std::fs::write(temp.path().join("a.txt"), "a").unwrap();
        let outcome = git.commit_all("add a").await;
        assert!(outcome.is_success(), "{:?}", outcome);
        assert!(git.is_clean().await.unwrap());
    }

    #[tokio::test]
    async fn test_push_without_remote_is_error() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = Git::new(temp.path());
        let branch = git.current_branch().await.unwrap();
        assert!(git.push("origin", &branch).await.is_error());
        assert!(git.remote_url("origin").await.is_none());
    }
}
