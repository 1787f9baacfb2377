//! Branch mode: one git branch per task
//!
//! - [`git`]: the git CLI with tri-state outcomes
//! - [`provider`]: pull-request creation through `gh` / `glab`
//! - [`workflow`]: create, commit, push, PR and return per task

pub mod git;
pub mod provider;
pub mod workflow;

pub use git::{Git, GitError, GitOutcome};
pub use provider::{GitHubCli, GitLabCli, PrProvider, ProviderError, PullRequest, detect_provider, remote_host};
pub use workflow::{BranchModeInit, BranchWorkflow, TaskBranch, TaskCompletion, branch_name};
