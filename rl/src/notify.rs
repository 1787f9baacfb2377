//! Notification sink
//!
//! Delivery never affects the run: [`notify`] logs and swallows failures.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, bail};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Longest a notification command may run
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    Complete,
    MaxIterations,
    MaxRuntime,
    FatalError,
    VerificationFailed,
    Stopped,
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::MaxIterations => "max_iterations",
            Self::MaxRuntime => "max_runtime",
            Self::FatalError => "fatal_error",
            Self::VerificationFailed => "verification_failed",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent, project: &str, details: &str) -> Result<()>;
}

/// Deliver through `notifier`, logging instead of failing
pub async fn notify(notifier: &dyn Notifier, event: NotifyEvent, project: &str, details: &str) {
    debug!(%event, %project, "notify: called");
    if let Err(e) = notifier.notify(event, project, details).await {
        warn!(%event, error = %e, "notify: delivery failed");
    }
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotifyEvent, project: &str, details: &str) -> Result<()> {
        info!(%event, %project, %details, "notification");
        Ok(())
    }
}

/// Runs a shell command with `RALPH_EVENT`, `RALPH_PROJECT` and `RALPH_DETAILS` set
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, event: NotifyEvent, project: &str, details: &str) -> Result<()> {
        debug!(command = %self.command, %event, "CommandNotifier::notify: called");
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new("sh")
                .arg("-c")
                .arg(&self.command)
                .env("RALPH_EVENT", event.to_string())
                .env("RALPH_PROJECT", project)
                .env("RALPH_DETAILS", details)
                .kill_on_drop(true)
                .output(),
        )
        .await??;
        if !output.status.success() {
            bail!(
                "notification command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Notifier for the configured command, or the log
pub fn from_config(command: Option<&str>) -> Box<dyn Notifier> {
    match command.filter(|c| !c.trim().is_empty()) {
        Some(command) => Box::new(CommandNotifier::new(command)),
        None => Box::new(LogNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_command_notifier_sets_env() {
        let temp = tempdir().unwrap();
        let out = temp.path().join("out.txt");
        let notifier = CommandNotifier::new(format!(
            "echo \"$RALPH_EVENT|$RALPH_PROJECT|$RALPH_DETAILS\" > {}",
            out.display()
        ));
        notifier
            .notify(NotifyEvent::MaxIterations, "demo", "10 iterations")
            .await
            .unwrap();
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "max_iterations|demo|10 iterations");
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let notifier = CommandNotifier::new("exit 7");
        assert!(notifier.notify(NotifyEvent::Complete, "demo", "").await.is_err());
        // must not panic or propagate
        notify(&notifier, NotifyEvent::Complete, "demo", "").await;
    }

    #[tokio::test]
    async fn test_from_config() {
        let notifier = from_config(None);
        assert!(notifier.notify(NotifyEvent::Stopped, "demo", "x").await.is_ok());
        let notifier = from_config(Some("  "));
        assert!(notifier.notify(NotifyEvent::Stopped, "demo", "x").await.is_ok());
    }
}
