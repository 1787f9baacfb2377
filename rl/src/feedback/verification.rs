//! Post-iteration build / test / lint gating

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::agent::classifier::excerpt;
use crate::config::VerificationConfig;
use crate::domain::VerificationSummary;
use crate::events::EventEmitter;

/// Characters of check output kept in a report
pub const OUTPUT_EXCERPT_CHARS: usize = 2000;

/// Result of one check command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub command: String,
    /// `None` when the command timed out or could not be spawned
    pub exit_code: Option<i32>,
    pub passed: bool,
    pub duration_ms: u64,
    pub output: String,
}

/// Every check run after one iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub checks: Vec<CheckResult>,
    pub passed: bool,
    pub duration_ms: u64,
}

impl VerificationReport {
    pub fn failed_checks(&self) -> Vec<String> {
        self.checks.iter().filter(|c| !c.passed).map(|c| c.name.clone()).collect()
    }

    pub fn summary(&self) -> VerificationSummary {
        VerificationSummary {
            passed: self.passed,
            failed_checks: self.failed_checks(),
            duration_ms: self.duration_ms,
        }
    }

    /// Markdown block fed into the next prompt
    pub fn failure_report(&self) -> Option<String> {
        if self.passed {
            return None;
        }
        let mut out = String::new();
        for check in self.checks.iter().filter(|c| !c.passed) {
            let code = check.exit_code.map_or_else(|| "none".to_string(), |c| c.to_string());
            out.push_str(&format!(
                "### {} failed\n**Command:** `{}`\n**Exit code:** {}\n**Duration:** {}ms\n```\n{}\n```\n\n",
                check.name,
                check.command,
                code,
                check.duration_ms,
                check.output.trim_end()
            ));
        }
        Some(out.trim_end().to_string())
    }
}

/// A failed report blocks completion unless every task is already done
pub fn blocks_completion(report: &VerificationReport, all_tasks_done: bool) -> bool {
    !report.passed && !all_tasks_done
}

/// Run one check in `dir` through `sh -c`
pub async fn run_check(name: &str, command: &str, dir: &Path, timeout: Duration) -> CheckResult {
    debug!(%name, %command, ?dir, "run_check: called");
    let start = Instant::now();

    let output = tokio::time::timeout(
        timeout,
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let duration_ms = start.elapsed().as_millis() as u64;
    let (exit_code, output) = match output {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            (output.status.code(), excerpt(&text, OUTPUT_EXCERPT_CHARS).to_string())
        }
        Ok(Err(e)) => {
            warn!(%name, error = %e, "run_check: failed to spawn");
            (None, format!("failed to run `{}`: {}", command, e))
        }
        Err(_) => {
            warn!(%name, timeout_ms = timeout.as_millis() as u64, "run_check: timed out");
            (None, format!("timed out after {}ms", timeout.as_millis()))
        }
    };

    let passed = exit_code == Some(0);
    debug!(%name, ?exit_code, passed, duration_ms, "run_check: finished");
    CheckResult {
        name: name.to_string(),
        command: command.to_string(),
        exit_code,
        passed,
        duration_ms,
        output,
    }
}

/// Runs the configured checks
#[derive(Debug, Clone)]
pub struct Verifier {
    checks: Vec<(String, String)>,
    dir: PathBuf,
    timeout: Duration,
    enabled: bool,
}

impl Verifier {
    pub fn new(config: &VerificationConfig, dir: impl Into<PathBuf>) -> Self {
        let checks = [
            ("build", &config.build_command),
            ("test", &config.test_command),
            ("lint", &config.lint_command),
        ]
        .into_iter()
        .filter_map(|(name, cmd)| {
            cmd.as_ref()
                .filter(|c| !c.trim().is_empty())
                .map(|c| (name.to_string(), c.clone()))
        })
        .collect();
        Self {
            checks,
            dir: dir.into(),
            timeout: Duration::from_millis(config.timeout_ms),
            enabled: config.enabled,
        }
    }

    /// Enabled with at least one command
    pub fn is_active(&self) -> bool {
        self.enabled && !self.checks.is_empty()
    }

    /// Run every check in order; `None` when verification is off or skipped
    pub async fn verify(&self, iteration: u32, skip: bool, emitter: &EventEmitter) -> Option<VerificationReport> {
        debug!(iteration, skip, "Verifier::verify: called");
        if skip || !self.is_active() {
            return None;
        }

        let start = Instant::now();
        let mut checks = Vec::with_capacity(self.checks.len());
        for (name, command) in &self.checks {
            emitter.verification_started(iteration, name, command);
            checks.push(run_check(name, command, &self.dir, self.timeout).await);
        }

        let report = VerificationReport {
            passed: checks.iter().all(|c| c.passed),
            checks,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(iteration, passed = report.passed, failed = ?report.failed_checks(), "Verifier::verify: done");
        emitter.verification_completed(iteration, report.passed, report.failed_checks());
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use tempfile::tempdir;

    fn config(build: Option<&str>, test: Option<&str>) -> VerificationConfig {
        VerificationConfig {
            enabled: true,
            build_command: build.map(String::from),
            test_command: test.map(String::from),
            lint_command: None,
            timeout_ms: 30_000,
        }
    }

    #[tokio::test]
    async fn test_check_success() {
        let temp = tempdir().unwrap();
        let result = run_check("build", "echo ok", temp.path(), Duration::from_secs(30)).await;
        assert!(result.passed);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("ok"));
    }

    #[tokio::test]
    async fn test_check_failure_keeps_stderr() {
        let temp = tempdir().unwrap();
        let result = run_check("test", "echo boom >&2; exit 3", temp.path(), Duration::from_secs(30)).await;
        assert!(!result.passed);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.output.contains("boom"));
    }

    #[tokio::test]
    async fn test_check_timeout() {
        let temp = tempdir().unwrap();
        let result = run_check("test", "sleep 10", temp.path(), Duration::from_millis(100)).await;
        assert!(!result.passed);
        assert_eq!(result.exit_code, None);
        assert!(result.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_output_excerpt_is_bounded() {
        let temp = tempdir().unwrap();
        let result = run_check("lint", "seq 1 5000", temp.path(), Duration::from_secs(30)).await;
        assert!(result.output.chars().count() <= OUTPUT_EXCERPT_CHARS);
        assert!(result.output.ends_with("5000"));
    }

    #[tokio::test]
    async fn test_verify_reports_failed_checks() {
        let temp = tempdir().unwrap();
        let bus = EventBus::with_default_capacity();
        let mut sub = bus.subscribe();
        let verifier = Verifier::new(&config(Some("true"), Some("exit 1")), temp.path());

        let report = verifier.verify(2, false, &bus.emitter_for("s1")).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.failed_checks(), vec!["test"]);
        assert!(report.failure_report().unwrap().contains("### test failed"));
        assert!(blocks_completion(&report, false));
        assert!(!blocks_completion(&report, true));

        let names: Vec<&str> = sub.drain().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["verification:start", "verification:start", "verification:complete"]
        );
    }

    #[tokio::test]
    async fn test_verify_skipped_or_disabled() {
        let temp = tempdir().unwrap();
        let bus = EventBus::with_default_capacity();
        let emitter = bus.emitter_for("s1");

        let verifier = Verifier::new(&config(Some("exit 1"), None), temp.path());
        assert!(verifier.verify(1, true, &emitter).await.is_none());

        let mut disabled = config(Some("exit 1"), None);
        disabled.enabled = false;
        assert!(!Verifier::new(&disabled, temp.path()).is_active());

        assert!(!Verifier::new(&config(None, Some("  ")), temp.path()).is_active());
    }
}
