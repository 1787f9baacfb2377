//! IterationLog domain type
//!
//! Write-once record of a single iteration, appended to the per-session log
//! stream after the iteration completes. Used for post-hoc statistics and
//! technical-debt analysis.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::RetryContext;

/// Final status of an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// Agent signalled completion and verification (if any) passed
    Completed,
    /// Agent succeeded but did not signal completion
    Incomplete,
    /// Agent claimed completion but a verification check failed
    VerificationFailed,
    /// Agent requested decomposition; the iteration restarts
    Decomposed,
    /// Retries exhausted
    Failed,
    /// Fatal classification, session ends
    Fatal,
    /// Aborted by the user or a shutdown signal
    Aborted,
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::VerificationFailed => "verification_failed",
            Self::Decomposed => "decomposed",
            Self::Failed => "failed",
            Self::Fatal => "fatal",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Verification outcome attached to an iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    pub passed: bool,
    pub failed_checks: Vec<String>,
    pub duration_ms: u64,
}

/// Decomposition outcome attached to an iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompositionSummary {
    pub original_task_title: String,
    pub reason: String,
    pub subtask_count: usize,
}

/// Persistent record of one iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationLog {
    pub iteration: u32,
    pub status: IterationStatus,
    pub exit_code: Option<i32>,
    pub retry_count: u32,
    pub output_length: usize,
    pub task_was_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_contexts: Option<Vec<RetryContext>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<DecompositionSummary>,
    #[serde(default)]
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl IterationLog {
    /// Create a new IterationLog
    pub fn new(iteration: u32, status: IterationStatus) -> Self {
        debug!(iteration, %status, "IterationLog::new: called");
        Self {
            iteration,
            status,
            exit_code: None,
            retry_count: 0,
            output_length: 0,
            task_was_completed: false,
            task_title: None,
            retry_contexts: None,
            verification: None,
            decomposition: None,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    /// Builder: set exit code
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Builder: set retry count
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Builder: set output length
    pub fn with_output_length(mut self, output_length: usize) -> Self {
        self.output_length = output_length;
        self
    }

    /// Builder: set task info
    pub fn with_task(mut self, title: impl Into<String>, completed: bool) -> Self {
        self.task_title = Some(title.into());
        self.task_was_completed = completed;
        self
    }

    /// Builder: set retry contexts (omitted when empty)
    pub fn with_retry_contexts(mut self, contexts: Vec<RetryContext>) -> Self {
        debug!(count = contexts.len(), "IterationLog::with_retry_contexts");
        self.retry_contexts = if contexts.is_empty() { None } else { Some(contexts) };
        self
    }

    /// Builder: set verification summary
    pub fn with_verification(mut self, verification: VerificationSummary) -> Self {
        self.verification = Some(verification);
        self
    }

    /// Builder: set decomposition summary
    pub fn with_decomposition(mut self, decomposition: DecompositionSummary) -> Self {
        self.decomposition = Some(decomposition);
        self
    }

    /// Builder: set duration
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Aggregate view over a session's iteration logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationLogSummary {
    pub iterations: usize,
    pub by_status: BTreeMap<IterationStatus, usize>,
    pub total_retries: u32,
    pub verification_failures: usize,
    pub decompositions: usize,
    pub tasks_completed: usize,
    /// Iterations that needed at least one retry
    pub retried_iterations: usize,
}

/// Summarize a session's iteration logs
pub fn summarize(logs: &[IterationLog]) -> IterationLogSummary {
    debug!(count = logs.len(), "summarize: called");
    let mut summary = IterationLogSummary {
        iterations: logs.len(),
        ..Default::default()
    };
    for log in logs {
        *summary.by_status.entry(log.status).or_default() += 1;
        summary.total_retries += log.retry_count;
        if log.retry_count > 0 {
            summary.retried_iterations += 1;
        }
        if log.verification.as_ref().is_some_and(|v| !v.passed) {
            summary.verification_failures += 1;
        }
        if log.decomposition.is_some() {
            summary.decompositions += 1;
        }
        if log.task_was_completed {
            summary.tasks_completed += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_omits_empty_retry_contexts() {
        let log = IterationLog::new(1, IterationStatus::Incomplete).with_retry_contexts(vec![]);
        assert!(log.retry_contexts.is_none());
        let json = serde_json::to_string(&log).unwrap();
        assert!(!json.contains("retryContexts"));
        assert!(json.contains("\"status\":\"incomplete\""));
    }

    #[test]
    fn test_summarize() {
        let logs = vec![
            IterationLog::new(1, IterationStatus::Completed).with_task("A", true),
            IterationLog::new(2, IterationStatus::VerificationFailed)
                .with_retry_count(2)
                .with_verification(VerificationSummary {
                    passed: false,
                    failed_checks: vec!["test".into()],
                    duration_ms: 10,
                }),
            IterationLog::new(3, IterationStatus::Decomposed).with_decomposition(DecompositionSummary {
                original_task_title: "B".into(),
                reason: "too big".into(),
                subtask_count: 3,
            }),
        ];
        let summary = summarize(&logs);
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.total_retries, 2);
        assert_eq!(summary.retried_iterations, 1);
        assert_eq!(summary.verification_failures, 1);
        assert_eq!(summary.decompositions, 1);
        assert_eq!(summary.tasks_completed, 1);
        assert_eq!(summary.by_status[&IterationStatus::Completed], 1);
    }
}
