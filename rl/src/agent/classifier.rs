//! Error classification for agent failures
//!
//! Two independent passes over the same input:
//! - [`classify_error`] decides fatal vs retryable (drives the retry loop)
//! - [`analyze_failure`] labels the root cause of a retryable failure so the
//!   next attempt's prompt can carry a "previous failure" paragraph

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fatal vs retryable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The user has to intervene; the session ends
    Fatal,
    /// Transient; retried with backoff
    Retryable,
}

/// Outcome of [`classify_error`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub code: &'static str,
    pub message: String,
    pub suggestion: Option<String>,
}

impl ClassifiedError {
    pub fn is_fatal(&self) -> bool {
        self.category == ErrorCategory::Fatal
    }
}

struct FatalPattern {
    regex: Regex,
    code: &'static str,
    suggestion: &'static str,
}

fn fatal(pattern: &str, code: &'static str, suggestion: &'static str) -> FatalPattern {
    FatalPattern {
        regex: Regex::new(pattern).expect("fatal pattern is valid"),
        code,
        suggestion,
    }
}

static FATAL_PATTERNS: LazyLock<Vec<FatalPattern>> = LazyLock::new(|| {
    vec![
        fatal(
            r"(?i)permission denied|EACCES",
            "permission_denied",
            "Check file permissions and that the agent may access the project directory",
        ),
        fatal(
            r"(?i)command not found",
            "command_not_found",
            "Install the agent CLI or fix `agent.command` in the configuration",
        ),
        fatal(
            r"(?i)\bENOENT\b|not found in \$?PATH|executable file not found|no such file or directory \(os error 2\)",
            "executable_missing",
            "Make sure the agent executable exists and is on PATH",
        ),
        fatal(
            r"(?i)unauthori[sz]ed|forbidden|authentication (failed|required)|invalid api key",
            "auth_failed",
            "Log in to the agent CLI or refresh its API key",
        ),
    ]
});

/// Classify a failed attempt as fatal or retryable
///
/// Rules, in order: fatal text pattern, exit 127, exit 126, exit 1 (generic
/// retryable), anything else (unknown retryable).
pub fn classify_error(text: &str, exit_code: Option<i32>) -> ClassifiedError {
    debug!(?exit_code, len = text.len(), "classify_error: called");
    let message = first_line(text);

    if let Some(pattern) = FATAL_PATTERNS.iter().find(|p| p.regex.is_match(text)) {
        debug!(code = pattern.code, "classify_error: fatal pattern matched");
        return ClassifiedError {
            category: ErrorCategory::Fatal,
            code: pattern.code,
            message,
            suggestion: Some(pattern.suggestion.to_string()),
        };
    }

    match exit_code {
        Some(127) => ClassifiedError {
            category: ErrorCategory::Fatal,
            code: "command_not_found",
            message: if message.is_empty() { "command not found".to_string() } else { message },
            suggestion: Some("Install the agent CLI or fix `agent.command` in the configuration".to_string()),
        },
        Some(126) => ClassifiedError {
            category: ErrorCategory::Fatal,
            code: "not_executable",
            message: if message.is_empty() { "command is not executable".to_string() } else { message },
            suggestion: Some("Make the agent command executable (chmod +x)".to_string()),
        },
        Some(1) => ClassifiedError {
            category: ErrorCategory::Retryable,
            code: "generic_failure",
            message,
            suggestion: None,
        },
        _ => ClassifiedError {
            category: ErrorCategory::Retryable,
            code: "unknown",
            message,
            suggestion: None,
        },
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Root-cause label for a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Stuck,
    Timeout,
    Permission,
    Network,
    Syntax,
    Dependency,
    Build,
    Test,
    Lint,
    Unknown,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stuck => "stuck",
            Self::Timeout => "timeout",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::Syntax => "syntax",
            Self::Dependency => "dependency",
            Self::Build => "build",
            Self::Test => "test",
            Self::Lint => "lint",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Enriched description of a failure, used to build the next prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAnalysis {
    pub category: FailureCategory,
    pub root_cause: String,
    pub suggested_approach: String,
    pub context_injection: String,
    pub should_retry: bool,
}

struct CauseRule {
    category: FailureCategory,
    regex: Regex,
    root_cause: &'static str,
    approach: &'static str,
}

fn cause(category: FailureCategory, pattern: &str, root_cause: &'static str, approach: &'static str) -> CauseRule {
    CauseRule {
        category,
        regex: Regex::new(pattern).expect("failure pattern is valid"),
        root_cause,
        approach,
    }
}

static CAUSE_RULES: LazyLock<Vec<CauseRule>> = LazyLock::new(|| {
    use FailureCategory::*;
    vec![
        cause(
            Stuck,
            r"(?i)\bstuck\b|no output for",
            "The agent stopped producing output",
            "Break the work into smaller steps and report progress as you go",
        ),
        cause(
            Timeout,
            r"(?i)timed out|timeout|deadline exceeded",
            "The attempt exceeded its time budget",
            "Focus on the smallest change that moves the task forward",
        ),
        cause(
            Permission,
            r"(?i)permission denied|EACCES|EPERM|read-only file system",
            "A file or command could not be accessed",
            "Avoid touching files outside the project and check paths before writing",
        ),
        cause(
            Network,
            r"(?i)ECONNREFUSED|ECONNRESET|ETIMEDOUT|ENOTFOUND|network (error|unreachable)|connection (refused|reset)|rate limit|\b429\b|\b50[23]\b|overloaded",
            "A network or service request failed",
            "Retry the same approach; the failure looks transient",
        ),
        cause(
            Syntax,
            r"(?i)syntax ?error|unexpected token|parse error|expected one of",
            "Source code failed to parse",
            "Re-read the edited files and fix the syntax before continuing",
        ),
        cause(
            Dependency,
            r"(?i)cannot find module|module not found|no matching package|unresolved import|could not resolve|failed to select a version",
            "A dependency or import could not be resolved",
            "Check the manifest and install or declare the missing dependency",
        ),
        cause(
            Build,
            r"(?i)build failed|compilation failed|could not compile|error\[E\d+\]|cannot find (type|value|function)",
            "The project failed to build",
            "Fix the compiler errors first, then re-run the build",
        ),
        cause(
            Test,
            r"(?i)tests? failed|failing tests?|assertion failed|\bFAILED\b|panicked at",
            "One or more tests failed",
            "Run the failing tests in isolation and fix them one by one",
        ),
        cause(
            Lint,
            r"(?i)\blint\b|clippy|eslint|warning: unused|formatting (check )?failed",
            "Lint or formatting checks failed",
            "Apply the linter's suggestions and re-run it",
        ),
    ]
});

/// Analyse a failed attempt's combined output
///
/// Only enriches the next prompt; never changes the fatal/retryable decision.
pub fn analyze_failure(output: &str, exit_code: Option<i32>) -> FailureAnalysis {
    debug!(?exit_code, len = output.len(), "analyze_failure: called");

    let (category, root_cause, approach) = match CAUSE_RULES.iter().find(|r| r.regex.is_match(output)) {
        Some(rule) => (rule.category, rule.root_cause.to_string(), rule.approach),
        None => {
            let root_cause = match exit_code {
                Some(code) => format!("The agent exited with code {}", code),
                None => "The agent terminated without an exit code".to_string(),
            };
            (
                FailureCategory::Unknown,
                root_cause,
                "Review the previous attempt's output and try a different approach",
            )
        }
    };

    let excerpt = excerpt(output, 500);
    let context_injection = format!(
        "## Previous attempt failed ({})\n{}. {}.\nLast output:\n```\n{}\n```",
        category, root_cause, approach, excerpt
    );

    FailureAnalysis {
        category,
        root_cause,
        suggested_approach: approach.to_string(),
        context_injection,
        should_retry: category != FailureCategory::Permission,
    }
}

/// Last `max` characters of `text`, on a char boundary
pub fn excerpt(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_pattern_beats_exit_code() {
        let err = classify_error("permission denied: /etc/shadow", Some(1));
        assert!(err.is_fatal());
        assert_eq!(err.code, "permission_denied");
        assert!(err.suggestion.is_some());
    }

    #[test]
    fn test_fatal_auth_patterns() {
        for text in ["Error: Unauthorized", "403 Forbidden", "Invalid API key provided"] {
            assert!(classify_error(text, Some(0)).is_fatal(), "{}", text);
        }
    }

    #[test]
    fn test_exit_codes_without_pattern() {
        let err = classify_error("", Some(127));
        assert!(err.is_fatal());
        assert_eq!(err.message, "command not found");

        let err = classify_error("boom", Some(126));
        assert!(err.is_fatal());
        assert_eq!(err.code, "not_executable");

        let err = classify_error("something broke", Some(1));
        assert_eq!(err.category, ErrorCategory::Retryable);
        assert_eq!(err.code, "generic_failure");

        let err = classify_error("killed", None);
        assert_eq!(err.code, "unknown");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_stuck_is_retryable() {
        let err = classify_error("Agent appears stuck: no output for 6000ms", None);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_analyze_failure_categories() {
        assert_eq!(analyze_failure("agent stuck", None).category, FailureCategory::Stuck);
        assert_eq!(analyze_failure("error[E0425]: cannot find value", Some(1)).category, FailureCategory::Build);
        assert_eq!(analyze_failure("test result: FAILED. 3 passed", Some(101)).category, FailureCategory::Test);
        assert_eq!(analyze_failure("ECONNRESET", Some(1)).category, FailureCategory::Network);
        assert_eq!(analyze_failure("SyntaxError: Unexpected token", Some(1)).category, FailureCategory::Syntax);
    }

    #[test]
    fn test_analyze_failure_unknown_uses_exit_code() {
        let analysis = analyze_failure("nothing recognizable", Some(3));
        assert_eq!(analysis.category, FailureCategory::Unknown);
        assert!(analysis.root_cause.contains("3"));
        assert!(analysis.should_retry);
        assert!(analysis.context_injection.contains("nothing recognizable"));
    }

    #[test]
    fn test_excerpt_keeps_tail() {
        assert_eq!(excerpt("abcdef", 3), "def");
        assert_eq!(excerpt("ab", 3), "ab");
        assert_eq!(excerpt("héllo wörld", 5), "wörld");
    }
}
