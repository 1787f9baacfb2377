//! Event types for ralphloop activity streaming
//!
//! These events are the only way the orchestration core exposes its state
//! transitions to presentation, logging and statistics consumers:
//! - Agent invocations (start, output, retry, error, complete)
//! - Iteration lifecycle (start, delay, complete)
//! - Session lifecycle (start, resume, pause, stop, complete)
//! - Parallel groups and their tasks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::IterationStatus;

/// Core event enum - the vocabulary of ralphloop activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // === Agent ===
    /// An agent process was spawned
    AgentStarted {
        execution_id: String,
        attempt: u32,
        command: String,
    },
    /// Parsed, de-duplicated agent text
    AgentOutput { execution_id: String, text: String },
    /// An agent invocation finished (after its internal retries)
    AgentCompleted {
        execution_id: String,
        success: bool,
        exit_code: Option<i32>,
        is_complete: bool,
        retry_count: u32,
    },
    /// An agent attempt failed
    AgentError {
        execution_id: String,
        message: String,
        fatal: bool,
    },
    /// An agent attempt will be retried after a delay
    AgentRetry {
        execution_id: String,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },

    // === Iterations ===
    /// An iteration has started
    IterationStarted {
        execution_id: String,
        iteration: u32,
        task_title: Option<String>,
    },
    /// An iteration has completed
    IterationCompleted {
        execution_id: String,
        iteration: u32,
        status: IterationStatus,
    },
    /// Waiting before the next iteration
    IterationDelay {
        execution_id: String,
        next_iteration: u32,
        delay_ms: u64,
    },

    // === Session ===
    SessionStarted {
        execution_id: String,
        total_iterations: u32,
        parallel: bool,
    },
    SessionResumed {
        execution_id: String,
        from_iteration: u32,
        remaining_iterations: u32,
    },
    SessionPaused { execution_id: String, iteration: u32 },
    SessionStopped { execution_id: String, reason: String },
    SessionCompleted {
        execution_id: String,
        outcome: String,
        iterations: u32,
    },

    // === Parallel ===
    ParallelGroupStarted {
        execution_id: String,
        group_index: usize,
        task_ids: Vec<String>,
    },
    ParallelGroupCompleted {
        execution_id: String,
        group_index: usize,
        completed: usize,
        failed: usize,
    },
    ParallelTaskStarted {
        execution_id: String,
        group_index: usize,
        task_id: String,
        task_title: String,
    },
    ParallelTaskCompleted {
        execution_id: String,
        task_id: String,
        success: bool,
        error: Option<String>,
    },

    // === Feedback ===
    VerificationStarted {
        execution_id: String,
        iteration: u32,
        check: String,
        command: String,
    },
    VerificationCompleted {
        execution_id: String,
        iteration: u32,
        passed: bool,
        failed_checks: Vec<String>,
    },
    TaskDecomposed {
        execution_id: String,
        original_task: String,
        subtask_count: usize,
    },

    // === Errors & Warnings ===
    Error {
        execution_id: String,
        context: String,
        message: String,
    },
    Warning {
        execution_id: String,
        context: String,
        message: String,
    },
}

impl Event {
    /// Get the execution ID for this event
    pub fn execution_id(&self) -> &str {
        match self {
            Event::AgentStarted { execution_id, .. }
            | Event::AgentOutput { execution_id, .. }
            | Event::AgentCompleted { execution_id, .. }
            | Event::AgentError { execution_id, .. }
            | Event::AgentRetry { execution_id, .. }
            | Event::IterationStarted { execution_id, .. }
            | Event::IterationCompleted { execution_id, .. }
            | Event::IterationDelay { execution_id, .. }
            | Event::SessionStarted { execution_id, .. }
            | Event::SessionResumed { execution_id, .. }
            | Event::SessionPaused { execution_id, .. }
            | Event::SessionStopped { execution_id, .. }
            | Event::SessionCompleted { execution_id, .. }
            | Event::ParallelGroupStarted { execution_id, .. }
            | Event::ParallelGroupCompleted { execution_id, .. }
            | Event::ParallelTaskStarted { execution_id, .. }
            | Event::ParallelTaskCompleted { execution_id, .. }
            | Event::VerificationStarted { execution_id, .. }
            | Event::VerificationCompleted { execution_id, .. }
            | Event::TaskDecomposed { execution_id, .. }
            | Event::Error { execution_id, .. }
            | Event::Warning { execution_id, .. } => execution_id,
        }
    }

    /// Get the event name (`topic:action`)
    pub fn name(&self) -> &'static str {
        match self {
            Event::AgentStarted { .. } => "agent:start",
            Event::AgentOutput { .. } => "agent:output",
            Event::AgentCompleted { .. } => "agent:complete",
            Event::AgentError { .. } => "agent:error",
            Event::AgentRetry { .. } => "agent:retry",
            Event::IterationStarted { .. } => "iteration:start",
            Event::IterationCompleted { .. } => "iteration:complete",
            Event::IterationDelay { .. } => "iteration:delay",
            Event::SessionStarted { .. } => "session:start",
            Event::SessionResumed { .. } => "session:resume",
            Event::SessionPaused { .. } => "session:pause",
            Event::SessionStopped { .. } => "session:stop",
            Event::SessionCompleted { .. } => "session:complete",
            Event::ParallelGroupStarted { .. } => "parallel:group_start",
            Event::ParallelGroupCompleted { .. } => "parallel:group_complete",
            Event::ParallelTaskStarted { .. } => "parallel:task_start",
            Event::ParallelTaskCompleted { .. } => "parallel:task_complete",
            Event::VerificationStarted { .. } => "verification:start",
            Event::VerificationCompleted { .. } => "verification:complete",
            Event::TaskDecomposed { .. } => "task:decomposed",
            Event::Error { .. } => "error",
            Event::Warning { .. } => "warning",
        }
    }
}

/// A timestamped event log entry for file persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Timestamp of the event
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// The event
    pub event: Event,
}

impl EventLogEntry {
    /// Create a new log entry with current timestamp
    pub fn new(event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_execution_id() {
        let event = Event::AgentStarted {
            execution_id: "main".to_string(),
            attempt: 1,
            command: "claude".to_string(),
        };
        assert_eq!(event.execution_id(), "main");
    }

    #[test]
    fn test_event_names() {
        let event = Event::ParallelGroupStarted {
            execution_id: "s".to_string(),
            group_index: 0,
            task_ids: vec![],
        };
        assert_eq!(event.name(), "parallel:group_start");

        let event = Event::IterationDelay {
            execution_id: "s".to_string(),
            next_iteration: 2,
            delay_ms: 100,
        };
        assert_eq!(event.name(), "iteration:delay");
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::IterationCompleted {
            execution_id: "main".to_string(),
            iteration: 1,
            status: IterationStatus::VerificationFailed,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("IterationCompleted"));
        assert!(json.contains("verification_failed"));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
