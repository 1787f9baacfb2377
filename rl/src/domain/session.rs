//! Session domain type
//!
//! The session is the single source of truth for "is a run in progress and
//! where is it". It is created when a run starts, mutated on every iteration
//! start/end and status transition, and deleted on successful completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Actively iterating
    #[default]
    Running,
    /// User paused between iterations
    Paused,
    /// Stopped by the user or a host shutdown signal
    Stopped,
    /// All tasks done
    Completed,
    /// Ended by a fatal agent error
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Timing of one iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationTiming {
    pub iteration: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Running statistics for a session
///
/// `average_duration_ms` and `success_rate` are derived from the running
/// totals and recomputed on every iteration end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStatistics {
    pub total_iterations: u32,
    pub completed_iterations: u32,
    pub failed_iterations: u32,
    pub successful_iterations: u32,
    pub total_duration_ms: u64,
    pub average_duration_ms: u64,
    /// Percentage of completed iterations that succeeded (0-100)
    pub success_rate: f64,
    pub iteration_timings: Vec<IterationTiming>,
}

impl SessionStatistics {
    /// Record the start of an iteration
    ///
    /// Starting the same iteration number again updates its start time rather
    /// than adding a second timing entry.
    pub fn start_iteration(&mut self, iteration: u32, now: DateTime<Utc>) {
        debug!(iteration, "SessionStatistics::start_iteration: called");
        if let Some(timing) = self.iteration_timings.iter_mut().find(|t| t.iteration == iteration) {
            debug!(iteration, "SessionStatistics::start_iteration: restarting existing entry");
            timing.start_time = now;
            timing.end_time = None;
            timing.duration_ms = None;
            return;
        }
        self.iteration_timings.push(IterationTiming {
            iteration,
            start_time: now,
            end_time: None,
            duration_ms: None,
        });
        self.total_iterations += 1;
    }

    /// Milliseconds since `iteration` started; zero when it never started
    pub fn elapsed_ms(&self, iteration: u32, now: DateTime<Utc>) -> u64 {
        self.iteration_timings
            .iter()
            .find(|t| t.iteration == iteration)
            .map_or(0, |t| (now - t.start_time).num_milliseconds().max(0) as u64)
    }

    /// Record the end of an iteration, returning its duration in milliseconds
    pub fn end_iteration(&mut self, iteration: u32, success: bool, now: DateTime<Utc>) -> u64 {
        debug!(iteration, success, "SessionStatistics::end_iteration: called");
        let duration_ms = match self.iteration_timings.iter_mut().find(|t| t.iteration == iteration) {
            Some(timing) => {
                let duration = (now - timing.start_time).num_milliseconds().max(0) as u64;
                timing.end_time = Some(now);
                timing.duration_ms = Some(duration);
                duration
            }
            None => {
                debug!(iteration, "SessionStatistics::end_iteration: no start recorded");
                self.iteration_timings.push(IterationTiming {
                    iteration,
                    start_time: now,
                    end_time: Some(now),
                    duration_ms: Some(0),
                });
                self.total_iterations += 1;
                0
            }
        };

        self.completed_iterations += 1;
        if success {
            self.successful_iterations += 1;
        } else {
            self.failed_iterations += 1;
        }
        self.total_duration_ms += duration_ms;
        self.average_duration_ms = self.total_duration_ms / u64::from(self.completed_iterations);
        self.success_rate = f64::from(self.successful_iterations) / f64::from(self.completed_iterations) * 100.0;
        duration_ms
    }
}

/// Status of one task execution in parallel mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskExecutionStatus {
    /// Completed or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A task execution tracked while its group is live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTaskExecution {
    pub task_id: String,
    pub task_title: String,
    pub task_index: usize,
    pub status: TaskExecutionStatus,
    /// Process registry id the agent runs under
    pub process_id: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Persisted state of one execution group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionGroupState {
    pub group_index: usize,
    /// Task ids in the group
    pub task_executions: Vec<String>,
    #[serde(default)]
    pub is_complete: bool,
}

/// Optional parallel-execution sub-state of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelSessionState {
    pub is_parallel_mode: bool,
    pub current_group_index: usize,
    pub execution_groups: Vec<ExecutionGroupState>,
    #[serde(default)]
    pub active_executions: Vec<ActiveTaskExecution>,
    pub max_concurrent_tasks: usize,
}

impl ParallelSessionState {
    fn execution_mut(&mut self, task_id: &str) -> Option<&mut ActiveTaskExecution> {
        self.active_executions.iter_mut().find(|e| e.task_id == task_id)
    }

    /// Look up an execution by task id
    pub fn execution(&self, task_id: &str) -> Option<&ActiveTaskExecution> {
        self.active_executions.iter().find(|e| e.task_id == task_id)
    }
}

/// The persisted orchestration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub current_iteration: u32,
    pub total_iterations: u32,
    pub current_task_index: usize,
    pub status: SessionStatus,
    pub elapsed_time_seconds: u64,
    #[serde(default)]
    pub statistics: SessionStatistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_state: Option<ParallelSessionState>,
}

impl Session {
    /// Create a new running session
    pub fn new(total_iterations: u32) -> Self {
        let now = Utc::now();
        let id = Uuid::now_v7().to_string();
        debug!(%id, total_iterations, "Session::new: called");
        Self {
            id,
            start_time: now,
            last_update_time: now,
            current_iteration: 0,
            total_iterations,
            current_task_index: 0,
            status: SessionStatus::Running,
            elapsed_time_seconds: 0,
            statistics: SessionStatistics::default(),
            parallel_state: None,
        }
    }

    /// A session is resumable while running, paused or stopped
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Running | SessionStatus::Paused | SessionStatus::Stopped
        )
    }

    /// Iterations left in the budget
    pub fn remaining_iterations(&self) -> u32 {
        self.total_iterations.saturating_sub(self.current_iteration)
    }

    /// Refresh the update time and elapsed counter
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_update_time = now;
        self.elapsed_time_seconds = (now - self.start_time).num_seconds().max(0) as u64;
    }

    /// Record an iteration start (idempotent per iteration number)
    pub fn record_iteration_start(&mut self, iteration: u32) {
        self.current_iteration = iteration;
        self.statistics.start_iteration(iteration, Utc::now());
        self.touch();
    }

    /// Record an iteration end, returning its duration
    pub fn record_iteration_end(&mut self, iteration: u32, success: bool) -> u64 {
        let duration = self.statistics.end_iteration(iteration, success, Utc::now());
        self.touch();
        duration
    }

    // === Parallel sub-state ===

    /// Enable parallel mode with the given execution groups (task ids per group)
    pub fn enable_parallel_mode(&mut self, groups: Vec<Vec<String>>, max_concurrent_tasks: usize) {
        debug!(groups = groups.len(), max_concurrent_tasks, "Session::enable_parallel_mode: called");
        self.parallel_state = Some(ParallelSessionState {
            is_parallel_mode: true,
            current_group_index: 0,
            execution_groups: groups
                .into_iter()
                .enumerate()
                .map(|(group_index, task_executions)| ExecutionGroupState {
                    group_index,
                    task_executions,
                    is_complete: false,
                })
                .collect(),
            active_executions: Vec::new(),
            max_concurrent_tasks,
        });
        self.touch();
    }

    /// Drop the parallel sub-state, leaving iteration counters untouched
    pub fn disable_parallel_mode(&mut self) {
        debug!("Session::disable_parallel_mode: called");
        self.parallel_state = None;
        self.touch();
    }

    /// Mark a group as the current one
    pub fn start_parallel_group(&mut self, group_index: usize) -> bool {
        debug!(group_index, "Session::start_parallel_group: called");
        let Some(state) = self.parallel_state.as_mut() else {
            return false;
        };
        if group_index >= state.execution_groups.len() {
            debug!(group_index, "Session::start_parallel_group: group out of range");
            return false;
        }
        state.current_group_index = group_index;
        state.execution_groups[group_index].is_complete = false;
        self.touch();
        true
    }

    /// Mark a group complete and retire its terminal executions
    pub fn complete_parallel_group(&mut self, group_index: usize) -> bool {
        debug!(group_index, "Session::complete_parallel_group: called");
        let Some(state) = self.parallel_state.as_mut() else {
            return false;
        };
        let Some(group) = state.execution_groups.get_mut(group_index) else {
            return false;
        };
        group.is_complete = true;
        let members = group.task_executions.clone();
        state
            .active_executions
            .retain(|e| !(members.contains(&e.task_id) && e.status.is_terminal()));
        self.touch();
        true
    }

    /// Record a task execution as running
    pub fn start_task_execution(&mut self, task_id: &str, task_title: &str, task_index: usize) -> bool {
        debug!(%task_id, task_index, "Session::start_task_execution: called");
        let Some(state) = self.parallel_state.as_mut() else {
            return false;
        };
        match state.execution_mut(task_id) {
            Some(existing) => {
                existing.status = TaskExecutionStatus::Running;
                existing.last_error = None;
            }
            None => state.active_executions.push(ActiveTaskExecution {
                task_id: task_id.to_string(),
                task_title: task_title.to_string(),
                task_index,
                status: TaskExecutionStatus::Running,
                process_id: task_id.to_string(),
                retry_count: 0,
                last_error: None,
            }),
        }
        self.touch();
        true
    }

    /// Record a task execution as completed; a second completion is ignored
    pub fn complete_task_execution(&mut self, task_id: &str) -> bool {
        self.finish_task_execution(task_id, TaskExecutionStatus::Completed, None)
    }

    /// Record a task execution as failed; ignored if already terminal
    pub fn fail_task_execution(&mut self, task_id: &str, error: &str) -> bool {
        self.finish_task_execution(task_id, TaskExecutionStatus::Failed, Some(error.to_string()))
    }

    fn finish_task_execution(&mut self, task_id: &str, status: TaskExecutionStatus, error: Option<String>) -> bool {
        debug!(%task_id, ?status, "Session::finish_task_execution: called");
        let Some(execution) = self.parallel_state.as_mut().and_then(|s| s.execution_mut(task_id)) else {
            debug!(%task_id, "Session::finish_task_execution: unknown execution");
            return false;
        };
        if execution.status.is_terminal() {
            debug!(%task_id, "Session::finish_task_execution: already terminal, ignoring");
            return false;
        }
        execution.status = status;
        execution.last_error = error;
        self.touch();
        true
    }

    /// Record a retry of a task execution
    pub fn retry_task_execution(&mut self, task_id: &str, error: &str) -> bool {
        debug!(%task_id, "Session::retry_task_execution: called");
        let Some(execution) = self.parallel_state.as_mut().and_then(|s| s.execution_mut(task_id)) else {
            return false;
        };
        if execution.status.is_terminal() {
            return false;
        }
        execution.retry_count += 1;
        execution.status = TaskExecutionStatus::Running;
        execution.last_error = Some(error.to_string());
        self.touch();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_start_iteration_is_idempotent() {
        let mut stats = SessionStatistics::default();
        let t0 = Utc::now();
        stats.start_iteration(1, t0);
        stats.start_iteration(1, t0 + Duration::seconds(5));
        assert_eq!(stats.iteration_timings.len(), 1);
        assert_eq!(stats.total_iterations, 1);
        assert_eq!(stats.iteration_timings[0].start_time, t0 + Duration::seconds(5));
    }

    #[test]
    fn test_elapsed_ms_leaves_statistics_untouched() {
        let mut stats = SessionStatistics::default();
        let t0 = Utc::now();
        assert_eq!(stats.elapsed_ms(1, t0), 0);
        stats.start_iteration(1, t0);
        assert_eq!(stats.elapsed_ms(1, t0 + Duration::milliseconds(250)), 250);
        assert_eq!(stats.completed_iterations, 0);
        assert_eq!(stats.iteration_timings[0].end_time, None);
    }

    #[test]
    fn test_end_iteration_derives_average_and_rate() {
        let mut stats = SessionStatistics::default();
        let t0 = Utc::now();
        stats.start_iteration(1, t0);
        assert_eq!(stats.end_iteration(1, true, t0 + Duration::milliseconds(1000)), 1000);
        stats.start_iteration(2, t0);
        assert_eq!(stats.end_iteration(2, false, t0 + Duration::milliseconds(3000)), 3000);

        assert_eq!(stats.completed_iterations, 2);
        assert_eq!(stats.successful_iterations, 1);
        assert_eq!(stats.failed_iterations, 1);
        assert_eq!(stats.total_duration_ms, 4000);
        assert_eq!(stats.average_duration_ms, 2000);
        assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_end_iteration_without_start() {
        let mut stats = SessionStatistics::default();
        assert_eq!(stats.end_iteration(4, true, Utc::now()), 0);
        assert_eq!(stats.iteration_timings.len(), 1);
        assert_eq!(stats.successful_iterations, 1);
    }

    #[test]
    fn test_resumable_statuses() {
        let mut session = Session::new(10);
        for (status, resumable) in [
            (SessionStatus::Running, true),
            (SessionStatus::Paused, true),
            (SessionStatus::Stopped, true),
            (SessionStatus::Completed, false),
            (SessionStatus::Error, false),
        ] {
            session.status = status;
            assert_eq!(session.is_resumable(), resumable, "{status}");
        }
    }

    #[test]
    fn test_remaining_iterations() {
        let mut session = Session::new(10);
        session.current_iteration = 3;
        assert_eq!(session.remaining_iterations(), 7);
        session.current_iteration = 12;
        assert_eq!(session.remaining_iterations(), 0);
    }

    #[test]
    fn test_parallel_mode_toggle_keeps_counters() {
        let mut session = Session::new(5);
        session.record_iteration_start(1);
        session.record_iteration_end(1, true);
        session.enable_parallel_mode(vec![vec!["a".into(), "c".into()], vec!["b".into()]], 2);
        assert!(session.parallel_state.as_ref().unwrap().is_parallel_mode);
        session.disable_parallel_mode();
        assert!(session.parallel_state.is_none());
        assert_eq!(session.statistics.completed_iterations, 1);
        assert_eq!(session.current_iteration, 1);
    }

    #[test]
    fn test_duplicate_completion_is_ignored() {
        let mut session = Session::new(5);
        session.enable_parallel_mode(vec![vec!["a".into()]], 1);
        assert!(session.start_parallel_group(0));
        assert!(session.start_task_execution("a", "Task A", 0));
        assert!(session.complete_task_execution("a"));
        assert!(!session.complete_task_execution("a"));
        assert!(!session.fail_task_execution("a", "late failure"));

        let state = session.parallel_state.as_ref().unwrap();
        let exec = state.execution("a").unwrap();
        assert_eq!(exec.status, TaskExecutionStatus::Completed);
        assert_eq!(exec.last_error, None);
    }

    #[test]
    fn test_retry_and_fail_task_execution() {
        let mut session = Session::new(5);
        session.enable_parallel_mode(vec![vec!["a".into()]], 1);
        session.start_task_execution("a", "Task A", 0);
        assert!(session.retry_task_execution("a", "exit code 1"));
        assert!(session.fail_task_execution("a", "gave up"));
        let exec = session.parallel_state.as_ref().unwrap().execution("a").unwrap().clone();
        assert_eq!(exec.retry_count, 1);
        assert_eq!(exec.status, TaskExecutionStatus::Failed);
        assert_eq!(exec.last_error.as_deref(), Some("gave up"));
    }

    #[test]
    fn test_complete_group_retires_terminal_executions() {
        let mut session = Session::new(5);
        session.enable_parallel_mode(vec![vec!["a".into(), "c".into()], vec!["b".into()]], 2);
        session.start_parallel_group(0);
        session.start_task_execution("a", "A", 0);
        session.start_task_execution("c", "C", 2);
        session.complete_task_execution("a");
        session.fail_task_execution("c", "boom");
        assert!(session.complete_parallel_group(0));

        let state = session.parallel_state.as_ref().unwrap();
        assert!(state.execution_groups[0].is_complete);
        assert!(state.active_executions.is_empty());
    }

    #[test]
    fn test_parallel_ops_without_parallel_mode() {
        let mut session = Session::new(5);
        assert!(!session.start_parallel_group(0));
        assert!(!session.start_task_execution("a", "A", 0));
        assert!(!session.complete_task_execution("a"));
    }
}
