//! Parallel mode: execution groups run on a bounded agent pool
//!
//! Group N+1 is never started before every task dispatched from group N is
//! completed or failed. Each group counts as one iteration.

use std::collections::{HashSet, VecDeque};

use eyre::{Context, Result, eyre};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::SessionOutcome;
use super::core::{Orchestrator, RunState};
use crate::agent::AgentRunResult;
use crate::domain::{IterationLog, IterationStatus, TaskList};
use crate::feedback::blocks_completion;
use crate::notify::{self, NotifyEvent};
use crate::scheduler::{ExecutionGroup, compute_execution_groups};

/// Validate the dependency graph; parallel mode never starts on a bad one
pub(super) fn check_graph(list: &TaskList) -> Result<Vec<ExecutionGroup>> {
    compute_execution_groups(list).map_err(|errors| {
        let joined = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        eyre!("Invalid task dependencies: {}", joined)
    })
}

/// A task ready to hand to an agent
struct Dispatch {
    key: String,
    title: String,
    index: usize,
    prompt: String,
}

/// How a group's dispatched tasks ended
#[derive(Default)]
struct GroupRun {
    succeeded: Vec<String>,
    failed: Vec<String>,
    retries: u32,
    fatal: bool,
    aborted: bool,
}

impl Orchestrator {
    pub(super) async fn run_parallel(&mut self, state: &mut RunState) -> Result<SessionOutcome> {
        if self.config.branch.enabled {
            warn!("Orchestrator: branch mode is not applied in parallel mode");
            state
                .emitter
                .warning("branch", "branch mode is not applied in parallel mode");
        }

        let list = self.load_tasks().await?;
        let groups = check_graph(&list)?;
        let start_group = match &state.session.parallel_state {
            // Never past a group that still has open work, whatever the stored index says
            Some(p) if p.is_parallel_mode && p.execution_groups.len() == groups.len() => {
                let first_open = groups
                    .iter()
                    .position(|g| g.task_ids.iter().any(|key| list.get(key).is_some_and(|t| !t.done)))
                    .unwrap_or(groups.len());
                p.current_group_index.min(first_open)
            }
            _ => {
                let ids = groups.iter().map(|g| g.task_ids.clone()).collect();
                self.sessions
                    .enable_parallel_mode(&mut state.session, ids, state.max_concurrent)?;
                0
            }
        };
        info!(groups = groups.len(), start_group, max_concurrent = state.max_concurrent, "Orchestrator::run_parallel: called");

        state.controller.start();

        for group in groups.iter().skip(start_group) {
            if let Some(outcome) = self.check_control(state).await? {
                return Ok(outcome);
            }

            let list = self.load_tasks().await?;
            let pending: Vec<&String> = group
                .task_ids
                .iter()
                .filter(|key| list.get(key).is_some_and(|t| !t.done))
                .collect();
            if pending.is_empty() {
                debug!(group = group.index, "Orchestrator: group already done, skipping");
                continue;
            }

            let iteration = state.controller.absolute();
            self.sessions.record_iteration_start(&mut state.session, iteration)?;
            self.sessions.start_parallel_group(&mut state.session, group.index)?;
            state.emitter.iteration_started(iteration, None);
            state.emitter.parallel_group_started(group.index, &group.task_ids);
            info!(iteration, group = group.index, tasks = pending.len(), "Orchestrator: group started");

            let mut queue = VecDeque::new();
            let mut blocked = 0usize;
            for key in pending {
                let Some(index) = list.position_of(key) else {
                    continue;
                };
                let task = &list.tasks[index];
                // Earlier groups are finished, so an open dependency failed
                if let Some(dep) = task.deps().iter().find(|d| !list.get(d.as_str()).is_some_and(|t| t.done)) {
                    let reason = format!("blocked by unfinished dependency {}", dep);
                    warn!(task = %key, %dep, "Orchestrator: task blocked");
                    self.sessions
                        .start_task_execution(&mut state.session, key, &task.title, index)?;
                    self.sessions.fail_task_execution(&mut state.session, key, &reason)?;
                    state.emitter.parallel_task_completed(key, false, Some(&reason));
                    blocked += 1;
                    continue;
                }
                let prompt = self.iteration_prompt(&list, Some((task, index)), true, state.verification_failure.clone())?;
                queue.push_back(Dispatch {
                    key: key.clone(),
                    title: task.title.clone(),
                    index,
                    prompt,
                });
            }

            let mut run = self.run_group(state, group.index, queue, iteration).await?;

            let mut status = if run.failed.is_empty() && blocked == 0 {
                IterationStatus::Completed
            } else {
                IterationStatus::Failed
            };
            let mut log = IterationLog::new(iteration, status).with_retry_count(run.retries);

            if !run.succeeded.is_empty() && !run.fatal && !run.aborted {
                let mut list = self.load_tasks().await?;
                let report = self
                    .verifier
                    .verify(iteration, state.skip_verification, &state.emitter)
                    .await;
                if let Some(report) = report {
                    log = log.with_verification(report.summary());
                    if blocks_completion(&report, list.is_complete()) {
                        let checks = report.failed_checks().join(", ");
                        warn!(iteration, %checks, "Orchestrator: verification failed, group tasks reopened");
                        for key in &run.succeeded {
                            if let Some(index) = list.position_of(key) {
                                list.tasks[index].done = false;
                            }
                        }
                        self.tasks.save(&list).await?;
                        state.verification_failure = report.failure_report();
                        let reason = format!("verification failed: {}", checks);
                        for key in std::mem::take(&mut run.succeeded) {
                            self.sessions.fail_task_execution(&mut state.session, &key, &reason)?;
                            state.emitter.parallel_task_completed(&key, false, Some(&reason));
                            run.failed.push(key);
                        }
                        status = IterationStatus::VerificationFailed;
                        notify::notify(
                            self.notifier.as_ref(),
                            NotifyEvent::VerificationFailed,
                            &state.project,
                            &format!("group {}: {} failed", group.index + 1, checks),
                        )
                        .await;
                    } else {
                        state.verification_failure = None;
                    }
                }
            }

            for key in &run.succeeded {
                self.sessions.complete_task_execution(&mut state.session, key)?;
                state.emitter.parallel_task_completed(key, true, None);
            }

            if run.fatal {
                status = IterationStatus::Fatal;
            } else if run.aborted {
                status = IterationStatus::Aborted;
            } else {
                self.sessions.complete_parallel_group(&mut state.session, group.index)?;
            }
            state
                .emitter
                .parallel_group_completed(group.index, run.succeeded.len(), run.failed.len() + blocked);
            log.status = status;
            self.end_iteration(state, log, status == IterationStatus::Completed)?;

            if run.fatal {
                state.controller.fail();
                return Ok(SessionOutcome::Fatal);
            }
            if run.aborted {
                return Ok(SessionOutcome::Stopped);
            }

            let list = self.load_tasks().await?;
            if list.is_complete() {
                return Ok(SessionOutcome::Complete);
            }
            if group.index + 1 == groups.len() {
                break;
            }
            let decision = state.controller.mark_iteration_complete(false, true);
            if let Some(outcome) = self.advance(state, decision).await? {
                return Ok(outcome);
            }
        }

        let list = self.load_tasks().await?;
        if list.is_complete() {
            return Ok(SessionOutcome::Complete);
        }
        let message = format!("{} task(s) failed or were blocked", list.pending_count());
        warn!(%message, "Orchestrator: parallel run finished with open tasks");
        state.message = Some(message);
        Ok(SessionOutcome::TasksFailed)
    }

    /// Dispatch `queue` with at most `max_concurrent` agents alive and wait for all of them
    async fn run_group(
        &mut self,
        state: &mut RunState,
        group_index: usize,
        mut queue: VecDeque<Dispatch>,
        iteration: u32,
    ) -> Result<GroupRun> {
        let mut set = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut run = GroupRun::default();

        loop {
            while set.len() < state.max_concurrent && !run.fatal && !state.abort.is_aborted() {
                let Some(task) = queue.pop_front() else {
                    break;
                };
                self.sessions
                    .start_task_execution(&mut state.session, &task.key, &task.title, task.index)?;
                state
                    .emitter
                    .parallel_task_started(group_index, &task.key, &task.title);
                debug!(task = %task.key, "Orchestrator: dispatching task");
                in_flight.insert(task.key.clone());
                let runner = state.runner.clone();
                set.spawn(async move {
                    let result = runner.run(&task.key, &task.prompt).await;
                    (task, result)
                });
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            let (task, result): (Dispatch, AgentRunResult) = joined.wrap_err("Parallel agent task panicked")?;
            in_flight.remove(&task.key);
            self.capture_learnings(&result, iteration);
            run.retries += result.retry_count;
            for retry in &result.retry_contexts {
                self.sessions
                    .retry_task_execution(&mut state.session, &task.key, &retry.error)?;
            }

            if result.is_fatal && !run.fatal {
                let message = result.error.clone().unwrap_or_else(|| "fatal agent error".to_string());
                error!(task = %task.key, %message, "Orchestrator: fatal error in parallel task, stopping group");
                state.emitter.error("agent", &message);
                state.message = Some(message);
                state.suggestion = result.suggestion.clone();
                run.fatal = true;
                for id in &in_flight {
                    self.registry.abort(id);
                }
            }

            if result.success {
                let mut list = self.load_tasks().await?;
                if result.is_complete && list.mark_done(&task.key) {
                    self.tasks.save(&list).await?;
                }
                if list.get(&task.key).is_some_and(|t| t.done) {
                    info!(task = %task.key, "Orchestrator: task completed");
                    run.succeeded.push(task.key);
                    continue;
                }
            }

            let reason = if result.success {
                "agent finished without completing the task".to_string()
            } else if result.aborted {
                "aborted".to_string()
            } else {
                result.error.clone().unwrap_or_else(|| "agent failed".to_string())
            };
            if result.aborted && !run.fatal {
                run.aborted = true;
            }
            warn!(task = %task.key, %reason, "Orchestrator: task failed");
            self.sessions
                .fail_task_execution(&mut state.session, &task.key, &reason)?;
            state
                .emitter
                .parallel_task_completed(&task.key, false, Some(&reason));
            run.failed.push(task.key);
        }

        if !queue.is_empty() {
            debug!(left = queue.len(), "Orchestrator: tasks left undispatched");
            if !run.fatal {
                run.aborted = true;
            }
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Task;

    #[test]
    fn test_check_graph_reports_every_problem() {
        let list = TaskList::new(
            "demo",
            vec![
                Task::new("A").with_id("a").with_deps(&["b"]),
                Task::new("B").with_id("b").with_deps(&["a"]),
                Task::new("C").with_id("c").with_deps(&["missing"]),
            ],
        );
        let err = check_graph(&list).unwrap_err().to_string();
        assert!(err.starts_with("Invalid task dependencies"));
        assert!(err.contains("missing"));
    }

    #[test]
    fn test_check_graph_groups() {
        let list = TaskList::new(
            "demo",
            vec![
                Task::new("A").with_id("a"),
                Task::new("B").with_id("b").with_deps(&["a"]),
                Task::new("C").with_id("c"),
            ],
        );
        let groups = check_graph(&list).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].task_ids, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(groups[1].task_ids, vec!["b".to_string()]);
    }
}
