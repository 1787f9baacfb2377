//! Session lifecycle and the standard (one task at a time) loop

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result, bail, eyre};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{OrchestratorHandle, RunOptions, RunSummary, SessionOutcome};
use crate::agent::{
    AbortSignal, AgentRunResult, AgentRunner, AgentSettings, DEFAULT_PROCESS_ID, ProcessRegistry, PromptContext,
    PromptLoader,
};
use crate::branch::{BranchWorkflow, TaskBranch};
use crate::config::Config;
use crate::domain::{IterationLog, IterationStatus, Session, SessionStatistics, SessionStatus, Task, TaskList};
use crate::events::{EventBus, EventEmitter, create_event_bus, spawn_event_logger};
use crate::feedback::{
    DecompositionRequest, LearningStore, MAX_DECOMPOSITIONS_PER_ITERATION, Verifier, apply_decomposition,
    blocks_completion, parse_decomposition,
};
use crate::iteration::{ControlHandle, DelayOutcome, IterationController, IterationDecision, LoopState};
use crate::notify::{self, Notifier, NotifyEvent};
use crate::session::{IterationLogStore, SessionStore};
use crate::stats::UsageStatsStore;
use crate::tasks::{JsonTaskFile, TaskSource};

/// How long to wait for the event logger to flush after the session ends
const LOGGER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one session carries while the loop runs
pub(super) struct RunState {
    pub session: Session,
    pub emitter: EventEmitter,
    pub controller: IterationController,
    pub abort: AbortSignal,
    pub runner: AgentRunner,
    pub project: String,
    pub skip_verification: bool,
    pub max_concurrent: usize,
    pub branch: Option<BranchWorkflow>,
    /// Failure report of the last gated iteration, fed into the next prompt
    pub verification_failure: Option<String>,
    pub iterations_run: u32,
    stats_at_start: SessionStatistics,
    pub message: Option<String>,
    pub suggestion: Option<String>,
}

/// Drives sessions over a task list
pub struct Orchestrator {
    pub(super) config: Config,
    pub(super) project_dir: PathBuf,
    state_dir: PathBuf,
    bus: Arc<EventBus>,
    pub(super) registry: Arc<ProcessRegistry>,
    control: ControlHandle,
    pub(super) tasks: Arc<dyn TaskSource>,
    pub(super) sessions: SessionStore,
    iteration_logs: IterationLogStore,
    prompts: PromptLoader,
    learning: LearningStore,
    pub(super) verifier: Verifier,
    pub(super) notifier: Box<dyn Notifier>,
    usage: Option<UsageStatsStore>,
}

impl Orchestrator {
    /// Orchestrator for the project in `project_dir`, paths resolved from `config`
    pub fn new(config: Config, project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let state_dir = project_dir.join(&config.paths.state_dir);
        debug!(?project_dir, ?state_dir, "Orchestrator::new: called");
        let registry = Arc::new(ProcessRegistry::new(Duration::from_millis(config.agent.force_kill_grace_ms)));
        Self {
            tasks: Arc::new(JsonTaskFile::new(project_dir.join(&config.paths.prd_file))),
            sessions: SessionStore::new(state_dir.clone()),
            iteration_logs: IterationLogStore::new(state_dir.clone()),
            prompts: PromptLoader::new(&state_dir),
            learning: LearningStore::open(&state_dir, config.learning.clone()),
            verifier: Verifier::new(&config.verification, project_dir.clone()),
            notifier: notify::from_config(config.notifications.command.as_deref()),
            usage: Some(UsageStatsStore::default_location()),
            bus: create_event_bus(),
            control: ControlHandle::new(),
            registry,
            config,
            project_dir,
            state_dir,
        }
    }

    pub fn with_task_source(mut self, tasks: Arc<dyn TaskSource>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Where usage statistics go; `None` disables them
    pub fn with_usage_stats(mut self, usage: Option<UsageStatsStore>) -> Self {
        self.usage = usage;
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle::new(self.registry.clone(), self.control.clone())
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn iteration_logs(&self) -> &IterationLogStore {
        &self.iteration_logs
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Start a fresh session, replacing any previous record
    pub async fn run(&mut self, options: RunOptions) -> Result<RunSummary> {
        info!(?options, "Orchestrator::run: called");
        let list = self.load_tasks().await?;
        let parallel = options.parallel.unwrap_or(self.config.parallel.enabled);
        if parallel {
            super::parallel::check_graph(&list)?;
        }
        let total = options.iterations.unwrap_or(self.config.loop_.max_iterations);
        if total == 0 {
            bail!("The iteration budget must be at least 1");
        }

        let branch = if parallel { None } else { self.init_branch_mode().await };
        let session = self.sessions.create(total).context("Failed to create session")?;
        if let Some(usage) = &self.usage {
            if let Err(e) = usage.record_session_start() {
                warn!(error = %e, "Orchestrator::run: failed to record usage");
            }
        }
        let controller = self.controller(total);
        let (state, logger) = self.begin(session, controller, &options, &list.project);
        state.emitter.session_started(total, parallel);
        self.drive(state, logger, parallel, branch).await
    }

    /// Continue the resumable session on disk
    ///
    /// `options.iterations` extends the budget by that many iterations.
    /// `options.parallel` overrides the session's mode; `Some(false)` drops
    /// its parallel state and continues one task at a time.
    pub async fn resume(&mut self, options: RunOptions) -> Result<RunSummary> {
        info!(?options, "Orchestrator::resume: called");
        let Some(mut session) = self.sessions.load_resumable()? else {
            bail!("No resumable session in {}", self.state_dir.display());
        };
        let list = self.load_tasks().await?;
        if let Some(extra) = options.iterations {
            session.total_iterations = session.current_iteration + extra;
        }
        let was_parallel = session.parallel_state.as_ref().is_some_and(|p| p.is_parallel_mode);
        let parallel = options.parallel.unwrap_or(was_parallel);
        if parallel {
            super::parallel::check_graph(&list)?;
        } else if was_parallel {
            info!(id = %session.id, "Orchestrator::resume: switching to sequential mode");
            self.sessions.disable_parallel_mode(&mut session)?;
        }

        let offset = session.current_iteration;
        let remaining = session.remaining_iterations();
        let branch = if parallel || remaining == 0 { None } else { self.init_branch_mode().await };
        self.sessions.update_status(&mut session, SessionStatus::Running)?;
        info!(id = %session.id, offset, remaining, parallel, "Orchestrator::resume: resuming session");

        let controller = self.controller(remaining).with_offset(offset);
        let (state, logger) = self.begin(session, controller, &options, &list.project);
        state.emitter.session_resumed(offset, remaining);
        if remaining == 0 {
            info!("Orchestrator::resume: no iterations left");
            return self.finish(state, logger, SessionOutcome::MaxIterations).await;
        }
        self.drive(state, logger, parallel, branch).await
    }

    fn controller(&self, total: u32) -> IterationController {
        IterationController::new(
            total,
            Duration::from_millis(self.config.loop_.iteration_delay_ms),
            Duration::from_millis(self.config.loop_.max_runtime_ms),
        )
        .with_control(self.control.clone())
    }

    fn begin(
        &self,
        session: Session,
        controller: IterationController,
        options: &RunOptions,
        project: &str,
    ) -> (RunState, JoinHandle<()>) {
        let emitter = self.bus.emitter_for(session.id.clone());
        let log_path = self.state_dir.join("events").join(format!("{}.jsonl", session.id));
        let logger = spawn_event_logger(&self.bus, log_path);
        let runner = AgentRunner::new(
            AgentSettings::from_config(&self.config, self.project_dir.clone()),
            self.registry.clone(),
            emitter.clone(),
        );
        let state = RunState {
            stats_at_start: session.statistics.clone(),
            session,
            emitter,
            controller,
            abort: self.registry.abort_signal(DEFAULT_PROCESS_ID),
            runner,
            project: project.to_string(),
            skip_verification: options.skip_verification,
            max_concurrent: options
                .max_concurrent
                .unwrap_or(self.config.parallel.max_concurrent_tasks)
                .max(1),
            branch: None,
            verification_failure: None,
            iterations_run: 0,
            message: None,
            suggestion: None,
        };
        (state, logger)
    }

    async fn drive(
        &mut self,
        mut state: RunState,
        logger: JoinHandle<()>,
        parallel: bool,
        branch: Option<Result<BranchWorkflow, String>>,
    ) -> Result<RunSummary> {
        match branch {
            Some(Ok(workflow)) => state.branch = Some(workflow),
            Some(Err(message)) => {
                warn!(%message, "Orchestrator: branch mode disabled for this session");
                state.emitter.warning("branch", &message);
            }
            None => {}
        }
        let result = if parallel {
            self.run_parallel(&mut state).await
        } else {
            self.run_standard(&mut state).await
        };
        match result {
            Ok(outcome) => self.finish(state, logger, outcome).await,
            Err(e) => {
                error!(error = %e, "Orchestrator: session ended with an error");
                state.emitter.error("session", &e.to_string());
                if let Err(save_err) = self.sessions.update_status(&mut state.session, SessionStatus::Error) {
                    warn!(error = %save_err, "Orchestrator: could not record the error status");
                }
                state.emitter.session_stopped(&format!("error: {}", e));
                let _ = tokio::time::timeout(LOGGER_FLUSH_TIMEOUT, logger).await;
                Err(e)
            }
        }
    }

    /// Check the repository for branch mode before any state file is written
    ///
    /// `None` when branch mode is off, `Err` with the reason it cannot be used.
    async fn init_branch_mode(&self) -> Option<Result<BranchWorkflow, String>> {
        if !self.config.branch.enabled {
            return None;
        }
        let mut workflow = BranchWorkflow::new(self.config.branch.clone(), self.project_dir.clone())
            .with_excluded(self.own_paths());
        let init = workflow.initialize().await;
        if init.is_valid {
            Some(Ok(workflow))
        } else {
            Some(Err(init.error.unwrap_or_else(|| "branch mode unavailable".to_string())))
        }
    }

    /// Files this tool writes inside the project, relative to the project dir
    ///
    /// They never count as uncommitted work and never land in task commits.
    fn own_paths(&self) -> Vec<String> {
        [&self.config.paths.state_dir, &self.config.paths.prd_file]
            .into_iter()
            .filter_map(|path| relative_to(path, &self.project_dir))
            .collect()
    }

    async fn finish(&mut self, mut state: RunState, logger: JoinHandle<()>, outcome: SessionOutcome) -> Result<RunSummary> {
        info!(id = %state.session.id, %outcome, iterations = state.iterations_run, "Orchestrator::finish: called");
        let status = match outcome {
            SessionOutcome::Complete => SessionStatus::Completed,
            SessionOutcome::Fatal => SessionStatus::Error,
            _ => SessionStatus::Stopped,
        };
        let last_iteration = state.session.current_iteration;
        let statistics = statistics_delta(&state.session.statistics, &state.stats_at_start);
        self.sessions.update_status(&mut state.session, status)?;

        let (tasks_done, tasks_total) = match self.tasks.load().await {
            Ok(Some(list)) => (list.done_count(), list.tasks.len()),
            _ => (0, 0),
        };

        match outcome {
            SessionOutcome::Stopped => state.emitter.session_stopped("stop requested"),
            _ => state.emitter.session_completed(outcome.as_str(), state.iterations_run),
        }

        let mut details = format!(
            "{} after {} iteration(s), {}/{} tasks done",
            outcome, state.iterations_run, tasks_done, tasks_total
        );
        if let Some(message) = &state.message {
            details.push_str(&format!(": {}", message));
        }
        notify::notify(self.notifier.as_ref(), outcome.notify_event(), &state.project, &details).await;

        if let Some(usage) = &self.usage {
            if let Err(e) = usage.record_session_end(&statistics, outcome == SessionOutcome::Complete) {
                warn!(error = %e, "Orchestrator::finish: failed to record usage");
            }
        }
        if self.learning.is_enabled() {
            if let Err(e) = self.learning.save() {
                warn!(error = %e, "Orchestrator::finish: failed to save learnings");
            }
        }
        if tokio::time::timeout(LOGGER_FLUSH_TIMEOUT, logger).await.is_err() {
            warn!("Orchestrator::finish: event logger did not finish in time");
        }

        Ok(RunSummary {
            session_id: state.session.id,
            outcome,
            iterations_run: state.iterations_run,
            last_iteration,
            tasks_done,
            tasks_total,
            message: state.message,
            suggestion: state.suggestion,
        })
    }

    // === Standard loop ===

    async fn run_standard(&mut self, state: &mut RunState) -> Result<SessionOutcome> {
        state.controller.start();
        let mut decompositions = 0u32;

        loop {
            if let Some(outcome) = self.check_control(state).await? {
                return Ok(outcome);
            }

            let list = self.load_tasks().await?;
            let Some(next) = list.next_task_with_index() else {
                info!("Orchestrator: every task is done");
                return Ok(SessionOutcome::Complete);
            };
            let task = list.tasks[next.index].clone();
            let iteration = state.controller.absolute();

            self.sessions.record_iteration_start(&mut state.session, iteration)?;
            self.sessions.set_current_task_index(&mut state.session, next.index)?;
            state.emitter.iteration_started(iteration, Some(&task.title));
            info!(iteration, task = %task.title, "Orchestrator: iteration started");

            let task_branch = match &state.branch {
                Some(workflow) => Some(workflow.start_task(next.index, &task.title).await),
                None => None,
            };

            let prompt = self.iteration_prompt(&list, Some((&task, next.index)), false, state.verification_failure.clone())?;
            let result = state.runner.run(DEFAULT_PROCESS_ID, &prompt).await;
            self.capture_learnings(&result, iteration);

            if result.aborted {
                info!(iteration, "Orchestrator: agent aborted");
                self.end_iteration(state, result_log(iteration, IterationStatus::Aborted, &result), false)?;
                return Ok(SessionOutcome::Stopped);
            }

            if result.is_fatal {
                let message = result.error.clone().unwrap_or_else(|| "fatal agent error".to_string());
                error!(iteration, %message, "Orchestrator: fatal agent error");
                state.emitter.error("agent", &message);
                state.message = Some(message);
                state.suggestion = result.suggestion.clone();
                self.end_iteration(state, result_log(iteration, IterationStatus::Fatal, &result), false)?;
                state.controller.fail();
                return Ok(SessionOutcome::Fatal);
            }

            if result.success {
                if let Some(parsed) = parse_decomposition(&result.text) {
                    match parsed {
                        Ok(request) if decompositions < MAX_DECOMPOSITIONS_PER_ITERATION => {
                            match self.decompose(state, &request).await {
                                Ok(()) => {
                                    decompositions += 1;
                                    let log = result_log(iteration, IterationStatus::Decomposed, &result)
                                        .with_task(&task.title, false)
                                        .with_decomposition(request.summary());
                                    self.end_iteration(state, log, true)?;
                                    continue;
                                }
                                Err(e) => {
                                    warn!(error = %e, "Orchestrator: decomposition rejected");
                                    state.emitter.warning("decomposition", &e.to_string());
                                }
                            }
                        }
                        Ok(request) => {
                            warn!(task = %request.original_task_title, "Orchestrator: decomposition limit reached");
                            state.emitter.warning(
                                "decomposition",
                                &format!(
                                    "iteration {} already restarted {} times; ignoring the request",
                                    iteration, decompositions
                                ),
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "Orchestrator: malformed decomposition request");
                            state.emitter.warning("decomposition", &e.to_string());
                        }
                    }
                }
            }
            decompositions = 0;

            let (list, log, success) = self.complete_iteration(state, &task, &result, iteration).await?;
            if log.task_was_completed {
                self.complete_branch(state, task_branch.as_ref(), &task.title).await;
            }
            self.end_iteration(state, log, success)?;

            let decision = state
                .controller
                .mark_iteration_complete(list.is_complete(), list.pending_count() > 0);
            if let Some(outcome) = self.advance(state, decision).await? {
                return Ok(outcome);
            }
        }
    }

    /// Evaluate a finished agent run: verification gating and task completion
    async fn complete_iteration(
        &mut self,
        state: &mut RunState,
        task: &Task,
        result: &AgentRunResult,
        iteration: u32,
    ) -> Result<(TaskList, IterationLog, bool)> {
        let mut list = self.load_tasks().await?;
        let key = task.key().to_string();

        if !result.success {
            let message = result.error.clone().unwrap_or_else(|| "agent failed".to_string());
            warn!(iteration, retries = result.retry_count, %message, "Orchestrator: agent failed");
            state.emitter.error("agent", &message);
            let log = result_log(iteration, IterationStatus::Failed, result).with_task(&task.title, false);
            return Ok((list, log, false));
        }

        let report = self
            .verifier
            .verify(iteration, state.skip_verification, &state.emitter)
            .await;
        let gated = report
            .as_ref()
            .is_some_and(|r| blocks_completion(r, list.is_complete()));
        let mut log = result_log(iteration, IterationStatus::Incomplete, result);
        if let Some(report) = &report {
            log = log.with_verification(report.summary());
        }

        if gated {
            let failed = report.as_ref().map(|r| r.failed_checks().join(", ")).unwrap_or_default();
            warn!(iteration, %failed, "Orchestrator: verification failed, task stays open");
            state.verification_failure = report.as_ref().and_then(|r| r.failure_report());
            if let Some(position) = list.position_of(&key) {
                if list.tasks[position].done {
                    list.tasks[position].done = false;
                    self.tasks.save(&list).await?;
                }
            }
            notify::notify(
                self.notifier.as_ref(),
                NotifyEvent::VerificationFailed,
                &state.project,
                &format!("iteration {}: {} failed", iteration, failed),
            )
            .await;
            log.status = IterationStatus::VerificationFailed;
            return Ok((list, log.with_task(&task.title, false), false));
        }

        state.verification_failure = None;
        if result.is_complete && list.mark_done(&key) {
            self.tasks.save(&list).await?;
        }
        let done = list.get(&key).is_some_and(|t| t.done);
        log.status = if done {
            IterationStatus::Completed
        } else {
            IterationStatus::Incomplete
        };
        Ok((list, log.with_task(&task.title, done), true))
    }

    async fn complete_branch(&self, state: &RunState, branch: Option<&TaskBranch>, title: &str) {
        let (Some(workflow), Some(branch)) = (&state.branch, branch) else {
            return;
        };
        if branch.outcome.is_error() {
            return;
        }
        let completion = workflow.complete_task(&branch.name, title).await;
        for (step, outcome) in [
            ("commit", &completion.commit),
            ("push", &completion.push),
            ("pull request", &completion.pull_request),
            ("return to base", &completion.return_to_base),
        ] {
            if outcome.is_error() {
                state
                    .emitter
                    .warning("branch", &format!("{} on {}: {}", step, branch.name, outcome.message()));
            }
        }
    }

    async fn decompose(&self, state: &RunState, request: &DecompositionRequest) -> Result<()> {
        let mut list = self.load_tasks().await?;
        let outcome = apply_decomposition(&mut list, request)?;
        self.tasks.save(&list).await?;
        state
            .emitter
            .task_decomposed(&request.original_task_title, outcome.subtask_keys.len());
        Ok(())
    }

    // === Shared helpers ===

    pub(super) async fn load_tasks(&self) -> Result<TaskList> {
        self.tasks
            .load()
            .await?
            .ok_or_else(|| eyre!("No task list found at {}", self.tasks.location()))
    }

    pub(super) fn iteration_prompt(
        &self,
        list: &TaskList,
        task: Option<(&Task, usize)>,
        parallel: bool,
        verification_failure: Option<String>,
    ) -> Result<String> {
        let mut context = PromptContext::new(list, self.config.paths.prd_file.display().to_string());
        if let Some((task, index)) = task {
            context = context.with_task(task, index);
        }
        let context = context
            .with_parallel(parallel)
            .with_learnings(self.learning.render())
            .with_verification_failure(verification_failure);
        self.prompts.iteration_prompt(&context)
    }

    pub(super) fn capture_learnings(&mut self, result: &AgentRunResult, iteration: u32) {
        if !self.learning.is_enabled() {
            return;
        }
        let added =
            self.learning.capture(&result.text, iteration) + self.learning.record_failures(&result.retry_contexts, iteration);
        if added > 0 {
            if let Err(e) = self.learning.save() {
                warn!(error = %e, "Orchestrator: failed to save learnings");
            }
        }
    }

    /// Close an iteration: session statistics, iteration log, event
    pub(super) fn end_iteration(&self, state: &mut RunState, log: IterationLog, success: bool) -> Result<()> {
        let iteration = log.iteration;
        // A decomposed iteration restarts under the same number and is counted once, when it really ends
        let duration_ms = if log.status == IterationStatus::Decomposed {
            state.session.statistics.elapsed_ms(iteration, chrono::Utc::now())
        } else {
            self.sessions
                .record_iteration_end(&mut state.session, iteration, success)?
        };
        let log = log.with_duration_ms(duration_ms);
        if let Err(e) = self.iteration_logs.append(&state.session.id, &log) {
            warn!(iteration, error = %e, "Orchestrator: failed to append iteration log");
        }
        if log.status != IterationStatus::Decomposed {
            state.iterations_run += 1;
        }
        info!(iteration, status = %log.status, duration_ms, "Orchestrator: iteration finished");
        state.emitter.iteration_completed(iteration, log.status);
        Ok(())
    }

    /// Act on the controller's decision; `Some` ends the session
    pub(super) async fn advance(
        &self,
        state: &mut RunState,
        decision: IterationDecision,
    ) -> Result<Option<SessionOutcome>> {
        let delay = match decision {
            IterationDecision::AllComplete => return Ok(Some(SessionOutcome::Complete)),
            IterationDecision::MaxIterations => return Ok(Some(SessionOutcome::MaxIterations)),
            IterationDecision::MaxRuntime => return Ok(Some(SessionOutcome::MaxRuntime)),
            IterationDecision::Continue { delay, .. } => delay,
        };

        state
            .emitter
            .iteration_delay(state.controller.absolute() + 1, delay.as_millis() as u64);
        match state.controller.wait_for_next(delay, &state.abort).await {
            DelayOutcome::Elapsed => {}
            DelayOutcome::Paused => {
                if !self.wait_while_paused(state).await? {
                    return Ok(Some(SessionOutcome::Stopped));
                }
            }
            DelayOutcome::Stopped | DelayOutcome::Aborted => return Ok(Some(SessionOutcome::Stopped)),
        }

        if state.controller.next().is_some() {
            return Ok(None);
        }
        let outcome = match state.controller.state() {
            LoopState::MaxRuntime => SessionOutcome::MaxRuntime,
            LoopState::MaxIterations => SessionOutcome::MaxIterations,
            _ => SessionOutcome::Stopped,
        };
        Ok(Some(outcome))
    }

    /// Honour a pause or stop requested while an agent was running
    pub(super) async fn check_control(&self, state: &mut RunState) -> Result<Option<SessionOutcome>> {
        if state.abort.is_aborted() {
            return Ok(Some(SessionOutcome::Stopped));
        }
        match state.controller.control_outcome() {
            None | Some(DelayOutcome::Elapsed) => Ok(None),
            Some(DelayOutcome::Paused) => {
                if self.wait_while_paused(state).await? {
                    Ok(None)
                } else {
                    Ok(Some(SessionOutcome::Stopped))
                }
            }
            Some(DelayOutcome::Stopped | DelayOutcome::Aborted) => Ok(Some(SessionOutcome::Stopped)),
        }
    }

    async fn wait_while_paused(&self, state: &mut RunState) -> Result<bool> {
        let iteration = state.controller.absolute();
        self.sessions.update_status(&mut state.session, SessionStatus::Paused)?;
        state.emitter.session_paused(iteration);
        info!(iteration, "Orchestrator: paused");
        let resumed = state.controller.wait_resumed(&state.abort).await;
        if resumed {
            self.sessions.update_status(&mut state.session, SessionStatus::Running)?;
        }
        Ok(resumed)
    }
}

/// Iteration log pre-filled from an agent result
pub(super) fn result_log(iteration: u32, status: IterationStatus, result: &AgentRunResult) -> IterationLog {
    IterationLog::new(iteration, status)
        .with_exit_code(result.exit_code)
        .with_retry_count(result.retry_count)
        .with_output_length(result.output.len())
        .with_retry_contexts(result.retry_contexts.clone())
}

/// `path` as a git pathspec relative to `base`; `None` when it lies outside
fn relative_to(path: &Path, base: &Path) -> Option<String> {
    let relative = if path.is_absolute() {
        path.strip_prefix(base).ok()?
    } else {
        path
    };
    let relative = relative.to_string_lossy().trim_start_matches("./").to_string();
    (!relative.is_empty()).then_some(relative)
}

/// Statistics accumulated since `start`, so a resumed session is not counted twice
fn statistics_delta(now: &SessionStatistics, start: &SessionStatistics) -> SessionStatistics {
    SessionStatistics {
        total_iterations: now.total_iterations,
        completed_iterations: now.completed_iterations.saturating_sub(start.completed_iterations),
        failed_iterations: now.failed_iterations.saturating_sub(start.failed_iterations),
        successful_iterations: now.successful_iterations.saturating_sub(start.successful_iterations),
        total_duration_ms: now.total_duration_ms.saturating_sub(start.total_duration_ms),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_delta_subtracts_earlier_runs() {
        let start = SessionStatistics {
            completed_iterations: 3,
            successful_iterations: 2,
            failed_iterations: 1,
            total_duration_ms: 300,
            ..Default::default()
        };
        let now = SessionStatistics {
            completed_iterations: 5,
            successful_iterations: 4,
            failed_iterations: 1,
            total_duration_ms: 500,
            ..Default::default()
        };
        let delta = statistics_delta(&now, &start);
        assert_eq!(delta.completed_iterations, 2);
        assert_eq!(delta.successful_iterations, 2);
        assert_eq!(delta.failed_iterations, 0);
        assert_eq!(delta.total_duration_ms, 200);
    }

    #[test]
    fn test_relative_to_project() {
        let base = Path::new("/work/project");
        assert_eq!(relative_to(Path::new(".ralphloop"), base).as_deref(), Some(".ralphloop"));
        assert_eq!(relative_to(Path::new("./prd.json"), base).as_deref(), Some("prd.json"));
        assert_eq!(
            relative_to(Path::new("/work/project/state/run"), base).as_deref(),
            Some("state/run")
        );
        assert_eq!(relative_to(Path::new("/elsewhere/state"), base), None);
        assert_eq!(relative_to(Path::new("/work/project"), base), None);
    }

    #[test]
    fn test_result_log_copies_agent_fields() {
        let result = AgentRunResult {
            exit_code: Some(0),
            output: "abc".to_string(),
            retry_count: 2,
            ..Default::default()
        };
        let log = result_log(4, IterationStatus::Incomplete, &result);
        assert_eq!(log.iteration, 4);
        assert_eq!(log.retry_count, 2);
        assert_eq!(log.output_length, 3);
        assert!(log.retry_contexts.is_none());
    }
}
