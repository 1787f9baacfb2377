//! Iteration loop controller
//!
//! Drives `idle -> running -> {paused <-> running} -> {complete | max_iterations | max_runtime | stopped | error}`.
//! The controller does not call back into the orchestrator: every transition
//! returns what happened and the caller reacts (emits events, saves the session).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::agent::AbortSignal;

/// Where the loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running,
    Paused,
    Complete,
    MaxIterations,
    MaxRuntime,
    Stopped,
    Error,
}

impl LoopState {
    /// No further iteration will run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::MaxIterations | Self::MaxRuntime | Self::Stopped | Self::Error
        )
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::MaxIterations => "max_iterations",
            Self::MaxRuntime => "max_runtime",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// What [`IterationController::mark_iteration_complete`] decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationDecision {
    AllComplete,
    MaxIterations,
    MaxRuntime,
    /// Run `next` after waiting `delay`
    Continue { next: u32, delay: Duration },
}

/// How the inter-iteration wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    Elapsed,
    /// Position kept; the caller resumes and calls `next()` itself
    Paused,
    Stopped,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop,
}

/// Pause / resume / stop requests from outside the loop
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: watch::Sender<Control>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    /// Handle that exists before any controller; attach with [`IterationController::with_control`]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Control::Run);
        Self { tx }
    }

    pub fn pause(&self) {
        debug!("ControlHandle::pause: called");
        self.tx.send_if_modified(|c| {
            let changed = *c == Control::Run;
            if changed {
                *c = Control::Pause;
            }
            changed
        });
    }

    pub fn resume(&self) {
        debug!("ControlHandle::resume: called");
        self.tx.send_if_modified(|c| {
            let changed = *c == Control::Pause;
            if changed {
                *c = Control::Run;
            }
            changed
        });
    }

    pub fn stop(&self) {
        debug!("ControlHandle::stop: called");
        self.tx.send_replace(Control::Stop);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow() == Control::Pause
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow() == Control::Stop
    }
}

/// Iteration counter and budget enforcement
pub struct IterationController {
    /// Iterations already run before this controller (resume)
    offset: u32,
    current: u32,
    total: u32,
    delay: Duration,
    max_runtime: Option<Duration>,
    started_at: Option<Instant>,
    state: LoopState,
    control_tx: watch::Sender<Control>,
    control_rx: watch::Receiver<Control>,
}

impl IterationController {
    /// `total` iterations, `delay` between them; a zero `max_runtime` disables the runtime budget
    pub fn new(total: u32, delay: Duration, max_runtime: Duration) -> Self {
        debug!(total, ?delay, ?max_runtime, "IterationController::new: called");
        let (control_tx, control_rx) = watch::channel(Control::Run);
        Self {
            offset: 0,
            current: 0,
            total,
            delay,
            max_runtime: (!max_runtime.is_zero()).then_some(max_runtime),
            started_at: None,
            state: LoopState::Idle,
            control_tx,
            control_rx,
        }
    }

    /// Number iterations after `offset` already completed ones (resume)
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Drive this controller from an existing handle
    pub fn with_control(mut self, handle: ControlHandle) -> Self {
        self.control_rx = handle.tx.subscribe();
        self.control_tx = handle.tx;
        self
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Iteration number within this run, 1-based once started
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Iteration number across resumes
    pub fn absolute(&self) -> u32 {
        self.offset + self.current
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Begin the run; returns the first iteration number
    pub fn start(&mut self) -> u32 {
        info!(total = self.total, offset = self.offset, "IterationController::start: called");
        self.current = 1;
        self.started_at = Some(Instant::now());
        self.state = LoopState::Running;
        self.current
    }

    /// Advance to the next iteration
    ///
    /// Only valid while running; returns `None` when the budget is spent or
    /// the loop has stopped.
    pub fn next(&mut self) -> Option<u32> {
        debug!(current = self.current, state = %self.state, "IterationController::next: called");
        if self.state != LoopState::Running {
            return None;
        }
        if self.runtime_exceeded() {
            self.state = LoopState::MaxRuntime;
            return None;
        }
        if self.current >= self.total {
            self.state = LoopState::MaxIterations;
            return None;
        }
        self.current += 1;
        Some(self.current)
    }

    /// Decide what follows the iteration that just finished
    pub fn mark_iteration_complete(&mut self, is_project_complete: bool, has_pending_tasks: bool) -> IterationDecision {
        debug!(
            current = self.current,
            is_project_complete, has_pending_tasks, "IterationController::mark_iteration_complete: called"
        );
        if is_project_complete {
            info!(iteration = self.current, "IterationController: all tasks complete");
            self.state = LoopState::Complete;
            return IterationDecision::AllComplete;
        }
        if self.current >= self.total {
            info!(iteration = self.current, "IterationController: iteration budget spent");
            self.state = LoopState::MaxIterations;
            return IterationDecision::MaxIterations;
        }
        if self.runtime_exceeded() {
            info!(elapsed_ms = self.elapsed().as_millis() as u64, "IterationController: runtime budget spent");
            self.state = LoopState::MaxRuntime;
            return IterationDecision::MaxRuntime;
        }
        // The delay never outlasts the runtime budget
        let delay = self.remaining_runtime().map_or(self.delay, |left| self.delay.min(left));
        IterationDecision::Continue {
            next: self.current + 1,
            delay,
        }
    }

    pub fn runtime_exceeded(&self) -> bool {
        match (self.max_runtime, self.started_at) {
            (Some(max), Some(started)) => started.elapsed() >= max,
            _ => false,
        }
    }

    /// Time left before the runtime budget runs out
    pub fn remaining_runtime(&self) -> Option<Duration> {
        let max = self.max_runtime?;
        Some(max.saturating_sub(self.elapsed()))
    }

    /// Wait out the inter-iteration delay
    ///
    /// Cancelled by pause, stop or abort. A pause leaves the position
    /// unchanged; the pending wait is simply dropped.
    pub async fn wait_for_next(&mut self, delay: Duration, abort: &AbortSignal) -> DelayOutcome {
        debug!(?delay, "IterationController::wait_for_next: called");
        if let Some(outcome) = self.control_outcome() {
            return outcome;
        }
        let mut rx = self.control_rx.clone();
        let outcome = tokio::select! {
            _ = tokio::time::sleep(delay) => DelayOutcome::Elapsed,
            _ = abort.cancelled() => DelayOutcome::Aborted,
            changed = async { rx.wait_for(|c| *c != Control::Run).await.map(|c| *c) } => match changed {
                Ok(Control::Pause) => DelayOutcome::Paused,
                _ => DelayOutcome::Stopped,
            },
        };
        self.apply(outcome);
        outcome
    }

    /// Block while paused; true when the loop may continue
    pub async fn wait_resumed(&mut self, abort: &AbortSignal) -> bool {
        debug!("IterationController::wait_resumed: called");
        let mut rx = self.control_rx.clone();
        let resumed = tokio::select! {
            changed = async { rx.wait_for(|c| *c != Control::Pause).await.map(|c| *c) } => matches!(changed, Ok(Control::Run)),
            _ = abort.cancelled() => false,
        };
        if resumed {
            info!(iteration = self.current, "IterationController: resumed");
            self.state = LoopState::Running;
        } else {
            self.state = LoopState::Stopped;
        }
        resumed
    }

    /// Pause or stop requested since the last check
    pub fn control_outcome(&mut self) -> Option<DelayOutcome> {
        let control = *self.control_rx.borrow();
        let outcome = match control {
            Control::Run => return None,
            Control::Pause => DelayOutcome::Paused,
            Control::Stop => DelayOutcome::Stopped,
        };
        self.apply(outcome);
        Some(outcome)
    }

    pub fn pause(&mut self) {
        self.control().pause();
        if self.state == LoopState::Running {
            self.state = LoopState::Paused;
        }
    }

    /// Clear a pause; does not advance, the caller calls [`Self::next`]
    pub fn resume(&mut self) {
        self.control().resume();
        if self.state == LoopState::Paused {
            self.state = LoopState::Running;
        }
    }

    pub fn stop(&mut self) {
        self.control().stop();
        if !self.state.is_terminal() {
            self.state = LoopState::Stopped;
        }
    }

    pub fn fail(&mut self) {
        self.state = LoopState::Error;
    }

    fn apply(&mut self, outcome: DelayOutcome) {
        match outcome {
            DelayOutcome::Elapsed => {}
            DelayOutcome::Paused => {
                info!(iteration = self.current, "IterationController: paused");
                self.state = LoopState::Paused;
            }
            DelayOutcome::Stopped | DelayOutcome::Aborted => {
                info!(iteration = self.current, ?outcome, "IterationController: stopped");
                self.state = LoopState::Stopped;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ProcessRegistry;

    fn controller(total: u32) -> IterationController {
        IterationController::new(total, Duration::from_millis(20), Duration::ZERO)
    }

    #[test]
    fn test_start_sets_first_iteration() {
        let mut c = controller(3);
        assert_eq!(c.state(), LoopState::Idle);
        assert_eq!(c.start(), 1);
        assert_eq!(c.state(), LoopState::Running);
    }

    #[test]
    fn test_all_complete_wins() {
        let mut c = controller(1);
        c.start();
        assert_eq!(c.mark_iteration_complete(true, false), IterationDecision::AllComplete);
        assert_eq!(c.state(), LoopState::Complete);
        assert!(c.state().is_terminal());
    }

    #[test]
    fn test_max_iterations() {
        let mut c = controller(2);
        c.start();
        assert_eq!(
            c.mark_iteration_complete(false, true),
            IterationDecision::Continue {
                next: 2,
                delay: Duration::from_millis(20)
            }
        );
        assert_eq!(c.next(), Some(2));
        assert_eq!(c.mark_iteration_complete(false, true), IterationDecision::MaxIterations);
        assert_eq!(c.next(), None);
    }

    #[test]
    fn test_offset_numbers_absolute_iterations() {
        let mut c = controller(7).with_offset(3);
        c.start();
        assert_eq!(c.current(), 1);
        assert_eq!(c.absolute(), 4);
        assert_eq!(c.total(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_runtime_before_total() {
        let mut c = IterationController::new(100, Duration::ZERO, Duration::from_secs(1));
        c.start();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(c.runtime_exceeded());
        assert_eq!(c.mark_iteration_complete(false, true), IterationDecision::MaxRuntime);
        assert_eq!(c.state(), LoopState::MaxRuntime);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_clamped_to_remaining_runtime() {
        let mut c = IterationController::new(100, Duration::from_secs(10), Duration::from_secs(3));
        c.start();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(c.remaining_runtime(), Some(Duration::from_secs(2)));
        assert_eq!(
            c.mark_iteration_complete(false, true),
            IterationDecision::Continue {
                next: 2,
                delay: Duration::from_secs(2),
            }
        );

        let unbounded = IterationController::new(5, Duration::from_secs(10), Duration::ZERO);
        assert_eq!(unbounded.remaining_runtime(), None);
    }

    #[tokio::test]
    async fn test_wait_for_next_elapses() {
        let mut c = controller(3);
        c.start();
        let outcome = c.wait_for_next(Duration::from_millis(10), &AbortSignal::never()).await;
        assert_eq!(outcome, DelayOutcome::Elapsed);
        assert_eq!(c.state(), LoopState::Running);
    }

    #[tokio::test]
    async fn test_pause_cancels_delay_and_keeps_position() {
        let mut c = controller(5);
        c.start();
        let handle = c.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.pause();
        });
        let outcome = c.wait_for_next(Duration::from_secs(30), &AbortSignal::never()).await;
        assert_eq!(outcome, DelayOutcome::Paused);
        assert_eq!(c.state(), LoopState::Paused);
        assert_eq!(c.current(), 1);

        // resume does not advance by itself
        c.resume();
        assert_eq!(c.state(), LoopState::Running);
        assert_eq!(c.current(), 1);
        assert_eq!(c.next(), Some(2));
    }

    #[tokio::test]
    async fn test_wait_resumed_after_pause() {
        let mut c = controller(5);
        c.start();
        c.pause();
        let handle = c.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.resume();
        });
        assert!(c.wait_resumed(&AbortSignal::never()).await);
        assert_eq!(c.state(), LoopState::Running);
    }

    #[tokio::test]
    async fn test_abort_cancels_delay() {
        let registry = ProcessRegistry::default();
        let abort = registry.abort_signal("main");
        let mut c = controller(5);
        c.start();
        registry.kill_all();
        let outcome = c.wait_for_next(Duration::from_secs(30), &abort).await;
        assert_eq!(outcome, DelayOutcome::Aborted);
        assert_eq!(c.state(), LoopState::Stopped);
        assert_eq!(c.next(), None);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_kept() {
        let handle = ControlHandle::new();
        handle.stop();
        let mut c = controller(5).with_control(handle.clone());
        c.start();
        assert_eq!(c.control_outcome(), Some(DelayOutcome::Stopped));
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_is_sticky() {
        let mut c = controller(5);
        c.start();
        c.control().stop();
        assert_eq!(c.control_outcome(), Some(DelayOutcome::Stopped));
        assert_eq!(c.state(), LoopState::Stopped);
        c.resume();
        assert_eq!(c.state(), LoopState::Stopped);
    }
}
