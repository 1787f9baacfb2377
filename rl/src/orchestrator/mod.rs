//! Orchestrator: the only component that ends a session
//!
//! Composes the task source, agent runner, iteration controller, session
//! store and feedback handlers into the standard loop ([`core`]) and the
//! dependency-driven parallel loop ([`parallel`]).

mod core;
mod parallel;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::ProcessRegistry;
use crate::iteration::ControlHandle;
use crate::notify::NotifyEvent;

pub use self::core::Orchestrator;

/// Per-invocation overrides of the configuration
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Iteration budget; on resume, extra iterations on top of the remaining ones
    pub iterations: Option<u32>,
    pub parallel: Option<bool>,
    pub max_concurrent: Option<usize>,
    pub skip_verification: bool,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Complete,
    MaxIterations,
    MaxRuntime,
    /// Parallel groups ran out with failed or blocked tasks left
    TasksFailed,
    Stopped,
    Fatal,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::MaxIterations => "max_iterations",
            Self::MaxRuntime => "max_runtime",
            Self::TasksFailed => "tasks_failed",
            Self::Stopped => "stopped",
            Self::Fatal => "fatal_error",
        }
    }

    /// Notification sent for this outcome
    pub fn notify_event(&self) -> NotifyEvent {
        match self {
            Self::Complete => NotifyEvent::Complete,
            Self::MaxIterations | Self::TasksFailed => NotifyEvent::MaxIterations,
            Self::MaxRuntime => NotifyEvent::MaxRuntime,
            Self::Stopped => NotifyEvent::Stopped,
            Self::Fatal => NotifyEvent::FatalError,
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a finished run reports back to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub session_id: String,
    pub outcome: SessionOutcome,
    /// Iterations run by this invocation (not counting earlier resumes)
    pub iterations_run: u32,
    /// Last absolute iteration number recorded on the session
    pub last_iteration: u32,
    pub tasks_done: usize,
    pub tasks_total: usize,
    pub message: Option<String>,
    pub suggestion: Option<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.outcome == SessionOutcome::Complete
    }
}

/// Cloneable remote control for a running orchestrator
///
/// `stop` aborts every live agent and makes the loop persist the session as
/// stopped; `pause` takes effect at the next iteration boundary.
#[derive(Clone)]
pub struct OrchestratorHandle {
    registry: Arc<ProcessRegistry>,
    control: ControlHandle,
}

impl OrchestratorHandle {
    pub(crate) fn new(registry: Arc<ProcessRegistry>, control: ControlHandle) -> Self {
        Self { registry, control }
    }

    pub fn stop(&self) {
        info!("OrchestratorHandle::stop: shutdown requested");
        self.control.stop();
        self.registry.kill_all();
    }

    pub fn pause(&self) {
        debug!("OrchestratorHandle::pause: called");
        self.control.pause();
    }

    pub fn resume(&self) {
        debug!("OrchestratorHandle::resume: called");
        self.control.resume();
    }

    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }
}
