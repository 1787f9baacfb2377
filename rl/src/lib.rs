//! ralphloop - Ralph Wiggum loop runner for external AI coding agents
//!
//! ralphloop repeatedly invokes an agent CLI (Claude Code by default) against
//! a task list, one fresh process per iteration, until every task is done or
//! a budget runs out. State lives in files: the task list, a resumable
//! session record, an iteration log and a learning memory.
//!
//! # Core Concepts
//!
//! - **Fresh process per iteration**: no conversation state survives between iterations
//! - **Files are the truth**: the task list is re-read at every iteration boundary
//! - **Fatal vs retryable**: only missing binaries, auth and permission problems end a session
//! - **Dependency groups**: independent tasks can run on concurrent agents
//!
//! # Modules
//!
//! - [`agent`] - Agent invocation, retries, error classification, prompts
//! - [`orchestrator`] - Standard and parallel loops, session lifecycle
//! - [`iteration`] - Iteration budget and pause/stop control
//! - [`scheduler`] - Dependency validation and execution groups
//! - [`session`] - Session record and iteration log persistence
//! - [`feedback`] - Decomposition, verification, learning
//! - [`branch`] - Per-task git branches and pull requests
//! - [`events`] - Event bus and event log
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod agent;
pub mod branch;
pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod feedback;
pub mod iteration;
pub mod notify;
pub mod orchestrator;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod tasks;

pub use config::Config;
pub use domain::{Task, TaskList};
pub use orchestrator::{Orchestrator, OrchestratorHandle, RunOptions, RunSummary, SessionOutcome};
