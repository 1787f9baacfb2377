//! Domain types for ralphloop
//!
//! - [`TaskList`] / [`Task`]: the PRD the agent works through
//! - [`Session`]: persisted, resumable run state with statistics
//! - [`IterationLog`]: write-once record per iteration

mod iteration_log;
mod session;
mod task;

pub use iteration_log::{
    DecompositionSummary, IterationLog, IterationLogSummary, IterationStatus, VerificationSummary, summarize,
};
pub use session::{
    ActiveTaskExecution, ExecutionGroupState, IterationTiming, ParallelSessionState, Session, SessionStatistics,
    SessionStatus, TaskExecutionStatus,
};
pub use task::{NextTask, Task, TaskList};
