//! Everything about invoking the agent CLI
//!
//! - [`classifier`]: fatal vs retryable, plus root-cause analysis
//! - [`registry`]: live processes, abort signals, retry counters
//! - [`stream`]: the line protocol the agent writes to stdout
//! - [`runner`]: one invocation with timeout, stall detection and retries
//! - [`prompt`]: handlebars prompt rendering

pub mod classifier;
pub mod prompt;
pub mod registry;
pub mod runner;
pub mod stream;

pub use classifier::{
    ClassifiedError, ErrorCategory, FailureAnalysis, FailureCategory, analyze_failure, classify_error,
};
pub use prompt::{PromptContext, PromptLoader};
pub use registry::{AbortSignal, DEFAULT_PROCESS_ID, ProcessRegistry};
pub use runner::{AgentRunResult, AgentRunner, AgentSettings, COMPLETION_SENTINEL, RetryContext, backoff_delay};
pub use stream::{OutputThrottle, ParsedLine, parse_line};
