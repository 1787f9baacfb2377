//! Event bus for observing the orchestration core
//!
//! ```text
//!   AgentRunner   Orchestrator   ParallelRunner   Verification
//!        \             |               |              /
//!         +------------+---- EventBus -+-------------+
//!                      |    (broadcast)|
//!               EventLogger (jsonl)   CLI presenter / stats
//! ```
//!
//! Components hold an [`EventEmitter`] bound to an execution id ("main" for
//! the sequential loop, the task id for parallel tasks). Consumers hold a
//! [`Subscription`]; events are only delivered to subscriptions that exist
//! when the event is emitted.

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, Subscription, create_event_bus};
pub use logger::{EventLogger, read_events, spawn_event_logger};
pub use types::{Event, EventLogEntry};
