//! Event Bus - central pub/sub system for ralphloop events
//!
//! The EventBus uses tokio broadcast channels to deliver events to all subscribers.
//! Components emit events; consumers (loggers, statistics, a UI) subscribe and hold
//! a [`Subscription`] whose lifetime is the lifetime of the subscription.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use super::types::Event;
use crate::domain::IterationStatus;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Central event bus for ralphloop activity streaming
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: with no subscribers the event is dropped.
    pub fn emit(&self, event: Event) {
        debug!(event = event.name(), execution_id = event.execution_id(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> Subscription {
        debug!("EventBus::subscribe: new subscriber");
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Create an emitter handle bound to an execution id
    pub fn emitter_for(&self, execution_id: impl Into<String>) -> EventEmitter {
        let execution_id = execution_id.into();
        debug!(%execution_id, "EventBus::emitter_for: creating emitter");
        EventEmitter {
            tx: self.tx.clone(),
            execution_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// A live subscription to the bus
///
/// Dropping it or calling [`Subscription::unsubscribe`] ends the subscription.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Wait for the next event; `None` once the bus is gone
    ///
    /// A subscriber that lags behind skips the overwritten events.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Subscription: lagged behind, missed events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take an already-delivered event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Subscription: lagged behind, missed events");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every event delivered so far
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// End the subscription
    pub fn unsubscribe(self) {
        debug!("Subscription::unsubscribe: called");
    }
}

/// Handle for components to emit events without owning the bus
///
/// Cheap to clone; every event carries the bound execution id.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<Event>,
    execution_id: String,
}

impl EventEmitter {
    /// Get the execution ID this emitter is bound to
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Same bus, different execution id
    pub fn rebind(&self, execution_id: impl Into<String>) -> Self {
        Self {
            tx: self.tx.clone(),
            execution_id: execution_id.into(),
        }
    }

    /// Emit a raw event
    pub fn emit(&self, event: Event) {
        debug!(event = event.name(), "EventEmitter::emit");
        let _ = self.tx.send(event);
    }

    fn id(&self) -> String {
        self.execution_id.clone()
    }

    // === Convenience methods ===

    pub fn agent_started(&self, attempt: u32, command: &str) {
        self.emit(Event::AgentStarted {
            execution_id: self.id(),
            attempt,
            command: command.to_string(),
        });
    }

    pub fn agent_output(&self, text: &str) {
        self.emit(Event::AgentOutput {
            execution_id: self.id(),
            text: text.to_string(),
        });
    }

    pub fn agent_completed(&self, success: bool, exit_code: Option<i32>, is_complete: bool, retry_count: u32) {
        self.emit(Event::AgentCompleted {
            execution_id: self.id(),
            success,
            exit_code,
            is_complete,
            retry_count,
        });
    }

    pub fn agent_error(&self, message: &str, fatal: bool) {
        self.emit(Event::AgentError {
            execution_id: self.id(),
            message: message.to_string(),
            fatal,
        });
    }

    pub fn agent_retry(&self, retry_count: u32, delay_ms: u64, error: &str) {
        self.emit(Event::AgentRetry {
            execution_id: self.id(),
            retry_count,
            delay_ms,
            error: error.to_string(),
        });
    }

    pub fn iteration_started(&self, iteration: u32, task_title: Option<&str>) {
        self.emit(Event::IterationStarted {
            execution_id: self.id(),
            iteration,
            task_title: task_title.map(str::to_string),
        });
    }

    pub fn iteration_completed(&self, iteration: u32, status: IterationStatus) {
        self.emit(Event::IterationCompleted {
            execution_id: self.id(),
            iteration,
            status,
        });
    }

    pub fn iteration_delay(&self, next_iteration: u32, delay_ms: u64) {
        self.emit(Event::IterationDelay {
            execution_id: self.id(),
            next_iteration,
            delay_ms,
        });
    }

    pub fn session_started(&self, total_iterations: u32, parallel: bool) {
        self.emit(Event::SessionStarted {
            execution_id: self.id(),
            total_iterations,
            parallel,
        });
    }

    pub fn session_resumed(&self, from_iteration: u32, remaining_iterations: u32) {
        self.emit(Event::SessionResumed {
            execution_id: self.id(),
            from_iteration,
            remaining_iterations,
        });
    }

    pub fn session_paused(&self, iteration: u32) {
        self.emit(Event::SessionPaused {
            execution_id: self.id(),
            iteration,
        });
    }

    pub fn session_stopped(&self, reason: &str) {
        self.emit(Event::SessionStopped {
            execution_id: self.id(),
            reason: reason.to_string(),
        });
    }

    pub fn session_completed(&self, outcome: &str, iterations: u32) {
        self.emit(Event::SessionCompleted {
            execution_id: self.id(),
            outcome: outcome.to_string(),
            iterations,
        });
    }

    pub fn parallel_group_started(&self, group_index: usize, task_ids: &[String]) {
        self.emit(Event::ParallelGroupStarted {
            execution_id: self.id(),
            group_index,
            task_ids: task_ids.to_vec(),
        });
    }

    pub fn parallel_group_completed(&self, group_index: usize, completed: usize, failed: usize) {
        self.emit(Event::ParallelGroupCompleted {
            execution_id: self.id(),
            group_index,
            completed,
            failed,
        });
    }

    pub fn parallel_task_started(&self, group_index: usize, task_id: &str, task_title: &str) {
        self.emit(Event::ParallelTaskStarted {
            execution_id: self.id(),
            group_index,
            task_id: task_id.to_string(),
            task_title: task_title.to_string(),
        });
    }

    pub fn parallel_task_completed(&self, task_id: &str, success: bool, error: Option<&str>) {
        self.emit(Event::ParallelTaskCompleted {
            execution_id: self.id(),
            task_id: task_id.to_string(),
            success,
            error: error.map(str::to_string),
        });
    }

    pub fn verification_started(&self, iteration: u32, check: &str, command: &str) {
        self.emit(Event::VerificationStarted {
            execution_id: self.id(),
            iteration,
            check: check.to_string(),
            command: command.to_string(),
        });
    }

    pub fn verification_completed(&self, iteration: u32, passed: bool, failed_checks: Vec<String>) {
        self.emit(Event::VerificationCompleted {
            execution_id: self.id(),
            iteration,
            passed,
            failed_checks,
        });
    }

    pub fn task_decomposed(&self, original_task: &str, subtask_count: usize) {
        self.emit(Event::TaskDecomposed {
            execution_id: self.id(),
            original_task: original_task.to_string(),
            subtask_count,
        });
    }

    /// Emit an error event
    pub fn error(&self, context: &str, message: &str) {
        self.emit(Event::Error {
            execution_id: self.id(),
            context: context.to_string(),
            message: message.to_string(),
        });
    }

    /// Emit a warning event
    pub fn warning(&self, context: &str, message: &str) {
        self.emit(Event::Warning {
            execution_id: self.id(),
            context: context.to_string(),
            message: message.to_string(),
        });
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
