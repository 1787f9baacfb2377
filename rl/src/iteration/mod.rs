//! Iteration loop control

pub mod controller;

pub use controller::{ControlHandle, DelayOutcome, IterationController, IterationDecision, LoopState};
