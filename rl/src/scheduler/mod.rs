//! Dependency scheduling for parallel mode

pub mod dependency;

pub use dependency::{DependencyError, ExecutionGroup, compute_execution_groups, validate_dependencies};
