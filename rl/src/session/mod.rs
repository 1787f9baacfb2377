//! Session persistence
//!
//! - [`SessionStore`]: the resumable session record
//! - [`IterationLogStore`]: the append-only per-session iteration log

mod iteration_log;
mod store;

pub use iteration_log::IterationLogStore;
pub use store::{SESSION_FILE, SessionError, SessionStore};
