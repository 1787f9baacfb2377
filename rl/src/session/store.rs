//! File-backed session store
//!
//! One session record per state directory (`<state-dir>/session.json`),
//! written as a whole-file replace after every mutation.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{Session, SessionStatus};

/// File name of the session record inside the state directory
pub const SESSION_FILE: &str = "session.json";

/// Errors from session persistence
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid session record {path} (fields: {}): {message}", fields.join(", "))]
    Invalid {
        path: PathBuf,
        fields: Vec<String>,
        message: String,
    },

    #[error("Failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError + '_ {
    move |source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persists the [`Session`] of one working directory
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let dir = state_dir.into();
        debug!(?dir, "SessionStore::new: called");
        Self { dir }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Load the session, `None` when there is none on disk
    pub fn load(&self) -> Result<Option<Session>, SessionError> {
        let path = self.path();
        debug!(?path, "SessionStore::load: called");
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        decode_session(&path, &content).map(Some)
    }

    /// Load the session only if it can be resumed
    pub fn load_resumable(&self) -> Result<Option<Session>, SessionError> {
        Ok(self.load()?.filter(Session::is_resumable))
    }

    /// Write the whole record atomically (temp file then rename)
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.path();
        debug!(?path, id = %session.id, status = %session.status, "SessionStore::save: called");
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        let json = serde_json::to_string_pretty(session)?;
        let tmp = self.dir.join(format!("{}.tmp", SESSION_FILE));
        fs::write(&tmp, json).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        Ok(())
    }

    /// Remove the record; returns whether one existed
    pub fn delete(&self) -> Result<bool, SessionError> {
        let path = self.path();
        debug!(?path, "SessionStore::delete: called");
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    /// Create and persist a fresh running session, replacing any previous one
    pub fn create(&self, total_iterations: u32) -> Result<Session, SessionError> {
        let session = Session::new(total_iterations);
        info!(id = %session.id, total_iterations, "SessionStore::create: new session");
        self.save(&session)?;
        Ok(session)
    }

    /// Apply `f` to the session and persist the result
    pub fn persist<R>(&self, session: &mut Session, f: impl FnOnce(&mut Session) -> R) -> Result<R, SessionError> {
        let result = f(session);
        self.save(session)?;
        Ok(result)
    }

    /// Transition status; a completed session is deleted rather than saved
    pub fn update_status(&self, session: &mut Session, status: SessionStatus) -> Result<(), SessionError> {
        debug!(id = %session.id, from = %session.status, to = %status, "SessionStore::update_status: called");
        session.status = status;
        session.touch();
        if status == SessionStatus::Completed {
            info!(id = %session.id, "SessionStore::update_status: session completed, removing record");
            self.delete()?;
            return Ok(());
        }
        self.save(session)
    }

    pub fn record_iteration_start(&self, session: &mut Session, iteration: u32) -> Result<(), SessionError> {
        self.persist(session, |s| s.record_iteration_start(iteration))
    }

    pub fn record_iteration_end(&self, session: &mut Session, iteration: u32, success: bool) -> Result<u64, SessionError> {
        self.persist(session, |s| s.record_iteration_end(iteration, success))
    }

    pub fn set_current_task_index(&self, session: &mut Session, index: usize) -> Result<(), SessionError> {
        self.persist(session, |s| {
            s.current_task_index = index;
            s.touch();
        })
    }

    // === Parallel sub-API ===

    pub fn enable_parallel_mode(
        &self,
        session: &mut Session,
        groups: Vec<Vec<String>>,
        max_concurrent_tasks: usize,
    ) -> Result<(), SessionError> {
        self.persist(session, |s| s.enable_parallel_mode(groups, max_concurrent_tasks))
    }

    pub fn disable_parallel_mode(&self, session: &mut Session) -> Result<(), SessionError> {
        self.persist(session, Session::disable_parallel_mode)
    }

    pub fn start_parallel_group(&self, session: &mut Session, group_index: usize) -> Result<bool, SessionError> {
        self.persist(session, |s| s.start_parallel_group(group_index))
    }

    pub fn complete_parallel_group(&self, session: &mut Session, group_index: usize) -> Result<bool, SessionError> {
        self.persist(session, |s| s.complete_parallel_group(group_index))
    }

    pub fn start_task_execution(
        &self,
        session: &mut Session,
        task_id: &str,
        task_title: &str,
        task_index: usize,
    ) -> Result<bool, SessionError> {
        self.persist(session, |s| s.start_task_execution(task_id, task_title, task_index))
    }

    pub fn complete_task_execution(&self, session: &mut Session, task_id: &str) -> Result<bool, SessionError> {
        self.persist(session, |s| s.complete_task_execution(task_id))
    }

    pub fn fail_task_execution(&self, session: &mut Session, task_id: &str, error: &str) -> Result<bool, SessionError> {
        self.persist(session, |s| s.fail_task_execution(task_id, error))
    }

    pub fn retry_task_execution(&self, session: &mut Session, task_id: &str, error: &str) -> Result<bool, SessionError> {
        self.persist(session, |s| s.retry_task_execution(task_id, error))
    }
}

type FieldCheck = fn(&Value) -> bool;

fn is_u64(v: &Value) -> bool {
    v.as_u64().is_some()
}

fn is_string(v: &Value) -> bool {
    v.is_string()
}

fn is_timestamp(v: &Value) -> bool {
    v.as_str()
        .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
}

fn is_status(v: &Value) -> bool {
    serde_json::from_value::<SessionStatus>(v.clone()).is_ok()
}

const REQUIRED_FIELDS: &[(&str, FieldCheck)] = &[
    ("id", is_string),
    ("startTime", is_timestamp),
    ("lastUpdateTime", is_timestamp),
    ("currentIteration", is_u64),
    ("totalIterations", is_u64),
    ("currentTaskIndex", is_u64),
    ("status", is_status),
    ("elapsedTimeSeconds", is_u64),
];

/// Decode a session record, naming the offending fields on failure
fn decode_session(path: &Path, content: &str) -> Result<Session, SessionError> {
    let invalid = |fields: Vec<String>, message: String| SessionError::Invalid {
        path: path.to_path_buf(),
        fields,
        message,
    };

    let value: Value = serde_json::from_str(content).map_err(|e| invalid(vec!["<root>".to_string()], e.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(invalid(vec!["<root>".to_string()], "expected a JSON object".to_string()));
    };

    let fields: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|(name, check)| !object.get(*name).is_some_and(check))
        .map(|(name, _)| name.to_string())
        .collect();

    match serde_json::from_value::<Session>(value.clone()) {
        Ok(session) => Ok(session),
        Err(e) => {
            let fields = if fields.is_empty() { vec!["<nested>".to_string()] } else { fields };
            Err(invalid(fields, e.to_string()))
        }
    }
}
