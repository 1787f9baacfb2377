//! Task-list source
//!
//! The orchestrator only sees [`TaskSource`]; [`JsonTaskFile`] is the
//! `prd.json` implementation. Lists are re-read at every iteration boundary
//! because the agent edits the file itself.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::TaskList;

#[derive(Debug, Error)]
pub enum TaskSourceError {
    #[error("failed to access task list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid task list {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Current list; `None` when there is no list yet
    async fn load(&self) -> Result<Option<TaskList>, TaskSourceError>;

    /// Replace the stored list
    async fn save(&self, list: &TaskList) -> Result<(), TaskSourceError>;

    /// Where the list lives, for prompts and messages
    fn location(&self) -> String;
}

/// Task list stored as pretty-printed JSON
#[derive(Debug, Clone)]
pub struct JsonTaskFile {
    path: PathBuf,
}

impl JsonTaskFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> TaskSourceError {
        TaskSourceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl TaskSource for JsonTaskFile {
    async fn load(&self) -> Result<Option<TaskList>, TaskSourceError> {
        debug!(path = ?self.path, "JsonTaskFile::load: called");
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = ?self.path, "JsonTaskFile::load: no task list");
                return Ok(None);
            }
            Err(e) => return Err(self.io_error(e)),
        };
        let list = serde_json::from_str(&content).map_err(|source| TaskSourceError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(list))
    }

    async fn save(&self, list: &TaskList) -> Result<(), TaskSourceError> {
        debug!(path = ?self.path, tasks = list.tasks.len(), "JsonTaskFile::save: called");
        let json = serde_json::to_string_pretty(list).map_err(|source| TaskSourceError::Parse {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, format!("{}\n", json))
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io_error(e))?;
        info!(path = ?self.path, done = list.done_count(), total = list.tasks.len(), "JsonTaskFile::save: saved");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
