//! Append-only iteration log stream
//!
//! One JSONL file per session under `<state-dir>/iterations/`. Records are
//! written once, after the iteration's completion handler has run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use eyre::{Context, Result};
use tracing::{debug, warn};

use crate::domain::IterationLog;

/// Writes and reads per-session iteration logs
#[derive(Debug, Clone)]
pub struct IterationLogStore {
    dir: PathBuf,
}

impl IterationLogStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: state_dir.into().join("iterations"),
        }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session_id))
    }

    /// Append one record
    pub fn append(&self, session_id: &str, log: &IterationLog) -> Result<()> {
        let path = self.path_for(session_id);
        debug!(?path, iteration = log.iteration, status = %log.status, "IterationLogStore::append: called");
        fs::create_dir_all(&self.dir).context("Failed to create iteration log directory")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open {}", path.display()))?;
        let json = serde_json::to_string(log)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Every record of a session, in write order
    pub fn read(&self, session_id: &str) -> Result<Vec<IterationLog>> {
        let path = self.path_for(session_id);
        debug!(?path, "IterationLogStore::read: called");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
        let mut logs = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<IterationLog>(line) {
                Ok(log) => logs.push(log),
                Err(e) => warn!(error = %e, "IterationLogStore::read: skipping malformed line"),
            }
        }
        Ok(logs)
    }

    /// Session ids with a log stream, most recent file first
    pub fn sessions(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(std::time::SystemTime, String)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let modified = entry.metadata()?.modified()?;
                entries.push((modified, stem.to_string()));
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }
}
