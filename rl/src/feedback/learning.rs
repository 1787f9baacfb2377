//! Cross-iteration learning memory
//!
//! Lines the agent prefixes with `LESSON:`, `PATTERN:` or `AVOID:` are kept,
//! together with the root causes of retried attempts, and rendered back into
//! later prompts. Each list is capped; the oldest entries fall off first.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::RetryContext;
use crate::config::LearningConfig;

pub const LEARNINGS_FILE: &str = "learnings.json";

/// Entries rendered into a prompt, per list
const PROMPT_ENTRIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningKind {
    Lesson,
    Pattern,
    Avoid,
}

impl LearningKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Lesson => "LESSON:",
            Self::Pattern => "PATTERN:",
            Self::Avoid => "AVOID:",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningEntry {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted memory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningMemory {
    #[serde(default)]
    pub lessons: Vec<LearningEntry>,
    #[serde(default)]
    pub patterns: Vec<LearningEntry>,
    #[serde(default)]
    pub avoided: Vec<LearningEntry>,
}

impl LearningMemory {
    fn list_mut(&mut self, kind: LearningKind) -> &mut Vec<LearningEntry> {
        match kind {
            LearningKind::Lesson => &mut self.lessons,
            LearningKind::Pattern => &mut self.patterns,
            LearningKind::Avoid => &mut self.avoided,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty() && self.patterns.is_empty() && self.avoided.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lessons.len() + self.patterns.len() + self.avoided.len()
    }
}

/// Scan text for prefixed learning lines
pub fn extract_learnings(text: &str) -> Vec<(LearningKind, String)> {
    let mut found = Vec::new();
    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*', ' ']);
        for kind in [LearningKind::Lesson, LearningKind::Pattern, LearningKind::Avoid] {
            if let Some(rest) = line.strip_prefix(kind.prefix()) {
                let rest = rest.trim();
                if !rest.is_empty() {
                    found.push((kind, rest.to_string()));
                }
                break;
            }
        }
    }
    found
}

/// File-backed learning memory with retention caps
#[derive(Debug)]
pub struct LearningStore {
    path: PathBuf,
    config: LearningConfig,
    memory: LearningMemory,
}

impl LearningStore {
    /// Load `<state_dir>/learnings.json`; a missing or unreadable file starts empty
    pub fn open(state_dir: &Path, config: LearningConfig) -> Self {
        let path = state_dir.join(LEARNINGS_FILE);
        debug!(?path, "LearningStore::open: called");
        let memory = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(?path, error = %e, "LearningStore::open: ignoring corrupt learnings file");
                LearningMemory::default()
            }),
            Err(_) => LearningMemory::default(),
        };
        Self { path, config, memory }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn memory(&self) -> &LearningMemory {
        &self.memory
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record one entry; duplicates are ignored. Returns true when added.
    pub fn add(&mut self, kind: LearningKind, text: &str, iteration: Option<u32>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let cap = match kind {
            LearningKind::Lesson => self.config.max_lessons,
            LearningKind::Pattern => self.config.max_patterns,
            LearningKind::Avoid => self.config.max_avoided,
        };
        let list = self.memory.list_mut(kind);
        if list.iter().any(|e| e.text.eq_ignore_ascii_case(text)) {
            return false;
        }
        list.push(LearningEntry {
            text: text.to_string(),
            iteration,
            recorded_at: Utc::now(),
        });
        if list.len() > cap {
            let excess = list.len() - cap;
            list.drain(..excess);
        }
        debug!(?kind, %text, "LearningStore::add: recorded");
        true
    }

    /// Capture prefixed lines from agent text; returns the number added
    pub fn capture(&mut self, text: &str, iteration: u32) -> usize {
        let added = extract_learnings(text)
            .into_iter()
            .filter(|(kind, entry)| self.add(*kind, entry, Some(iteration)))
            .count();
        if added > 0 {
            info!(iteration, added, "LearningStore::capture: new learnings");
        }
        added
    }

    /// Turn the root causes of retried attempts into avoided approaches
    pub fn record_failures(&mut self, contexts: &[RetryContext], iteration: u32) -> usize {
        contexts
            .iter()
            .filter(|c| {
                let text = format!("{} failure: {}", c.category, c.root_cause);
                self.add(LearningKind::Avoid, &text, Some(iteration))
            })
            .count()
    }

    /// Markdown for the prompt; `None` when disabled or empty
    pub fn render(&self) -> Option<String> {
        if !self.config.enabled || self.memory.is_empty() {
            return None;
        }
        let mut out = String::new();
        for (heading, list) in [
            ("Lessons", &self.memory.lessons),
            ("Patterns that work", &self.memory.patterns),
            ("Avoid", &self.memory.avoided),
        ] {
            if list.is_empty() {
                continue;
            }
            out.push_str(&format!("### {}\n", heading));
            let skip = list.len().saturating_sub(PROMPT_ENTRIES);
            for entry in &list[skip..] {
                out.push_str(&format!("- {}\n", entry.text));
            }
            out.push('\n');
        }
        Some(out.trim_end().to_string())
    }

    /// Write the memory back atomically
    pub fn save(&self) -> Result<()> {
        debug!(path = ?self.path, entries = self.memory.len(), "LearningStore::save: called");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.memory)?;
        let mut file = fs::File::create(&tmp).context("Failed to create learnings file")?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path).context("Failed to replace learnings file")?;
        Ok(())
    }
}
