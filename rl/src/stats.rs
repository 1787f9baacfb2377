//! Usage statistics aggregated across sessions

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::SessionStatistics;

pub const USAGE_FILE: &str = "usage.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageStats {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub total_iterations: u64,
    pub successful_iterations: u64,
    pub failed_iterations: u64,
    pub total_duration_ms: u64,
    pub last_session_at: Option<DateTime<Utc>>,
}

impl UsageStats {
    /// Share of finished iterations that succeeded, 0-100
    pub fn success_rate(&self) -> f64 {
        let finished = self.successful_iterations + self.failed_iterations;
        if finished == 0 {
            0.0
        } else {
            self.successful_iterations as f64 * 100.0 / finished as f64
        }
    }
}

/// `usage.json` under the per-user data directory
#[derive(Debug, Clone)]
pub struct UsageStatsStore {
    path: PathBuf,
}

impl UsageStatsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_local_dir>/ralphloop/usage.json`
    pub fn default_location() -> Self {
        let dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("ralphloop");
        Self::new(dir.join(USAGE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current totals; a missing or corrupt file reads as zero
    pub fn load(&self) -> UsageStats {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = ?self.path, error = %e, "UsageStatsStore::load: ignoring corrupt file");
                UsageStats::default()
            }),
            Err(_) => UsageStats::default(),
        }
    }

    pub fn save(&self, stats: &UsageStats) -> Result<()> {
        debug!(path = ?self.path, "UsageStatsStore::save: called");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create stats directory")?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(stats)?).context("Failed to write usage stats")?;
        fs::rename(&tmp, &self.path).context("Failed to replace usage stats")?;
        Ok(())
    }

    pub fn record_session_start(&self) -> Result<UsageStats> {
        let mut stats = self.load();
        stats.sessions_started += 1;
        stats.last_session_at = Some(Utc::now());
        self.save(&stats)?;
        Ok(stats)
    }

    /// Fold a finished session's statistics into the totals
    pub fn record_session_end(&self, session: &SessionStatistics, completed: bool) -> Result<UsageStats> {
        debug!(completed, iterations = session.completed_iterations, "UsageStatsStore::record_session_end: called");
        let mut stats = self.load();
        if completed {
            stats.sessions_completed += 1;
        }
        stats.total_iterations += u64::from(session.completed_iterations);
        stats.successful_iterations += u64::from(session.successful_iterations);
        stats.failed_iterations += u64::from(session.failed_iterations);
        stats.total_duration_ms += session.total_duration_ms;
        stats.last_session_at = Some(Utc::now());
        self.save(&stats)?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_accumulates_across_sessions() {
        let temp = tempdir().unwrap();
        let store = UsageStatsStore::new(temp.path().join("stats/usage.json"));
        assert_eq!(store.load(), UsageStats::default());

        let session = SessionStatistics {
            completed_iterations: 4,
            successful_iterations: 3,
            failed_iterations: 1,
            total_duration_ms: 1000,
            ..Default::default()
        };
        store.record_session_start().unwrap();
        store.record_session_end(&session, true).unwrap();
        store.record_session_start().unwrap();
        let stats = store.record_session_end(&session, false).unwrap();

        assert_eq!(stats.sessions_started, 2);
        assert_eq!(stats.sessions_completed, 1);
        assert_eq!(stats.total_iterations, 8);
        assert_eq!(stats.total_duration_ms, 2000);
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert!(stats.last_session_at.is_some());
    }

    #[test]
    fn test_corrupt_file_reads_as_zero() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("usage.json");
        fs::write(&path, "[]").unwrap();
        assert_eq!(UsageStatsStore::new(path).load(), UsageStats::default());
    }
}
