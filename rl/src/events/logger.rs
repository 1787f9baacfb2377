//! Event Logger - persists events to a JSONL file
//!
//! The EventLogger subscribes to the EventBus and appends every event of a
//! session to `<state-dir>/events/<session-id>.jsonl` for history and debugging.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use super::bus::{EventBus, Subscription};
use super::types::{Event, EventLogEntry};

/// Event logger that writes events to one JSONL file
pub struct EventLogger {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl EventLogger {
    /// Create a new event logger; the file is opened on the first write
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLogger::new: creating logger");
        Self { path, writer: None }
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event
    pub fn write_event(&mut self, event: &Event) -> eyre::Result<()> {
        debug!(event = event.name(), "EventLogger::write_event");

        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!(path = ?self.path, "EventLogger: opening log file");
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }

        let json = serde_json::to_string(&EventLogEntry::new(event.clone()))?;
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", json)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Flush and close the file
    pub fn close(&mut self) {
        debug!(path = ?self.path, "EventLogger::close");
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }

    /// Consume events until the session finishes or the bus goes away
    pub async fn run(mut self, mut subscription: Subscription) {
        debug!("EventLogger::run: starting event logger");
        while let Some(event) = subscription.recv().await {
            let finished = matches!(event, Event::SessionCompleted { .. } | Event::SessionStopped { .. });
            if let Err(e) = self.write_event(&event) {
                error!(error = %e, "EventLogger: failed to write event");
            }
            if finished {
                debug!("EventLogger: session finished, shutting down");
                break;
            }
        }
        self.close();
    }
}

/// Read events back from a log file
pub fn read_events(path: impl AsRef<Path>) -> eyre::Result<Vec<EventLogEntry>> {
    let path = path.as_ref();
    debug!(?path, "read_events: reading log file");

    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line, error = %e, "read_events: failed to parse line"),
        }
    }

    debug!(count = entries.len(), "read_events: loaded entries");
    Ok(entries)
}

/// Spawn the event logger as a background task
///
/// The subscription is taken before spawning so no early event is missed.
pub fn spawn_event_logger(event_bus: &EventBus, path: impl AsRef<Path>) -> tokio::task::JoinHandle<()> {
    let subscription = event_bus.subscribe();
    let logger = EventLogger::new(path);
    tokio::spawn(async move {
        logger.run(subscription).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_events() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events").join("s1.jsonl");
        let mut logger = EventLogger::new(&path);

        logger
            .write_event(&Event::SessionStarted {
                execution_id: "s1".to_string(),
                total_iterations: 3,
                parallel: false,
            })
            .unwrap();
        logger
            .write_event(&Event::IterationStarted {
                execution_id: "s1".to_string(),
                iteration: 1,
                task_title: None,
            })
            .unwrap();

        let entries = read_events(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event.name(), "session:start");
        assert_eq!(entries[1].event.name(), "iteration:start");
    }

    #[test]
    fn test_read_missing_file() {
        let temp = tempdir().unwrap();
        assert!(read_events(temp.path().join("none.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_close_drops_writer() {
        let temp = tempdir().unwrap();
        let mut logger = EventLogger::new(temp.path().join("a.jsonl"));
        logger
            .write_event(&Event::SessionPaused {
                execution_id: "s".to_string(),
                iteration: 2,
            })
            .unwrap();
        assert!(logger.writer.is_some());
        logger.close();
        assert!(logger.writer.is_none());
    }

    #[tokio::test]
    async fn test_spawned_logger_stops_on_session_completed() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("run.jsonl");
        let bus = EventBus::new(100);
        let handle = spawn_event_logger(&bus, &path);

        let emitter = bus.emitter_for("s");
        emitter.session_started(1, false);
        emitter.session_completed("all_complete", 1);
        handle.await.unwrap();

        let entries = read_events(&path).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
