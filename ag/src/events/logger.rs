//! Event Logger - persists events to a JSONL file
//!
//! The EventLogger subscribes to the EventBus and appends every event to one
//! file per run, for history, debugging, and replay.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::bus::{EventBus, Subscription};
use super::types::{EventLogEntry, SchedulerEvent};

/// Event logger that writes events to a JSONL file
pub struct EventLogger {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl EventLogger {
    /// Create a logger appending to `path`, creating parent directories
    pub fn create(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLogger::create: opening log file");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    /// Default location for a new run: `<data_local_dir>/admitgate/runs/<uuid>.jsonl`
    pub fn default_path() -> eyre::Result<PathBuf> {
        let data_dir = dirs::data_local_dir().ok_or_else(|| eyre::eyre!("Could not determine data directory"))?;
        Ok(data_dir
            .join("admitgate")
            .join("runs")
            .join(format!("{}.jsonl", Uuid::now_v7())))
    }

    /// Path of the file being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of events written so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Append one event
    pub fn write_event(&mut self, event: &SchedulerEvent) -> eyre::Result<()> {
        debug!(event_type = event.event_type(), "EventLogger::write_event");
        let entry = EventLogEntry::new(event.clone());
        let json = serde_json::to_string(&entry)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    /// Run the logger, consuming events until the bus is dropped
    ///
    /// This is meant to be spawned as a background task.
    pub async fn run(mut self, mut subscription: Subscription) -> usize {
        debug!(path = ?self.path, "EventLogger::run: starting event logger");

        loop {
            match subscription.recv().await {
                Ok(event) => {
                    if let Err(e) = self.write_event(&event) {
                        error!(error = %e, "EventLogger: failed to write event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "EventLogger: lagged behind, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventLogger: channel closed, shutting down");
                    break;
                }
            }
        }

        let _ = self.writer.flush();
        self.written
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
            Err(e) => {
                warn!(line, error = %e, "read_events: failed to parse line");
            }
        }
    }

    debug!(count = entries.len(), "read_events: loaded entries");
    Ok(entries)
}

/// Spawn an event logger writing to `path` as a background task
///
/// The subscription is taken before returning, so no event emitted after this
/// call is missed. The task resolves to the number of events written.
pub fn spawn_event_logger(event_bus: &EventBus, path: impl AsRef<Path>) -> eyre::Result<tokio::task::JoinHandle<usize>> {
    let logger = EventLogger::create(path)?;
    let subscription = event_bus.subscribe();
    Ok(tokio::spawn(logger.run(subscription)))
}
