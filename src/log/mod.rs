//! Structured event log: JSON lines shared by every tmuxgram process.
//!
//! The launcher, the relay and each notifier append to the same
//! `events.jsonl`. Each line is a self-contained JSON object with a
//! timestamp, the session it concerns (if any) and a tagged event, so the
//! history of a session can be grepped out of one file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// A structured event in the log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// A launcher registered a session and attached to it.
    SessionStarted { cwd: String },
    /// The attached client returned; the session is being unregistered.
    SessionStopped { exit_code: Option<i32> },
    /// The relay process began polling.
    RelayStarted { pid: u32 },
    /// The relay stopped, or a launcher stopped it.
    RelayStopped { reason: String },
    /// A slash command arrived from the chat.
    CommandReceived { command: String },
    /// Free text (or a photo reference) was typed into a session.
    InputSent { length: usize },
    /// A numbered menu entry was picked.
    OptionSelected { number: u32 },
    /// A plan file was sent to the chat.
    PlanViewed { path: String },
    NotificationSent { kind: String },
    NotificationSuppressed { kind: String, reason: String },
    /// An external call failed.
    Error { message: String },
}

/// Writer for the JSON lines event log.
pub struct EventLog {
    writer: Option<Mutex<BufWriter<File>>>,
    path: PathBuf,
}

impl EventLog {
    /// Open the log at `path` for appending.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Some(Mutex::new(BufWriter::new(file))),
            path: path.to_path_buf(),
        })
    }

    /// Like [`EventLog::new`], but an unopenable file yields a log that
    /// drops every event.
    pub fn open(path: &Path) -> Self {
        Self::new(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %format!("{e:#}"), "event log disabled");
            Self {
                writer: None,
                path: path.to_path_buf(),
            }
        })
    }

    /// Append one event.
    pub fn log(&self, session: Option<&str>, event: LogEvent) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        let entry = LogEntry {
            timestamp: Utc::now(),
            session: session.map(str::to_string),
            event,
        };
        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "event log");

        let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Append one event; failures are reported through `tracing` only.
    pub fn record(&self, session: Option<&str>, event: LogEvent) {
        if let Err(e) = self.log(session, event) {
            warn!(path = %self.path.display(), error = %format!("{e:#}"), "failed to record event");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
