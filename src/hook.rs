//! Lifecycle hook input.
//!
//! The agent runs `tmuxgram notify` once per lifecycle event and writes one
//! JSON object to its stdin. Every field is optional on the wire; unknown
//! fields are ignored.

use std::io::{ErrorKind, Read};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;

pub const NOTIFICATION_EVENT: &str = "Notification";

/// How long the notifier waits for the hook payload before giving up.
pub const STDIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HookEvent {
    #[serde(default)]
    pub hook_event_name: String,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl HookEvent {
    pub fn parse(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn is_notification(&self) -> bool {
        self.hook_event_name == NOTIFICATION_EVENT
    }

    pub fn kind(&self) -> NotificationKind {
        NotificationKind::from_type(self.notification_type.as_deref())
    }

    pub fn title(&self) -> Option<&str> {
        non_empty(self.title.as_deref())
    }

    pub fn message(&self) -> Option<&str> {
        non_empty(self.message.as_deref())
    }

    pub fn cwd(&self) -> Option<&str> {
        non_empty(self.cwd.as_deref())
    }

    pub fn transcript_path(&self) -> Option<&str> {
        non_empty(self.transcript_path.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Notification flavour, from `notification_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Permission,
    Elicitation,
    Idle,
    Other,
}

impl NotificationKind {
    pub fn from_type(value: Option<&str>) -> Self {
        match value {
            Some("permission_prompt") => Self::Permission,
            Some("elicitation_dialog") => Self::Elicitation,
            Some("idle_prompt") => Self::Idle,
            _ => Self::Other,
        }
    }

    /// Kinds whose screen shows a dialog rather than a response.
    pub fn is_dialog(self) -> bool {
        matches!(self, Self::Permission | Self::Elicitation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permission => "permission_prompt",
            Self::Elicitation => "elicitation_dialog",
            Self::Idle => "idle_prompt",
            Self::Other => "other",
        }
    }
}

/// Read everything `reader` produces within `timeout`.
///
/// The read happens on a helper thread so a writer that never closes the
/// pipe cannot hang the caller. Whatever arrived before the deadline is
/// returned, decoded lossily.
pub fn read_with_timeout<R>(mut reader: R, timeout: Duration) -> String
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });

    let deadline = Instant::now() + timeout;
    let mut data = Vec::new();
    // Disconnected means EOF; Timeout means the deadline passed.
    while let Ok(chunk) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        data.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&data).into_owned()
}
