//! Notification gate: per-kind cooldown, typing suppression and the
//! escalating hint.
//!
//! The gate state lives in `notify-log.json` and is shared by every notifier
//! process. It is read and written whole, without locks; a lost update only
//! costs one extra or one missing alert.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hook::NotificationKind;
use crate::paths::write_atomic;

/// Rolling window for the escalating hint, in seconds.
pub const HINT_WINDOW_SECS: i64 = 60;
/// Events inside the window needed before the hint replaces the footer.
pub const HINT_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyLog {
    #[serde(default)]
    pub recent_event_timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub last_idle_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_permission_sent_at: Option<DateTime<Utc>>,
}

impl NotifyLog {
    fn last_sent(&self, kind: NotificationKind) -> Option<DateTime<Utc>> {
        match kind {
            NotificationKind::Idle => self.last_idle_sent_at,
            NotificationKind::Permission => self.last_permission_sent_at,
            _ => None,
        }
    }
}

/// File-backed [`NotifyLog`].
#[derive(Debug, Clone)]
pub struct NotifyLogStore {
    path: PathBuf,
}

impl NotifyLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state starts fresh.
    pub fn load(&self) -> NotifyLog {
        let Ok(contents) = fs::read_to_string(&self.path) else {
            return NotifyLog::default();
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            debug!(path = %self.path.display(), error = %e, "notify log unreadable, starting fresh");
            NotifyLog::default()
        })
    }

    pub fn save(&self, log: &NotifyLog) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(log)?;
        write_atomic(&self.path, &json)
    }

    /// Record a successful send with a fresh read-modify-write, so hint
    /// timestamps written by other notifiers in the meantime survive.
    pub fn record_sent(&self, kind: NotificationKind, now: DateTime<Utc>) -> io::Result<()> {
        let mut log = self.load();
        Gate::mark_sent(&mut log, kind, now);
        self.save(&log)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Cooldown { remaining_secs: i64 },
    Typing,
}

impl std::fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cooldown { remaining_secs } => write!(f, "cooldown ({remaining_secs}s left)"),
            Self::Typing => write!(f, "user is typing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Send,
    Suppress(SuppressReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub show_hint: bool,
    pub verdict: Verdict,
}

impl Decision {
    pub fn should_send(&self) -> bool {
        self.verdict == Verdict::Send
    }
}

/// Upper bound `TimeDelta::seconds` accepts.
const MAX_COOLDOWN_SECS: i64 = i64::MAX / 1000;

#[derive(Debug, Clone, Copy)]
pub struct Gate {
    cooldown: TimeDelta,
}

impl Gate {
    pub fn new(cooldown_secs: u64) -> Self {
        let secs = i64::try_from(cooldown_secs)
            .unwrap_or(MAX_COOLDOWN_SECS)
            .min(MAX_COOLDOWN_SECS);
        Self {
            cooldown: TimeDelta::seconds(secs),
        }
    }

    /// Decide one incoming event.
    ///
    /// The hint window is updated for every event, sent or not. Cooldown
    /// applies to idle and permission kinds; typing only to idle.
    pub fn evaluate(
        &self,
        log: &mut NotifyLog,
        kind: NotificationKind,
        typing: bool,
        now: DateTime<Utc>,
    ) -> Decision {
        let window = TimeDelta::seconds(HINT_WINDOW_SECS);
        log.recent_event_timestamps.push(now);
        log.recent_event_timestamps
            .retain(|ts| now.signed_duration_since(*ts) < window);
        let show_hint = log.recent_event_timestamps.len() >= HINT_THRESHOLD;

        if let Some(last) = log.last_sent(kind) {
            let elapsed = now.signed_duration_since(last);
            if elapsed < self.cooldown {
                let remaining_secs = (self.cooldown - elapsed).num_seconds();
                return Decision {
                    show_hint,
                    verdict: Verdict::Suppress(SuppressReason::Cooldown { remaining_secs }),
                };
            }
        }

        if kind == NotificationKind::Idle && typing {
            return Decision {
                show_hint,
                verdict: Verdict::Suppress(SuppressReason::Typing),
            };
        }

        Decision {
            show_hint,
            verdict: Verdict::Send,
        }
    }

    pub fn mark_sent(log: &mut NotifyLog, kind: NotificationKind, now: DateTime<Utc>) {
        match kind {
            NotificationKind::Idle => log.last_idle_sent_at = Some(now),
            NotificationKind::Permission => log.last_permission_sent_at = Some(now),
            _ => {}
        }
    }
}
