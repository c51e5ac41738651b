//! Notifier: one lifecycle hook event in, at most one chat alert out.
//!
//! The agent runs `tmuxgram notify` for every notification it raises. The
//! process resolves which session raised it, asks the gate whether the user
//! should hear about it, gathers the best available content (transcript or
//! screen) and sends one formatted message. Nothing here is fatal: the hook
//! always exits 0 so the agent is never disturbed.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::Config;
use crate::format::format_notification;
use crate::gate::{Gate, NotifyLogStore, SuppressReason, Verdict};
use crate::hook::{HookEvent, NotificationKind};
use crate::log::{EventLog, LogEvent};
use crate::paths::Paths;
use crate::registry::SessionRegistry;
use crate::screen;
use crate::telegram::{ChatApi, TelegramClient, TextFormat, send_message_with_retry};
use crate::tmux::{self, Terminal, TmuxTerminal};
use crate::transcript;

/// Lines captured when the screen is the content.
const CONTENT_LINES: u32 = 50;
/// Lines captured to find the input prompt for the typing check.
const PROMPT_PROBE_LINES: u32 = 5;

/// What became of one hook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not for us, or not configured to be forwarded.
    Ignored(&'static str),
    Suppressed(SuppressReason),
    Sent,
    Failed(String),
}

pub struct Notifier<'a> {
    registry: SessionRegistry,
    gate_log: NotifyLogStore,
    events: EventLog,
    terminal: &'a dyn Terminal,
    chat: &'a dyn ChatApi,
}

impl<'a> Notifier<'a> {
    pub fn new(paths: &Paths, terminal: &'a dyn Terminal, chat: &'a dyn ChatApi) -> Self {
        Self {
            registry: SessionRegistry::new(paths.registry()),
            gate_log: NotifyLogStore::new(paths.notify_log()),
            events: EventLog::open(&paths.event_log()),
            terminal,
            chat,
        }
    }

    pub fn notify(&self, event: &HookEvent, config: &Config, now: DateTime<Utc>) -> Outcome {
        let Some(chat_id) = config.chat_id.as_deref() else {
            return Outcome::Ignored("no chat id configured");
        };
        if !event.is_notification() {
            return Outcome::Ignored("not a notification event");
        }

        let kind = event.kind();
        match kind {
            NotificationKind::Idle if !config.notify_on.idle => {
                return Outcome::Ignored("idle notifications disabled");
            }
            NotificationKind::Permission if !config.notify_on.permission => {
                return Outcome::Ignored("permission notifications disabled");
            }
            _ => {}
        }

        let session = self.resolve_session(event.cwd());
        let target = session
            .as_deref()
            .map(|s| tmux::target(s, config.target_pane.as_deref()));

        let typing = kind == NotificationKind::Idle
            && target.is_some_and(|t| self.user_is_typing(t));

        let mut log = self.gate_log.load();
        let decision = Gate::new(config.idle_cooldown_secs).evaluate(&mut log, kind, typing, now);
        if let Err(e) = self.gate_log.save(&log) {
            warn!(path = %self.gate_log.path().display(), error = %e, "failed to save notify log");
        }

        if let Verdict::Suppress(reason) = decision.verdict {
            debug!(kind = kind.as_str(), reason = %reason, "notification suppressed");
            self.events.record(
                session.as_deref(),
                LogEvent::NotificationSuppressed {
                    kind: kind.as_str().to_string(),
                    reason: reason.to_string(),
                },
            );
            return Outcome::Suppressed(reason);
        }

        let (content, structured) = self.content(event, kind, target);
        let message = format_notification(
            event,
            session.as_deref(),
            content.as_deref(),
            decision.show_hint,
            structured,
        );

        match send_message_with_retry(self.chat, chat_id, &message, TextFormat::Html) {
            Ok(()) => {
                if let Err(e) = self.gate_log.record_sent(kind, now) {
                    warn!(error = %e, "failed to record sent notification");
                }
                self.events.record(
                    session.as_deref(),
                    LogEvent::NotificationSent {
                        kind: kind.as_str().to_string(),
                    },
                );
                Outcome::Sent
            }
            Err(e) => {
                warn!(error = %e, "failed to send notification");
                self.events.record(
                    session.as_deref(),
                    LogEvent::Error {
                        message: format!("notification send failed: {e}"),
                    },
                );
                Outcome::Failed(e.to_string())
            }
        }
    }

    /// Session for `cwd` (falling back to the active one), made active.
    fn resolve_session(&self, cwd: Option<&str>) -> Option<String> {
        let terminal = self.terminal;
        let alive = |name: &str| terminal.session_exists(name);
        let session = match self.registry.find_by_cwd(cwd, &alive) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "failed to read session registry");
                None
            }
        }?;
        if let Err(e) = self.registry.set_active(&session) {
            warn!(session = %session, error = %e, "failed to mark session active");
        }
        Some(session)
    }

    fn user_is_typing(&self, target: &str) -> bool {
        match self.terminal.capture_pane(target, PROMPT_PROBE_LINES) {
            Ok(screen) => screen::last_prompt_line(&screen).is_some_and(screen::is_typing),
            Err(e) => {
                debug!(target = %target, error = %e, "prompt probe failed");
                false
            }
        }
    }

    fn capture(&self, target: Option<&str>) -> Option<String> {
        let target = target?;
        match self.terminal.capture_pane(target, CONTENT_LINES) {
            Ok(screen) => Some(screen.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) => {
                debug!(target = %target, error = %e, "screen capture failed");
                None
            }
        }
    }

    /// Alert body and whether it is already extracted text.
    ///
    /// Permission prompts are only visible on screen. Everything else
    /// prefers the transcript's last assistant message.
    fn content(
        &self,
        event: &HookEvent,
        kind: NotificationKind,
        target: Option<&str>,
    ) -> (Option<String>, bool) {
        if kind == NotificationKind::Permission {
            return (self.capture(target), false);
        }

        let from_transcript = event
            .transcript_path()
            .and_then(|path| transcript::last_assistant_message(Path::new(path)));
        match from_transcript {
            Some(text) => (Some(text), true),
            None => (self.capture(target), false),
        }
    }
}

/// Handle one raw hook payload end to end.
pub fn run(paths: &Paths, input: &str) -> Outcome {
    let event = match HookEvent::parse(input) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "unparseable hook payload");
            return Outcome::Ignored("unparseable hook payload");
        }
    };

    let config = match Config::load(&paths.config()) {
        Ok((config, _)) => config,
        Err(e) => {
            debug!(error = %format!("{e:#}"), "configuration unavailable");
            return Outcome::Ignored("configuration unavailable");
        }
    };
    let token = match config.require_bot_token() {
        Ok(token) => token,
        Err(e) => {
            debug!(error = %format!("{e:#}"), "no usable bot token");
            return Outcome::Ignored("no usable bot token");
        }
    };

    let client = TelegramClient::new(token);
    Notifier::new(paths, &TmuxTerminal, &client).notify(&event, &config, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChat, FakeTerminal, TerminalState};
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    struct Fixture {
        tmp: tempfile::TempDir,
        paths: Paths,
        terminal: Rc<RefCell<TerminalState>>,
        config: Config,
    }

    /// Sessions `a` (cwd `/work/a`) and `b` (cwd `/work/b`), `b` active.
    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("home"));
        let registry = SessionRegistry::new(paths.registry());
        registry.register("a", "/work/a").unwrap();
        registry.register("b", "/work/b").unwrap();

        let terminal = Rc::new(RefCell::new(TerminalState {
            alive: vec!["a".to_string(), "b".to_string()],
            ..TerminalState::default()
        }));
        let config = Config {
            chat_id: Some("42".to_string()),
            ..Config::default()
        };
        Fixture {
            tmp,
            paths,
            terminal,
            config,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(kind: &str, cwd: &str) -> HookEvent {
        HookEvent {
            hook_event_name: "Notification".to_string(),
            notification_type: Some(kind.to_string()),
            cwd: Some(cwd.to_string()),
            message: Some("Claude is waiting for your input".to_string()),
            ..HookEvent::default()
        }
    }

    fn notify(fx: &Fixture, chat: &FakeChat, event: &HookEvent, now: DateTime<Utc>) -> Outcome {
        let terminal = FakeTerminal(fx.terminal.clone());
        Notifier::new(&fx.paths, &terminal, chat).notify(event, &fx.config, now)
    }

    #[test]
    fn idle_alert_uses_screen_of_matching_session() {
        let fx = fixture();
        fx.terminal.borrow_mut().screen =
            "● All tests pass now.\n\n────────────\n❯ \n────────────".to_string();
        let chat = FakeChat::default();

        let outcome = notify(&fx, &chat, &event("idle_prompt", "/work/a"), at(0));

        assert_eq!(outcome, Outcome::Sent);
        let (chat_id, text, format) = chat.sent.borrow()[0].clone();
        assert_eq!(chat_id, "42");
        assert_eq!(format, TextFormat::Html);
        assert!(text.starts_with("⏳ [a] <b>Waiting for input</b>"));
        assert!(text.contains("All tests pass now."));
        assert!(text.ends_with("<i>Reply here to send input</i>"));

        let registry = SessionRegistry::new(fx.paths.registry()).load();
        assert_eq!(registry.active.as_deref(), Some("a"));
        let log = NotifyLogStore::new(fx.paths.notify_log()).load();
        assert_eq!(log.last_idle_sent_at, Some(at(0)));
    }

    #[test]
    fn unknown_cwd_falls_back_to_active_session() {
        let fx = fixture();
        let chat = FakeChat::default();

        notify(&fx, &chat, &event("idle_prompt", "/elsewhere"), at(0));

        assert!(chat.last().contains("[b]"));
    }

    #[test]
    fn permission_alert_shows_dialog_and_options() {
        let fx = fixture();
        fx.terminal.borrow_mut().screen = [
            "● Running the build",
            "────────────────────────",
            " Bash command",
            "   cargo build",
            " Do you want to proceed?",
            " ❯ 1. Yes",
            "   2. No, and tell Claude what to do differently",
        ]
        .join("\n");
        let chat = FakeChat::default();

        let outcome = notify(&fx, &chat, &event("permission_prompt", "/work/b"), at(0));

        assert_eq!(outcome, Outcome::Sent);
        let text = chat.last();
        assert!(text.starts_with("🔐 [b] <b>Permission needed</b>"));
        assert!(text.contains("cargo build"));
        assert!(text.ends_with("<i>Reply /1–/2 to choose an option</i>"));
        assert_eq!(fx.terminal.borrow().calls, vec!["capture b 50"]);
    }

    #[test]
    fn transcript_is_preferred_for_idle_alerts() {
        let fx = fixture();
        fx.terminal.borrow_mut().screen = "screen text".to_string();
        let transcript_path = fx.tmp.path().join("t.jsonl");
        let mut file = std::fs::File::create(&transcript_path).unwrap();
        writeln!(
            file,
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"Done <b>refactoring</b>"}}]}}}}"#
        )
        .unwrap();
        let mut hook = event("idle_prompt", "/work/a");
        hook.transcript_path = Some(transcript_path.display().to_string());
        let chat = FakeChat::default();

        notify(&fx, &chat, &hook, at(0));

        let text = chat.last();
        assert!(text.contains("<pre>Done &lt;b&gt;refactoring&lt;/b&gt;</pre>"));
        assert!(!text.contains("screen text"));
    }

    #[test]
    fn cooldown_suppresses_repeat_idle_alerts() {
        let fx = fixture();
        let chat = FakeChat::default();
        let idle = event("idle_prompt", "/work/a");

        assert_eq!(notify(&fx, &chat, &idle, at(0)), Outcome::Sent);
        assert_eq!(
            notify(&fx, &chat, &idle, at(100)),
            Outcome::Suppressed(SuppressReason::Cooldown { remaining_secs: 80 })
        );
        assert_eq!(notify(&fx, &chat, &idle, at(180)), Outcome::Sent);
        assert_eq!(chat.texts().len(), 2);

        let logged = std::fs::read_to_string(fx.paths.event_log()).unwrap();
        assert!(logged.contains("\"notification_suppressed\""));
    }

    #[test]
    fn typing_suppresses_idle_but_not_permission() {
        let fx = fixture();
        fx.terminal.borrow_mut().screen = "────\n❯ half-written reply\n────".to_string();
        let chat = FakeChat::default();

        assert_eq!(
            notify(&fx, &chat, &event("idle_prompt", "/work/a"), at(0)),
            Outcome::Suppressed(SuppressReason::Typing)
        );
        assert_eq!(
            notify(&fx, &chat, &event("permission_prompt", "/work/a"), at(1)),
            Outcome::Sent
        );
    }

    #[test]
    fn third_event_in_a_minute_adds_hint() {
        let fx = fixture();
        let chat = FakeChat::default();

        notify(&fx, &chat, &event("elicitation_dialog", "/work/a"), at(0));
        notify(&fx, &chat, &event("elicitation_dialog", "/work/a"), at(10));
        notify(&fx, &chat, &event("elicitation_dialog", "/work/a"), at(20));

        let texts = chat.texts();
        assert_eq!(texts.len(), 3);
        assert!(!texts[1].contains("Tip:"));
        assert!(texts[2].ends_with("<i>Tip: /stop to interrupt, /help for commands</i>"));
    }

    #[test]
    fn disabled_kinds_and_other_events_are_ignored() {
        let mut fx = fixture();
        fx.config.notify_on.idle = false;
        let chat = FakeChat::default();

        assert_eq!(
            notify(&fx, &chat, &event("idle_prompt", "/work/a"), at(0)),
            Outcome::Ignored("idle notifications disabled")
        );

        let mut stop = event("idle_prompt", "/work/a");
        stop.hook_event_name = "Stop".to_string();
        assert_eq!(
            notify(&fx, &chat, &stop, at(0)),
            Outcome::Ignored("not a notification event")
        );

        fx.config.chat_id = None;
        assert_eq!(
            notify(&fx, &chat, &event("permission_prompt", "/work/a"), at(0)),
            Outcome::Ignored("no chat id configured")
        );
        assert!(chat.texts().is_empty());
        assert!(!fx.paths.notify_log().exists());
    }

    #[test]
    fn failed_send_does_not_start_cooldown() {
        let fx = fixture();
        let chat = FakeChat {
            fail_sends: true,
            ..FakeChat::default()
        };

        let outcome = notify(&fx, &chat, &event("permission_prompt", "/work/a"), at(0));

        assert!(matches!(outcome, Outcome::Failed(ref e) if e.contains("connection refused")));
        let log = NotifyLogStore::new(fx.paths.notify_log()).load();
        assert_eq!(log.last_permission_sent_at, None);
        assert_eq!(log.recent_event_timestamps, vec![at(0)]);
    }

    #[test]
    fn without_sessions_alert_has_no_tag() {
        let fx = fixture();
        fx.terminal.borrow_mut().alive.clear();
        let chat = FakeChat::default();

        notify(&fx, &chat, &event("idle_prompt", "/work/a"), at(0));

        assert!(chat.last().starts_with("⏳ <b>Waiting for input</b>"));
        assert!(fx.terminal.borrow().calls.is_empty());
    }

    #[test]
    fn run_ignores_garbage_and_missing_config() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());

        assert_eq!(run(&paths, "{not json"), Outcome::Ignored("unparseable hook payload"));
        assert_eq!(
            run(&paths, r#"{"hook_event_name":"Notification"}"#),
            Outcome::Ignored("no usable bot token")
        );
    }
}
