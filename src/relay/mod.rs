//! Routes chat messages to the active tmux session.
//!
//! `tmuxgram relay` long-polls the Bot API and hands each message to
//! [`Relay::handle`]. The active session is resolved from the registry on
//! every message, so launchers and notifiers in other processes can change it
//! at any time. Every failure is answered in the chat and recorded in the
//! event log; only a duplicate poller stops the loop.

pub mod command;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::launcher;
use crate::log::{EventLog, LogEvent};
use crate::paths::{Paths, expand_home};
use crate::registry::{SessionRegistry, is_valid_session_name};
use crate::screen::{escape_html, tail};
use crate::telegram::{
    ChatApi, MAX_MESSAGE_CHARS, Message, POLL_TIMEOUT_SECS, TelegramClient, TelegramError,
    TextFormat,
};
use crate::tmux::{self, Terminal, TmuxTerminal};

pub use command::ChatCommand;

const SCREEN_LINES: u32 = 40;
const SCREEN_CHARS: usize = 3800;
const PLAN_SCAN_LINES: u32 = 50;
const PLAN_CHUNK_CHARS: usize = 3800;
/// Enough Up presses to reach the top of any menu the agent shows.
const MENU_RESET_PRESSES: u32 = 10;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

static PLAN_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"~/\.claude/plans/[^\s]+\.md").expect("plan path pattern is valid"));

const HELP_TEXT: &str = "<b>tmuxgram commands:</b>

/allow - Approve a permission prompt
/deny - Deny a permission prompt
/1, /2, ... - Select a numbered option
/stop - Send Ctrl+C to interrupt the agent
/escape - Send Escape key
/status - Show all active sessions
/sessions - Same as /status
/switch &lt;name&gt; - Switch active session
/rename &lt;name&gt; - Rename the active session
/screen - Show recent terminal output
/plan - View the current plan
/help - Show this message

Any other text is sent as input to the active session.";

/// Why a command could not reach a session.
enum Unavailable {
    NoActive,
    Gone(String),
}

pub struct Relay {
    config: Config,
    config_path: PathBuf,
    registry: SessionRegistry,
    terminal: Box<dyn Terminal>,
    events: EventLog,
    uploads_dir: PathBuf,
    home: Option<PathBuf>,
    /// Unix seconds; older messages were sent before this relay started.
    started_at: i64,
}

impl Relay {
    pub fn new(config: Config, paths: &Paths, terminal: Box<dyn Terminal>) -> Self {
        Self {
            config,
            config_path: paths.config(),
            registry: SessionRegistry::new(paths.registry()),
            terminal,
            events: EventLog::open(&paths.event_log()),
            uploads_dir: paths.uploads_dir(),
            home: std::env::var_os("HOME").map(PathBuf::from),
            started_at: Utc::now().timestamp(),
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Handle one inbound message. Never fails; problems are reported back
    /// to the chat and to the event log.
    pub fn handle(&mut self, api: &dyn ChatApi, msg: &Message) {
        if msg.date < self.started_at {
            debug!(message_id = msg.message_id, "dropping message sent before startup");
            return;
        }

        let chat_id = msg.chat.id.to_string();
        match self.config.chat_id.as_deref() {
            None => {
                self.claim_chat(api, &chat_id);
                return;
            }
            Some(configured) if configured != chat_id => {
                warn!(chat_id = %chat_id, "message from unauthorized chat");
                self.send(
                    api,
                    &chat_id,
                    "⛔ Unauthorized. This bot is configured for a different chat.",
                    TextFormat::Plain,
                );
                return;
            }
            Some(_) => {}
        }

        if let Some(photo) = msg.largest_photo() {
            self.handle_photo(api, &chat_id, &photo.file_id, msg.caption.as_deref());
            return;
        }

        let Some(text) = msg.text.as_deref() else {
            return;
        };

        if text.starts_with('/') {
            let command = text.split_whitespace().next().unwrap_or(text);
            let active = self.active_session();
            self.events.record(
                active.as_deref(),
                LogEvent::CommandReceived {
                    command: command.to_string(),
                },
            );
        }

        match ChatCommand::parse(text) {
            ChatCommand::Stop => self.handle_keystroke(api, &chat_id, Keystroke::Interrupt),
            ChatCommand::Allow => self.handle_keystroke(api, &chat_id, Keystroke::Approve),
            ChatCommand::Deny => self.handle_keystroke(api, &chat_id, Keystroke::Deny),
            ChatCommand::Escape => self.handle_keystroke(api, &chat_id, Keystroke::Escape),
            ChatCommand::Status | ChatCommand::Sessions => self.handle_status(api, &chat_id),
            ChatCommand::Screen => self.handle_screen(api, &chat_id),
            ChatCommand::Plan => self.handle_plan(api, &chat_id),
            ChatCommand::Switch(target) => self.handle_switch(api, &chat_id, target.as_deref()),
            ChatCommand::Rename(name) => self.handle_rename(api, &chat_id, name.as_deref()),
            ChatCommand::Help => self.send(api, &chat_id, HELP_TEXT, TextFormat::Html),
            ChatCommand::SelectOption(n) => self.handle_select_option(api, &chat_id, n),
            ChatCommand::Input(text) => self.handle_input(api, &chat_id, &text),
        }
    }

    fn send(&self, api: &dyn ChatApi, chat_id: &str, text: &str, format: TextFormat) {
        if let Err(e) = api.send_message(chat_id, text, format) {
            warn!(error = %e, "failed to send reply");
        }
    }

    fn claim_chat(&mut self, api: &dyn ChatApi, chat_id: &str) {
        info!(chat_id = %chat_id, "claiming chat");
        self.config.chat_id = Some(chat_id.to_string());
        if let Err(e) = Config::save_chat_id(&self.config_path, chat_id) {
            warn!(error = %format!("{e:#}"), "failed to persist chat id");
            self.events.record(
                None,
                LogEvent::Error {
                    message: format!("failed to save chat id: {e:#}"),
                },
            );
        }
        self.send(
            api,
            chat_id,
            "✅ Chat ID saved. You will now receive notifications here.\n\nSend /help to see available commands.",
            TextFormat::Plain,
        );
    }

    /// Active session after pruning dead ones.
    fn active_session(&self) -> Option<String> {
        let terminal = self.terminal.as_ref();
        let alive = |name: &str| terminal.session_exists(name);
        match self.registry.get_active(&alive) {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "failed to prune session registry");
                self.registry.load().active
            }
        }
    }

    fn live_session(&self) -> Result<String, Unavailable> {
        let active = self.active_session().ok_or(Unavailable::NoActive)?;
        if self.terminal.session_exists(&active) {
            Ok(active)
        } else {
            Err(Unavailable::Gone(active))
        }
    }

    fn target<'a>(&'a self, session: &'a str) -> &'a str {
        tmux::target(session, self.config.target_pane.as_deref())
    }

    /// Short notice used by the keystroke commands.
    fn report_unavailable(&self, api: &dyn ChatApi, chat_id: &str, why: Unavailable) {
        let text = match why {
            Unavailable::NoActive => "⚠️ No active sessions.",
            Unavailable::Gone(_) => "⚠️ Session not found.",
        };
        self.send(api, chat_id, text, TextFormat::Plain);
    }

    /// Notice used before typing into a session; a vanished session is
    /// dropped from the registry.
    fn report_unavailable_for_input(&self, api: &dyn ChatApi, chat_id: &str, why: Unavailable) {
        let text = match why {
            Unavailable::NoActive => {
                "⚠️ No active sessions. Start one with: <code>tmuxgram</code>".to_string()
            }
            Unavailable::Gone(name) => {
                if let Err(e) = self.registry.unregister(&name) {
                    warn!(session = %name, error = %e, "failed to unregister dead session");
                }
                format!(
                    "⚠️ Session <code>{}</code> is no longer running.",
                    escape_html(&name)
                )
            }
        };
        self.send(api, chat_id, &text, TextFormat::Html);
    }

    fn report_failure(
        &self,
        api: &dyn ChatApi,
        chat_id: &str,
        session: Option<&str>,
        action: &str,
        error: &str,
    ) {
        warn!(session = session.unwrap_or("-"), error = %error, "{action} failed");
        self.events.record(
            session,
            LogEvent::Error {
                message: format!("{action} failed: {error}"),
            },
        );
        self.send(api, chat_id, &format!("❌ Failed to {action}: {error}"), TextFormat::Plain);
    }

    fn handle_input(&self, api: &dyn ChatApi, chat_id: &str, text: &str) {
        let session = match self.live_session() {
            Ok(s) => s,
            Err(why) => return self.report_unavailable_for_input(api, chat_id, why),
        };

        match self.terminal.send_keys(self.target(&session), text) {
            Ok(()) => {
                self.events.record(
                    Some(&session),
                    LogEvent::InputSent {
                        length: text.chars().count(),
                    },
                );
                self.send(
                    api,
                    chat_id,
                    &format!(
                        "📤 [{}] Sent:\n<code>{}</code>",
                        escape_html(&session),
                        escape_html(text)
                    ),
                    TextFormat::Html,
                );
            }
            Err(e) => self.report_failure(api, chat_id, Some(&session), "send", &e.to_string()),
        }
    }

    fn handle_photo(&self, api: &dyn ChatApi, chat_id: &str, file_id: &str, caption: Option<&str>) {
        let session = match self.live_session() {
            Ok(s) => s,
            Err(why) => return self.report_unavailable_for_input(api, chat_id, why),
        };

        let saved = match api.download_file(file_id, &self.uploads_dir) {
            Ok(path) => path,
            Err(e) => {
                return self.report_failure(
                    api,
                    chat_id,
                    Some(&session),
                    "download photo",
                    &e.to_string(),
                );
            }
        };

        let input = photo_input(caption, &saved);
        if let Err(e) = self.terminal.send_keys(self.target(&session), &input) {
            return self.report_failure(api, chat_id, Some(&session), "send photo", &e.to_string());
        }

        self.events.record(
            Some(&session),
            LogEvent::InputSent {
                length: input.chars().count(),
            },
        );
        let file_name = saved
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.send(
            api,
            chat_id,
            &format!(
                "📷 [{}] Saved photo to <code>{}</code> and sent it to {}.",
                escape_html(&session),
                escape_html(&file_name),
                escape_html(&self.config.agent)
            ),
            TextFormat::Html,
        );
    }

    fn handle_keystroke(&self, api: &dyn ChatApi, chat_id: &str, key: Keystroke) {
        let session = match self.live_session() {
            Ok(s) => s,
            Err(why) => return self.report_unavailable(api, chat_id, why),
        };

        let target = self.target(&session);
        let result = match key {
            Keystroke::Interrupt => self.terminal.send_interrupt(target),
            Keystroke::Approve => self.terminal.send_enter(target),
            Keystroke::Deny | Keystroke::Escape => self.terminal.send_escape(target),
        };

        match result {
            Ok(()) => self.send(
                api,
                chat_id,
                &format!("{} [{}] {}", key.icon(), escape_html(&session), key.done()),
                TextFormat::Html,
            ),
            Err(e) => self.report_failure(api, chat_id, Some(&session), key.action(), &e.to_string()),
        }
    }

    fn handle_select_option(&self, api: &dyn ChatApi, chat_id: &str, number: u32) {
        let session = match self.live_session() {
            Ok(s) => s,
            Err(why) => return self.report_unavailable(api, chat_id, why),
        };

        let target = self.target(&session);
        let result = self
            .terminal
            .send_arrow_up(target, MENU_RESET_PRESSES)
            .and_then(|()| match number {
                1 => Ok(()),
                n => self.terminal.send_arrow_down(target, n - 1),
            })
            .and_then(|()| self.terminal.send_enter(target));

        match result {
            Ok(()) => {
                self.events
                    .record(Some(&session), LogEvent::OptionSelected { number });
                self.send(
                    api,
                    chat_id,
                    &format!("✅ [{}] Selected option {number}", escape_html(&session)),
                    TextFormat::Html,
                );
            }
            Err(e) => {
                self.report_failure(api, chat_id, Some(&session), "select option", &e.to_string())
            }
        }
    }

    fn handle_status(&self, api: &dyn ChatApi, chat_id: &str) {
        let terminal = self.terminal.as_ref();
        let alive = |name: &str| terminal.session_exists(name);
        let registry = match self.registry.list(&alive) {
            Ok(registry) => registry,
            Err(e) => {
                warn!(error = %e, "failed to prune session registry");
                self.registry.load()
            }
        };

        if registry.sessions.is_empty() {
            return self.send(api, chat_id, "🔴 No active sessions.", TextFormat::Plain);
        }

        let mut lines = vec![
            format!("🟢 <b>{} active session(s):</b>", registry.sessions.len()),
            String::new(),
        ];
        for name in registry.sessions.names() {
            if registry.active.as_deref() == Some(name) {
                lines.push(format!("🟢 <code>{}</code> ◀ active", escape_html(name)));
            } else {
                lines.push(format!("🟢 <code>/switch {}</code>", escape_html(name)));
            }
        }
        self.send(api, chat_id, &lines.join("\n"), TextFormat::Html);
    }

    fn handle_switch(&self, api: &dyn ChatApi, chat_id: &str, target: Option<&str>) {
        let Some(target) = target else {
            return self.send(
                api,
                chat_id,
                "Usage: <code>/switch claude-0214-1352</code>",
                TextFormat::Html,
            );
        };

        let terminal = self.terminal.as_ref();
        let alive = |name: &str| terminal.session_exists(name);
        let switched = match self.registry.list(&alive) {
            Ok(registry) if registry.contains(target) => self.registry.set_active(target),
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };

        match switched {
            Ok(true) => {
                info!(session = %target, "switched active session");
                self.send(
                    api,
                    chat_id,
                    &format!("✅ Switched to <code>{}</code>", escape_html(target)),
                    TextFormat::Html,
                );
            }
            Ok(false) => {
                let available = self
                    .registry
                    .load()
                    .sessions
                    .names()
                    .map(|n| format!("<code>{}</code>", escape_html(n)))
                    .collect::<Vec<_>>()
                    .join(", ");
                self.send(
                    api,
                    chat_id,
                    &format!(
                        "⚠️ Session <code>{}</code> not found.\n\nAvailable: {available}",
                        escape_html(target)
                    ),
                    TextFormat::Html,
                );
            }
            Err(e) => self.report_failure(api, chat_id, None, "switch", &e.to_string()),
        }
    }

    fn handle_screen(&self, api: &dyn ChatApi, chat_id: &str) {
        let session = match self.live_session() {
            Ok(s) => s,
            Err(Unavailable::NoActive) => {
                return self.send(api, chat_id, "⚠️ No active sessions.", TextFormat::Plain);
            }
            Err(Unavailable::Gone(name)) => {
                return self.send(
                    api,
                    chat_id,
                    &format!(
                        "⚠️ Session <code>{}</code> is no longer running.",
                        escape_html(&name)
                    ),
                    TextFormat::Html,
                );
            }
        };

        let output = match self.terminal.capture_pane(self.target(&session), SCREEN_LINES) {
            Ok(output) => output,
            Err(e) => {
                return self.report_failure(api, chat_id, Some(&session), "capture screen", &e.to_string());
            }
        };

        let trimmed = output.trim();
        let text = if trimmed.is_empty() {
            format!("<i>[{}] Screen is empty</i>", escape_html(&session))
        } else {
            format!(
                "<b>[{}]</b>\n<pre>{}</pre>",
                escape_html(&session),
                escape_html(&tail(trimmed, SCREEN_CHARS))
            )
        };
        self.send(api, chat_id, &text, TextFormat::Html);
    }

    fn handle_plan(&self, api: &dyn ChatApi, chat_id: &str) {
        let session = match self.live_session() {
            Ok(s) => s,
            Err(why) => return self.report_unavailable(api, chat_id, why),
        };

        let plan = match self.read_plan(&session) {
            Ok(plan) => plan,
            Err(e) => {
                return self.report_failure(api, chat_id, Some(&session), "read plan", &format!("{e:#}"));
            }
        };

        let Some((shown_path, content)) = plan else {
            return self.send(
                api,
                chat_id,
                "⚠️ No plan file found in terminal. Is there a plan approval prompt visible?",
                TextFormat::Plain,
            );
        };

        if content.is_empty() {
            return self.send(api, chat_id, "<i>Plan file is empty.</i>", TextFormat::Html);
        }

        self.events
            .record(Some(&session), LogEvent::PlanViewed { path: shown_path });
        let title = format!("📋 [{}] Plan", escape_html(&session));
        for chunk in plan_messages(&title, &content) {
            self.send(api, chat_id, &chunk, TextFormat::Html);
        }
    }

    /// The plan path visible on screen and the trimmed file content.
    fn read_plan(&self, session: &str) -> Result<Option<(String, String)>> {
        let screen = self
            .terminal
            .capture_pane(self.target(session), PLAN_SCAN_LINES)?;
        let Some(found) = PLAN_PATH.find(&screen) else {
            return Ok(None);
        };
        let shown = found.as_str().to_string();
        let path = expand_home(&shown, self.home.as_deref());
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some((shown, content.trim().to_string())))
    }

    fn handle_rename(&self, api: &dyn ChatApi, chat_id: &str, new_name: Option<&str>) {
        let Some(new_name) = new_name else {
            return self.send(api, chat_id, "Usage: <code>/rename my-project</code>", TextFormat::Html);
        };

        if !is_valid_session_name(new_name) {
            return self.send(
                api,
                chat_id,
                "⚠️ Invalid name. Use only letters, numbers, and hyphens.",
                TextFormat::Plain,
            );
        }

        let Some(active) = self.active_session() else {
            return self.send(api, chat_id, "⚠️ No active sessions.", TextFormat::Plain);
        };

        if self.registry.load().contains(new_name) {
            return self.send(
                api,
                chat_id,
                &format!("⚠️ Name <code>{}</code> is already in use.", escape_html(new_name)),
                TextFormat::Html,
            );
        }

        match self.rename_session(&active, new_name) {
            Ok(()) => {
                info!(from = %active, to = %new_name, "renamed session");
                self.send(
                    api,
                    chat_id,
                    &format!(
                        "✅ Renamed <code>{}</code> → <code>{}</code>",
                        escape_html(&active),
                        escape_html(new_name)
                    ),
                    TextFormat::Html,
                );
            }
            Err(e) => self.report_failure(api, chat_id, Some(&active), "rename", &format!("{e:#}")),
        }
    }

    /// Rename in tmux, then in the registry. If the registry rejects the
    /// rename, the tmux rename is undone so the two stay in step.
    fn rename_session(&self, old: &str, new: &str) -> Result<()> {
        self.terminal.rename_session(old, new)?;

        let outcome = self.registry.rename(old, new);
        if matches!(outcome, Ok(true)) {
            return Ok(());
        }

        if let Err(e) = self.terminal.rename_session(new, old) {
            warn!(from = %new, to = %old, error = %e, "failed to roll back tmux rename");
        }
        match outcome {
            Err(e) => Err(e).context("failed to update session registry"),
            _ => bail!("session {old} changed while it was being renamed"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Keystroke {
    Interrupt,
    Approve,
    Deny,
    Escape,
}

impl Keystroke {
    fn icon(self) -> &'static str {
        match self {
            Self::Interrupt | Self::Escape => "⏹",
            Self::Approve => "✅",
            Self::Deny => "❌",
        }
    }

    fn done(self) -> &'static str {
        match self {
            Self::Interrupt => "Sent Ctrl+C",
            Self::Approve => "Approved permission",
            Self::Deny => "Denied permission",
            Self::Escape => "Sent Escape",
        }
    }

    fn action(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Approve => "approve",
            Self::Deny => "deny",
            Self::Escape => "send Escape",
        }
    }
}

fn photo_input(caption: Option<&str>, saved: &Path) -> String {
    match caption.map(str::trim).filter(|c| !c.is_empty()) {
        Some(caption) => format!("{caption} (see image: {})", saved.display()),
        None => format!("Please look at this image: {}", saved.display()),
    }
}

/// Messages for a long document: one titled `<pre>` block if it fits,
/// otherwise line-aligned chunks with the title on the first.
fn plan_messages(title: &str, content: &str) -> Vec<String> {
    let escaped = escape_html(content);
    let single = format!("<b>{title}</b>\n<pre>{escaped}</pre>");
    if single.chars().count() <= MAX_MESSAGE_CHARS {
        return vec![single];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;
    for line in escaped.split('\n') {
        let line_chars = line.chars().count();
        if current_chars > 0 && current_chars + line_chars + 1 > PLAN_CHUNK_CHARS {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if current_chars > 0 {
            current.push('\n');
            current_chars += 1;
        }
        current.push_str(line);
        current_chars += line_chars;
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(idx, chunk)| {
            if idx == 0 {
                format!("<b>{title}</b>\n<pre>{chunk}</pre>")
            } else {
                format!("<pre>{chunk}</pre>")
            }
        })
        .collect()
}

/// Sleep up to `total`, waking early once `stop` is set.
fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < total && !stop.load(Ordering::SeqCst) {
        thread::sleep(step);
        waited += step;
    }
}

/// Poll the Bot API until `stop` is set.
///
/// A second relay polling with the same token is fatal; any other poll error
/// is logged and retried after a pause.
pub fn run(config: Config, paths: &Paths, stop: Arc<AtomicBool>) -> Result<()> {
    let client = TelegramClient::new(config.require_bot_token()?);
    let mut relay = Relay::new(config, paths, Box::new(TmuxTerminal));
    let pid = std::process::id();

    relay.events().record(None, LogEvent::RelayStarted { pid });
    info!(pid, "relay running, waiting for messages");

    let mut offset = 0;
    let outcome = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        match client.get_updates(offset, POLL_TIMEOUT_SECS) {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    if let Some(message) = &update.message {
                        relay.handle(&client, message);
                    }
                }
            }
            Err(TelegramError::Conflict) => {
                break Err(anyhow!(TelegramError::Conflict));
            }
            Err(e) => {
                warn!(error = %e, "polling error");
                relay.events().record(
                    None,
                    LogEvent::Error {
                        message: format!("polling error: {e}"),
                    },
                );
                sleep_unless_stopped(POLL_ERROR_BACKOFF, &stop);
            }
        }
    };

    let reason = match &outcome {
        Ok(()) => "shutdown".to_string(),
        Err(e) => e.to_string(),
    };
    info!(reason = %reason, "relay stopped");
    relay.events().record(None, LogEvent::RelayStopped { reason });
    launcher::release_relay_pid(&paths.relay_pid(), pid);

    outcome
}
