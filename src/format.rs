//! Telegram HTML rendering of notifications.

use crate::hook::{HookEvent, NotificationKind};
use crate::screen::{self, escape_html};

/// Screen excerpts longer than this keep only their tail.
pub const SCREEN_EXCERPT_CHARS: usize = 3200;

pub const HINT_FOOTER: &str = "Tip: /stop to interrupt, /help for commands";
pub const PERMISSION_FOOTER: &str = "/allow to approve, /deny to reject";
pub const INPUT_FOOTER: &str = "Reply here to send input";

fn header(kind: NotificationKind) -> (&'static str, &'static str) {
    match kind {
        NotificationKind::Permission => ("🔐", "Permission needed"),
        NotificationKind::Elicitation => ("❓", "Question for you"),
        NotificationKind::Idle | NotificationKind::Other => ("⏳", "Waiting for input"),
    }
}

/// Render one notification.
///
/// `structured` marks `screen` as already-extracted text (a transcript
/// message) that is shown as is. Raw pane captures go through the dialog
/// or message extractor depending on the notification kind.
pub fn format_notification(
    event: &HookEvent,
    session: Option<&str>,
    screen: Option<&str>,
    show_hint: bool,
    structured: bool,
) -> String {
    let kind = event.kind();
    let (icon, title) = header(kind);

    let tag = session
        .filter(|s| !s.is_empty())
        .map(|s| format!("[{}] ", escape_html(s)))
        .unwrap_or_default();

    let mut parts = vec![format!("{icon} {tag}<b>{}</b>", escape_html(title))];
    if let Some(title) = event.title() {
        parts.push(format!("<b>{}</b>", escape_html(title)));
    }
    if let Some(message) = event.message() {
        parts.push(escape_html(message));
    }

    let mut option_count = None;
    if let Some(content) = screen.filter(|s| !s.is_empty()) {
        let display = if structured {
            content.to_string()
        } else if kind.is_dialog() {
            screen::extract_permission_dialog(content)
        } else {
            screen::extract_last_message(content)
        };

        if !display.is_empty() {
            if kind.is_dialog() {
                option_count = screen::extract_options(&display)
                    .last()
                    .map(|o| o.number);
            }
            parts.push(String::new());
            parts.push(format!(
                "<pre>{}</pre>",
                escape_html(&screen::tail(&display, SCREEN_EXCERPT_CHARS))
            ));
        }
    }

    let footer = if show_hint {
        HINT_FOOTER.to_string()
    } else if let Some(last) = option_count {
        format!("Reply /1–/{last} to choose an option")
    } else if kind == NotificationKind::Permission {
        PERMISSION_FOOTER.to_string()
    } else {
        INPUT_FOOTER.to_string()
    };
    parts.push(String::new());
    parts.push(format!("<i>{footer}</i>"));

    parts.join("\n")
}
