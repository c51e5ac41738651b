//! Telegram Bot API client over blocking HTTPS (`ureq`).
//!
//! Only the handful of methods the relay and notifier need: `getUpdates`
//! long polling, `sendMessage`, `getFile` plus the file download, and `getMe`
//! for setup-time token checks.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

const API_BASE: &str = "https://api.telegram.org";

/// Server-side long-poll timeout for `getUpdates`.
pub const POLL_TIMEOUT_SECS: u64 = 10;
/// Hard Bot API limit for one message.
pub const MAX_MESSAGE_CHARS: usize = 4096;
/// Delays before each retry of a failed send.
pub const RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(0), Duration::from_millis(500)];

#[derive(Debug, Error)]
pub enum TelegramError {
    /// Another client is polling with the same token.
    #[error("another relay is already polling with this bot token")]
    Conflict,
    #[error("Telegram API error: {0}")]
    Api(String),
    #[error("Telegram returned HTTP {status}: {description}")]
    Status { status: u16, description: String },
    #[error("request to Telegram failed: {0}")]
    Transport(String),
    #[error("invalid response from Telegram: {0}")]
    Decode(String),
    #[error("failed to save download to {}: {source}", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How `sendMessage` should interpret the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Html,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, TelegramError> {
        if !self.ok {
            return Err(TelegramError::Api(
                self.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        self.result
            .ok_or_else(|| TelegramError::Decode("missing result".to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: i64,
    /// Unix seconds.
    pub date: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    /// Sizes of one photo, smallest first.
    #[serde(default)]
    pub photo: Vec<PhotoSize>,
}

impl Message {
    pub fn largest_photo(&self) -> Option<&PhotoSize> {
        self.photo.last()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteFile {
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// Outbound chat operations. [`TelegramClient`] talks to the Bot API; tests
/// use an in-memory recorder.
pub trait ChatApi {
    fn send_message(&self, chat_id: &str, text: &str, format: TextFormat) -> Result<(), TelegramError>;

    /// Download a file into `dir` and return where it was saved.
    fn download_file(&self, file_id: &str, dir: &Path) -> Result<PathBuf, TelegramError>;
}

pub struct TelegramClient {
    token: String,
    base: String,
    agent: ureq::Agent,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(POLL_TIMEOUT_SECS + 20))
            .build();
        Self {
            token: token.into(),
            base: API_BASE.to_string(),
            agent,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base, self.token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{file_path}", self.base, self.token)
    }

    fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TelegramError> {
        match self.agent.post(&self.api_url(method)).send_json(body) {
            Ok(response) => response
                .into_json::<ApiResponse<T>>()
                .map_err(|e| TelegramError::Decode(e.to_string()))?
                .into_result(),
            Err(ureq::Error::Status(409, _)) => Err(TelegramError::Conflict),
            Err(ureq::Error::Status(status, response)) => {
                let description = response
                    .into_json::<ApiResponse<IgnoredAny>>()
                    .ok()
                    .and_then(|r| r.description)
                    .unwrap_or_default();
                Err(TelegramError::Status {
                    status,
                    description,
                })
            }
            Err(ureq::Error::Transport(t)) => Err(TelegramError::Transport(t.to_string())),
        }
    }

    /// Long-poll for updates after `offset`.
    pub fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }),
        )
    }

    pub fn get_me(&self) -> Result<BotUser, TelegramError> {
        self.call("getMe", json!({}))
    }
}

impl ChatApi for TelegramClient {
    fn send_message(&self, chat_id: &str, text: &str, format: TextFormat) -> Result<(), TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if format == TextFormat::Html {
            body["parse_mode"] = json!("HTML");
        }
        let _: IgnoredAny = self.call("sendMessage", body)?;
        debug!(chat_id = chat_id, length = text.len(), "message sent");
        Ok(())
    }

    fn download_file(&self, file_id: &str, dir: &Path) -> Result<PathBuf, TelegramError> {
        let remote: RemoteFile = self.call("getFile", json!({ "file_id": file_id }))?;
        let file_path = remote
            .file_path
            .ok_or_else(|| TelegramError::Decode("getFile returned no file_path".to_string()))?;

        let dest = dir.join(download_name(&file_path, chrono::Utc::now().timestamp_millis()));
        let save_err = |source| TelegramError::Save {
            path: dest.clone(),
            source,
        };

        let response = match self.agent.get(&self.file_url(&file_path)).call() {
            Ok(r) => r,
            Err(ureq::Error::Status(status, _)) => {
                return Err(TelegramError::Status {
                    status,
                    description: "file download failed".to_string(),
                });
            }
            Err(ureq::Error::Transport(t)) => return Err(TelegramError::Transport(t.to_string())),
        };

        fs::create_dir_all(dir).map_err(save_err)?;
        let mut out = File::create(&dest).map_err(save_err)?;
        io::copy(&mut response.into_reader(), &mut out).map_err(save_err)?;
        Ok(dest)
    }
}

/// Local name for a downloaded file: `telegram-<millis>.<ext>`, keeping the
/// remote extension (`.jpg` when there is none).
pub fn download_name(remote_path: &str, millis: i64) -> String {
    let ext = Path::new(remote_path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or("jpg");
    format!("telegram-{millis}.{ext}")
}

/// Run `op`, retrying after each delay in `delays` while it fails.
pub fn retry_with_delays<T, E: std::fmt::Display>(
    delays: &[Duration],
    mut sleep: impl FnMut(Duration),
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut result = op();
    for delay in delays {
        match &result {
            Ok(_) => break,
            Err(e) => {
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "send failed, retrying");
                sleep(*delay);
                result = op();
            }
        }
    }
    result
}

/// `sendMessage` with up to two retries.
pub fn send_message_with_retry(
    api: &dyn ChatApi,
    chat_id: &str,
    text: &str,
    format: TextFormat,
) -> Result<(), TelegramError> {
    retry_with_delays(&RETRY_DELAYS, thread::sleep, || {
        api.send_message(chat_id, text, format)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[test]
    fn api_url_embeds_token_and_method() {
        let client = TelegramClient::new("123:ABC");
        assert_eq!(
            client.api_url("getUpdates"),
            "https://api.telegram.org/bot123:ABC/getUpdates"
        );
        assert_eq!(
            client.file_url("photos/file_1.jpg"),
            "https://api.telegram.org/file/bot123:ABC/photos/file_1.jpg"
        );
    }

    #[test]
    fn parses_update_batch() {
        let body = r#"{"ok":true,"result":[
            {"update_id":10,"message":{"message_id":1,"date":1700000000,"chat":{"id":42,"type":"private"},"text":"/stop"}},
            {"update_id":11,"message":{"message_id":2,"date":1700000001,"chat":{"id":42},"caption":"look",
                "photo":[{"file_id":"small","width":90,"height":90},{"file_id":"big","width":1280,"height":960}]}},
            {"update_id":12,"edited_message":{"message_id":1}}
        ]}"#;
        let parsed: ApiResponse<Vec<Update>> = serde_json::from_str(body).unwrap();
        let updates = parsed.into_result().unwrap();

        assert_eq!(updates.len(), 3);
        let first = updates[0].message.as_ref().unwrap();
        assert_eq!(first.chat.id, 42);
        assert_eq!(first.text.as_deref(), Some("/stop"));

        let photo = updates[1].message.as_ref().unwrap();
        assert_eq!(photo.largest_photo().unwrap().file_id, "big");
        assert_eq!(photo.caption.as_deref(), Some("look"));
        assert!(updates[2].message.is_none());
    }

    #[test]
    fn error_envelope_becomes_api_error() {
        let parsed: ApiResponse<IgnoredAny> =
            serde_json::from_str(r#"{"ok":false,"description":"Bad Request: chat not found"}"#).unwrap();
        let err = parsed.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Telegram API error: Bad Request: chat not found");
    }

    #[test]
    fn download_names_keep_extension() {
        assert_eq!(download_name("photos/file_7.png", 5), "telegram-5.png");
        assert_eq!(download_name("photos/file_7", 5), "telegram-5.jpg");
    }

    #[test]
    fn retry_waits_zero_then_half_second() {
        let attempts = Cell::new(0);
        let slept = RefCell::new(Vec::new());
        let result: Result<(), String> = retry_with_delays(
            &RETRY_DELAYS,
            |d| slept.borrow_mut().push(d),
            || {
                attempts.set(attempts.get() + 1);
                Err("down".to_string())
            },
        );

        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);
        assert_eq!(
            *slept.borrow(),
            vec![Duration::from_millis(0), Duration::from_millis(500)]
        );
    }

    #[test]
    fn retry_stops_after_success() {
        let attempts = Cell::new(0);
        let slept = RefCell::new(Vec::new());
        let result: Result<u32, String> = retry_with_delays(
            &RETRY_DELAYS,
            |d| slept.borrow_mut().push(d),
            || {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok(7)
                }
            },
        );

        assert_eq!(result, Ok(7));
        assert_eq!(attempts.get(), 2);
        assert_eq!(slept.borrow().len(), 1);
    }
}
