use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::paths::write_atomic;

pub const BOT_TOKEN_ENV: &str = "TMUXGRAM_BOT_TOKEN";
pub const CHAT_ID_ENV: &str = "TMUXGRAM_CHAT_ID";

static BOT_TOKEN_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+:[A-Za-z0-9_-]{35,}$").expect("token pattern is valid"));

/// True if `token` looks like a Bot API token (`123456:ABC-DEF...`).
pub fn is_valid_bot_token(token: &str) -> bool {
    BOT_TOKEN_FORMAT.is_match(token)
}

/// Which notification kinds are forwarded.
///
/// ```toml
/// [notify_on]
/// idle = true
/// permission = false
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct NotifyOn {
    #[serde(default = "default_true")]
    pub idle: bool,
    #[serde(default = "default_true")]
    pub permission: bool,
}

impl Default for NotifyOn {
    fn default() -> Self {
        Self {
            idle: default_true(),
            permission: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_agent() -> String {
    "claude".to_string()
}

fn default_session_prefix() -> String {
    "claude".to_string()
}

fn default_idle_cooldown_secs() -> u64 {
    180
}

/// Chat ids are numbers in the Bot API; accept either form in the file.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    }))
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub chat_id: Option<String>,
    /// Program started inside each new session.
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// Explicit tmux target (e.g. `%3`) used instead of the session name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pane: Option<String>,
    #[serde(default = "default_idle_cooldown_secs")]
    pub idle_cooldown_secs: u64,
    #[serde(default)]
    pub notify_on: NotifyOn,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            agent: default_agent(),
            session_prefix: default_session_prefix(),
            target_pane: None,
            idle_cooldown_secs: default_idle_cooldown_secs(),
            notify_on: NotifyOn::default(),
        }
    }
}

impl Config {
    /// Load `path` (defaults if absent) and apply environment overrides.
    pub fn load(path: &Path) -> Result<(Self, Option<PathBuf>)> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`] with an injectable environment lookup.
    pub fn load_with(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, Option<PathBuf>)> {
        let (mut config, source) = match Self::read_file(path)? {
            Some(config) => (config, Some(path.to_path_buf())),
            None => (Self::default(), None),
        };
        config.apply_overrides(env);
        Ok((config, source))
    }

    /// The file as written, without environment overrides. `None` if absent.
    pub fn read_file(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.normalize();
        Ok(Some(config))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        write_atomic(path, contents.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Persist the claimed chat id, leaving the rest of the file as written.
    pub fn save_chat_id(path: &Path, chat_id: &str) -> Result<()> {
        let mut config = Self::read_file(path)?.unwrap_or_default();
        config.chat_id = Some(chat_id.to_string());
        config.save(path)
    }

    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(token) = env(BOT_TOKEN_ENV).filter(|v| !v.trim().is_empty()) {
            self.bot_token = Some(token);
        }
        if let Some(chat_id) = env(CHAT_ID_ENV).filter(|v| !v.trim().is_empty()) {
            self.chat_id = Some(chat_id);
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        for field in [&mut self.bot_token, &mut self.chat_id, &mut self.target_pane] {
            if let Some(value) = field.as_mut() {
                *value = value.trim().to_string();
            }
            if field.as_deref().is_some_and(str::is_empty) {
                *field = None;
            }
        }
    }

    /// The bot token, checked for presence and shape.
    pub fn require_bot_token(&self) -> Result<&str> {
        let Some(token) = self.bot_token.as_deref() else {
            bail!("bot token is not set; run `tmuxgram setup` or set {BOT_TOKEN_ENV}");
        };
        if !is_valid_bot_token(token) {
            bail!("bot token format is invalid; it should look like 123456:ABC-DEF...");
        }
        Ok(token)
    }

    /// The token with everything after the bot id hidden.
    pub fn masked_token(&self) -> Option<String> {
        self.bot_token.as_deref().map(|token| match token.split_once(':') {
            Some((id, _)) => format!("{id}:****"),
            None => "****".to_string(),
        })
    }
}
