use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::Config;
use crate::registry::Registry;

#[derive(Parser, Debug)]
#[command(
    name = "tmuxgram",
    about = "Drive and watch tmux-hosted coding agents from Telegram",
    version,
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Launch options when no subcommand is given
    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchArgs {
    /// Session name (letters, digits and hyphens)
    #[arg(long)]
    pub name: Option<String>,

    /// Arguments passed to the agent, after `--`
    #[arg(last = true)]
    pub agent_args: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the agent in a new tmux session (the default)
    Launch(LaunchArgs),

    /// Run the Telegram relay in the foreground
    Relay,

    /// Handle one agent notification hook event from stdin
    Notify,

    /// List registered sessions that are still running
    Sessions {
        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Set the bot token and install the notification hook
    Setup,

    /// Show effective configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn config_source_label(config_path: Option<&Path>) -> String {
    match config_path {
        Some(path) => path.display().to_string(),
        None => "(defaults, no config.toml found)".to_string(),
    }
}

pub fn render_config_human(config: &Config, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Telegram\n");
    push_kv(
        &mut output,
        "bot_token",
        config.masked_token().as_deref().unwrap_or("(not set)"),
    );
    push_kv(
        &mut output,
        "chat_id",
        config.chat_id.as_deref().unwrap_or("(unclaimed)"),
    );
    output.push('\n');

    output.push_str("Sessions\n");
    push_kv(&mut output, "agent", &config.agent);
    push_kv(&mut output, "session_prefix", &config.session_prefix);
    push_kv(
        &mut output,
        "target_pane",
        config.target_pane.as_deref().unwrap_or("(session)"),
    );
    output.push('\n');

    output.push_str("Notifications\n");
    push_kv(&mut output, "idle", config.notify_on.idle);
    push_kv(&mut output, "permission", config.notify_on.permission);
    push_kv(&mut output, "idle_cooldown_secs", config.idle_cooldown_secs);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &Config, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "telegram": {
            "bot_token": config.masked_token(),
            "chat_id": &config.chat_id,
        },
        "sessions": {
            "agent": &config.agent,
            "session_prefix": &config.session_prefix,
            "target_pane": &config.target_pane,
        },
        "notifications": {
            "idle": config.notify_on.idle,
            "permission": config.notify_on.permission,
            "idle_cooldown_secs": config.idle_cooldown_secs,
        },
        "source_path": config_source_label(config_path),
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

pub fn render_sessions_human(registry: &Registry) -> String {
    if registry.sessions.is_empty() {
        return "No active sessions.\n".to_string();
    }

    let mut output = String::new();
    for (name, session) in registry.sessions.iter() {
        let marker = if registry.active.as_deref() == Some(name) {
            "*"
        } else {
            " "
        };
        output.push_str(&format!(
            "{marker} {name:<24} {:<20} {}\n",
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
            session.cwd
        ));
    }
    output
}

pub fn render_sessions_json(registry: &Registry) -> Result<String> {
    serde_json::to_string_pretty(registry).context("failed to serialize sessions to JSON")
}
