//! `tmuxgram setup`: bot token prompt, config write and agent hook install.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};

use crate::config::{Config, is_valid_bot_token};
use crate::paths::{Paths, write_atomic};
use crate::telegram::TelegramClient;

/// Notification types the hook is registered for.
pub const NOTIFY_MATCHER: &str = "idle_prompt|permission_prompt|elicitation_dialog";
const HOOK_TIMEOUT_SECS: u64 = 10;
const HOOK_EVENT: &str = "Notification";

#[derive(Debug, Default)]
pub struct InstallSummary {
    pub created_or_updated: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
}

/// True if `program` can be spawned at all.
pub fn command_exists(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// The hook command line for this executable.
pub fn notify_command(exe: &Path) -> String {
    let exe = exe.display().to_string();
    if exe.contains(char::is_whitespace) {
        format!("\"{exe}\" notify")
    } else {
        format!("{exe} notify")
    }
}

fn is_our_hook(command: &str) -> bool {
    command.contains("tmuxgram") && command.trim_end().ends_with(" notify")
}

fn group_has_our_hook(group: &Value) -> bool {
    group
        .get("hooks")
        .and_then(Value::as_array)
        .is_some_and(|hooks| {
            hooks.iter().any(|hook| {
                hook.get("command")
                    .and_then(Value::as_str)
                    .is_some_and(is_our_hook)
            })
        })
}

/// Register `command` as a `Notification` hook in the agent's settings file.
///
/// Other settings and hooks are kept. An existing tmuxgram notify hook
/// leaves the file untouched.
pub fn install_notification_hook(settings_path: &Path, command: &str) -> Result<InstallSummary> {
    let mut summary = InstallSummary::default();

    let mut settings = match fs::read_to_string(settings_path) {
        Ok(contents) if contents.trim().is_empty() => Value::Object(Map::new()),
        Ok(contents) => serde_json::from_str(&contents).with_context(|| {
            format!(
                "failed to parse {}; fix or remove it and rerun setup",
                settings_path.display()
            )
        })?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", settings_path.display()));
        }
    };

    let Some(root) = settings.as_object_mut() else {
        bail!("{} is not a JSON object", settings_path.display());
    };
    let Some(hooks) = root
        .entry("hooks")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
    else {
        bail!("\"hooks\" in {} is not an object", settings_path.display());
    };
    let Some(groups) = hooks
        .entry(HOOK_EVENT)
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
    else {
        bail!(
            "\"hooks.{HOOK_EVENT}\" in {} is not an array",
            settings_path.display()
        );
    };

    if groups.iter().any(group_has_our_hook) {
        summary.unchanged.push(settings_path.to_path_buf());
        return Ok(summary);
    }

    groups.push(json!({
        "matcher": NOTIFY_MATCHER,
        "hooks": [{
            "type": "command",
            "command": command,
            "timeout": HOOK_TIMEOUT_SECS,
        }],
    }));

    let mut contents =
        serde_json::to_string_pretty(&settings).context("failed to serialize settings")?;
    contents.push('\n');
    write_atomic(settings_path, contents.as_bytes())
        .with_context(|| format!("failed to write {}", settings_path.display()))?;
    summary.created_or_updated.push(settings_path.to_path_buf());

    Ok(summary)
}

/// Store `token` in the config file, keeping every other field.
pub fn write_bot_token(config_path: &Path, token: &str) -> Result<()> {
    let mut config = Config::read_file(config_path)?.unwrap_or_default();
    config.bot_token = Some(token.to_string());
    config.save(config_path)
}

fn prompt_bot_token(existing: Option<&str>) -> Result<String> {
    if let Some(existing) = existing.filter(|t| is_valid_bot_token(t)) {
        let keep = dialoguer::Confirm::new()
            .with_prompt("  Keep the bot token already configured?")
            .default(true)
            .interact()
            .context("failed to read confirmation")?;
        if keep {
            return Ok(existing.to_string());
        }
    }

    let token: String = dialoguer::Input::new()
        .with_prompt("  Telegram bot token (from @BotFather)")
        .validate_with(|input: &String| -> Result<(), String> {
            if is_valid_bot_token(input.trim()) {
                Ok(())
            } else {
                Err("Invalid token format. It should look like 123456:ABC-DEF1234ghIkl-zyx57W2v1u123ew11".to_string())
            }
        })
        .interact_text()
        .context("failed to read bot token")?;

    Ok(token.trim().to_string())
}

fn verify_bot_token(token: &str) {
    let should_verify = dialoguer::Confirm::new()
        .with_prompt("  Check the token with Telegram now?")
        .default(true)
        .interact()
        .unwrap_or(false);
    if !should_verify {
        return;
    }

    match TelegramClient::new(token).get_me() {
        Ok(bot) => match bot.username {
            Some(name) => println!("  ✅ Connected to @{name}"),
            None => println!("  ✅ Token accepted"),
        },
        Err(e) => {
            println!("  ⚠️ Verification failed: {e}");
            println!("  The token will still be saved. You can rerun setup later.");
        }
    }
}

/// Interactive setup. `home` locates the agent's `~/.claude/settings.json`.
pub fn run_setup(paths: &Paths, home: &Path) -> Result<()> {
    println!();
    println!("tmuxgram setup");
    println!();
    println!("  1. Open Telegram and message @BotFather");
    println!("  2. Send /newbot and follow the prompts");
    println!("  3. Paste the bot token below");
    println!();

    let config_path = paths.config();
    let existing = Config::read_file(&config_path)?;
    let token = prompt_bot_token(existing.as_ref().and_then(|c| c.bot_token.as_deref()))?;
    verify_bot_token(&token);

    write_bot_token(&config_path, &token)?;
    println!("  Saved config to {}", config_path.display());

    let exe = std::env::current_exe().context("failed to locate the tmuxgram executable")?;
    let settings_path = home.join(".claude").join("settings.json");
    let summary = install_notification_hook(&settings_path, &notify_command(&exe))?;
    for path in &summary.created_or_updated {
        println!("  updated:   {} (notification hook)", path.display());
    }
    for path in &summary.unchanged {
        println!("  unchanged: {} (hook already installed)", path.display());
    }

    println!();
    println!("Next: run `tmuxgram` in a project, then send any message to your bot.");
    println!("The first chat to write to the bot is saved as the notification target.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "123456:ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghi";
    const COMMAND: &str = "/usr/local/bin/tmuxgram notify";

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn installs_hook_into_fresh_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".claude").join("settings.json");

        let summary = install_notification_hook(&path, COMMAND).unwrap();

        assert_eq!(summary.created_or_updated, vec![path.clone()]);
        let settings = read_json(&path);
        let group = &settings["hooks"]["Notification"][0];
        assert_eq!(group["matcher"], NOTIFY_MATCHER);
        assert_eq!(group["hooks"][0]["type"], "command");
        assert_eq!(group["hooks"][0]["command"], COMMAND);
        assert_eq!(group["hooks"][0]["timeout"], 10);
    }

    #[test]
    fn install_is_idempotent_on_rerun() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");

        install_notification_hook(&path, COMMAND).unwrap();
        let before = fs::read_to_string(&path).unwrap();
        let second = install_notification_hook(&path, "/other/path/tmuxgram notify").unwrap();

        assert!(second.created_or_updated.is_empty());
        assert_eq!(second.unchanged, vec![path.clone()]);
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn keeps_existing_settings_and_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        fs::write(
            &path,
            r#"{"model":"opus","hooks":{"Stop":[{"hooks":[{"type":"command","command":"say done"}]}],
                "Notification":[{"hooks":[{"type":"command","command":"notify-send hi"}]}]}}"#,
        )
        .unwrap();

        install_notification_hook(&path, COMMAND).unwrap();

        let settings = read_json(&path);
        assert_eq!(settings["model"], "opus");
        assert_eq!(settings["hooks"]["Stop"][0]["hooks"][0]["command"], "say done");
        let groups = settings["hooks"]["Notification"].as_array().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1]["hooks"][0]["command"], COMMAND);
    }

    #[test]
    fn refuses_to_overwrite_unparseable_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let err = install_notification_hook(&path, COMMAND).unwrap_err();

        assert!(format!("{err:#}").contains("failed to parse"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn rejects_unexpected_shapes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");

        fs::write(&path, "[]").unwrap();
        assert!(install_notification_hook(&path, COMMAND).is_err());

        fs::write(&path, r#"{"hooks":{"Notification":{}}}"#).unwrap();
        assert!(install_notification_hook(&path, COMMAND).is_err());
    }

    #[test]
    fn notify_command_quotes_paths_with_spaces() {
        assert_eq!(
            notify_command(Path::new("/opt/tmuxgram/bin/tmuxgram")),
            "/opt/tmuxgram/bin/tmuxgram notify"
        );
        assert_eq!(
            notify_command(Path::new("/Users/me/My Tools/tmuxgram")),
            "\"/Users/me/My Tools/tmuxgram\" notify"
        );
        assert!(is_our_hook(&notify_command(Path::new("/Users/me/My Tools/tmuxgram"))));
        assert!(!is_our_hook("tmuxgram relay"));
    }

    #[test]
    fn write_bot_token_keeps_other_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "chat_id = \"42\"\nagent = \"codex\"\n").unwrap();

        write_bot_token(&path, TOKEN).unwrap();

        let config = Config::read_file(&path).unwrap().unwrap();
        assert_eq!(config.bot_token.as_deref(), Some(TOKEN));
        assert_eq!(config.chat_id.as_deref(), Some("42"));
        assert_eq!(config.agent, "codex");
    }

    #[test]
    fn command_exists_detects_missing_program() {
        assert!(!command_exists(
            "definitely-missing-tmuxgram-test-command",
            &["--version"]
        ));
    }
}
