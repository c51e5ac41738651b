//! Launcher: one tmux session per invocation, plus the shared relay's
//! lifecycle.
//!
//! The first launcher starts the relay in the background and records its pid
//! in `relay.pid`. The last launcher to exit, finding no live sessions left,
//! stops it again. Nothing is locked; a stale pid file is simply replaced.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result, bail};
use chrono::Local;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::install::command_exists;
use crate::log::{EventLog, LogEvent};
use crate::paths::{HOME_ENV, Paths, write_atomic};
use crate::registry::{Liveness, SessionRegistry, is_valid_session_name};
use crate::tmux::{self, TmuxLiveness};

/// Pid stored in `path`, if the file holds one.
pub fn read_relay_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 checks existence and permissions without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => unsafe { libc::kill(pid, libc::SIGTERM) == 0 },
        _ => false,
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}

/// Pid of the running relay. A pid file naming a dead process is removed.
fn running_relay(pid_path: &Path) -> Option<u32> {
    let pid = read_relay_pid(pid_path)?;
    if is_process_alive(pid) {
        return Some(pid);
    }
    debug!(pid, "removing stale relay pid file");
    let _ = fs::remove_file(pid_path);
    None
}

/// Remove the pid file if it still names `pid`.
///
/// Called by the relay on the way out, so a newer relay's file survives.
pub fn release_relay_pid(pid_path: &Path, pid: u32) {
    if read_relay_pid(pid_path) == Some(pid) {
        if let Err(e) = fs::remove_file(pid_path) {
            warn!(path = %pid_path.display(), error = %e, "failed to remove relay pid file");
        }
    }
}

/// Start the relay unless one is already running. Returns its pid.
pub fn ensure_relay(paths: &Paths) -> Result<u32> {
    let pid_path = paths.relay_pid();
    if let Some(pid) = running_relay(&pid_path) {
        debug!(pid, "relay already running");
        return Ok(pid);
    }

    let log_dir = paths.logs_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let relay_log = paths.relay_log();
    let stdout_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&relay_log)
        .with_context(|| format!("failed to open {}", relay_log.display()))?;
    let stderr_log = stdout_log.try_clone()?;

    let exe = std::env::current_exe().context("failed to locate the tmuxgram executable")?;
    let mut cmd = Command::new(exe);
    cmd.arg("relay")
        .env(HOME_ENV, paths.root())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log));
    #[cfg(unix)]
    {
        // Keep terminal signals aimed at the launcher away from the relay.
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd.spawn().context("failed to start the relay")?;
    let pid = child.id();

    write_atomic(&pid_path, format!("{pid}\n").as_bytes())
        .with_context(|| format!("failed to write {}", pid_path.display()))?;
    info!(pid, log = %relay_log.display(), "relay started in background");
    Ok(pid)
}

/// Stop the relay when no registered session is alive any more.
///
/// Returns `true` if a stop was attempted.
pub fn stop_relay_if_idle(
    paths: &Paths,
    liveness: &dyn Liveness,
    events: &EventLog,
) -> Result<bool> {
    let registry = SessionRegistry::new(paths.registry());
    let remaining = registry.prune(liveness)?;
    if !remaining.sessions.is_empty() {
        debug!(sessions = remaining.sessions.len(), "sessions still running, relay stays up");
        return Ok(false);
    }

    let pid_path = paths.relay_pid();
    let Some(pid) = read_relay_pid(&pid_path) else {
        return Ok(false);
    };
    if terminate(pid) {
        info!(pid, "relay stopped, no sessions left");
        events.record(
            None,
            LogEvent::RelayStopped {
                reason: "no sessions left".to_string(),
            },
        );
    } else {
        debug!(pid, "relay was not running");
    }
    let _ = fs::remove_file(&pid_path);
    Ok(true)
}

/// Reject a `--name` that is malformed or already in use by a live session.
pub fn check_custom_name(
    registry: &SessionRegistry,
    name: &str,
    liveness: &dyn Liveness,
) -> Result<()> {
    if !is_valid_session_name(name) {
        bail!(
            "invalid session name \"{name}\": use letters, digits and hyphens, starting with a letter or digit"
        );
    }
    if registry.load().contains(name) && liveness.is_alive(name) {
        bail!(
            "Session \"{name}\" already exists. Pick a different name or use /rename from Telegram."
        );
    }
    Ok(())
}

/// Run the agent in a new tmux session and block until it exits.
pub fn run(
    name: Option<String>,
    agent_args: Vec<String>,
    config: &Config,
    paths: &Paths,
) -> Result<()> {
    let registry = SessionRegistry::new(paths.registry());
    let events = EventLog::open(&paths.event_log());

    if let Some(name) = name.as_deref() {
        check_custom_name(&registry, name, &TmuxLiveness)?;
    }
    config.require_bot_token()?;

    let version = tmux::check_tmux().context("tmux is required; install it and retry")?;
    debug!(version = %version, "tmux found");
    if !command_exists(&config.agent, &["--version"]) {
        bail!("`{}` was not found on PATH", config.agent);
    }

    ensure_relay(paths)?;

    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    let cwd = cwd.to_string_lossy().into_owned();
    let session = name.unwrap_or_else(|| {
        registry.next_name(&config.session_prefix, Local::now().naive_local())
    });

    registry.register(&session, &cwd)?;
    events.record(Some(&session), LogEvent::SessionStarted { cwd: cwd.clone() });

    let status = tmux::new_session_attached(&session, &cwd, &config.agent, &agent_args);
    let exit_code = status.as_ref().ok().and_then(ExitStatus::code);
    events.record(Some(&session), LogEvent::SessionStopped { exit_code });
    info!(session = %session, exit_code = ?exit_code, "session ended");

    if let Err(e) = registry.unregister(&session) {
        warn!(session = %session, error = %e, "failed to unregister session");
    }
    if let Err(e) = stop_relay_if_idle(paths, &TmuxLiveness, &events) {
        warn!(error = %format!("{e:#}"), "failed to check relay shutdown");
    }

    status.with_context(|| format!("failed to start tmux session {session}"))?;
    Ok(())
}
