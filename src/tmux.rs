//! tmux bridge.
//!
//! Wraps the tmux CLI as a narrow command protocol: liveness checks, literal
//! keystroke injection, named control keys, scrollback capture, and session
//! rename. Every call is synchronous and blocks until tmux returns.
//!
//! Failures are typed so callers can tell "the session went away" apart from
//! "tmux itself is broken" and re-check liveness instead of retrying blindly.

use std::ffi::OsStr;
use std::io;
use std::process::{Command, ExitStatus, Output};

use thiserror::Error;
use tracing::{debug, info};

use crate::registry::Liveness;

/// Clears the current input line before injected text.
const KEY_CLEAR_LINE: &str = "C-u";
const KEY_SUBMIT: &str = "Enter";
const KEY_INTERRUPT: &str = "C-c";
const KEY_ESCAPE: &str = "Escape";
const KEY_UP: &str = "Up";
const KEY_DOWN: &str = "Down";

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux is not available: {0}")]
    Unavailable(#[source] io::Error),
    #[error("tmux target '{target}' not found")]
    TargetNotFound { target: String },
    #[error("tmux {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

impl TmuxError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TargetNotFound { .. })
    }
}

/// Pick the tmux target: an explicit pane override wins over the session name.
pub fn target<'a>(session: &'a str, pane: Option<&'a str>) -> &'a str {
    match pane {
        Some(p) if !p.trim().is_empty() => p,
        _ => session,
    }
}

fn run_tmux<I, S>(args: I) -> Result<Output, TmuxError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new("tmux")
        .args(args)
        .output()
        .map_err(TmuxError::Unavailable)
}

fn stderr_means_missing_target(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    [
        "can't find session",
        "can't find pane",
        "can't find window",
        "session not found",
        "no server running",
    ]
    .iter()
    .any(|needle| stderr.contains(needle))
}

fn check(command: &str, target: &str, output: Output) -> Result<Output, TmuxError> {
    if output.status.success() {
        return Ok(output);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr_means_missing_target(&stderr) {
        Err(TmuxError::TargetNotFound {
            target: target.to_string(),
        })
    } else {
        Err(TmuxError::CommandFailed {
            command: command.to_string(),
            stderr,
        })
    }
}

/// Check that tmux is installed and reachable. Returns the version banner.
pub fn check_tmux() -> Result<String, TmuxError> {
    let output = check("-V", "", run_tmux(["-V"])?)?;
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(version = %version, "tmux found");
    Ok(version)
}

/// Check if a tmux session exists.
pub fn session_exists(session: &str) -> bool {
    run_tmux(["has-session", "-t", session])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn send_key(target: &str, key: &str) -> Result<(), TmuxError> {
    check(
        "send-keys",
        target,
        run_tmux(["send-keys", "-t", target, key])?,
    )?;
    Ok(())
}

/// Type `text` into the target and submit it.
///
/// The line is cleared first so the text never lands on top of a half-typed
/// draft. `-l` keeps tmux from interpreting key names inside the text, and
/// `--` stops text starting with `-` from being parsed as a flag.
pub fn send_keys(target: &str, text: &str) -> Result<(), TmuxError> {
    send_key(target, KEY_CLEAR_LINE)?;
    check(
        "send-keys",
        target,
        run_tmux(["send-keys", "-t", target, "-l", "--", text])?,
    )?;
    send_key(target, KEY_SUBMIT)?;
    debug!(target = target, length = text.len(), "sent keys");
    Ok(())
}

/// Capture the last `lines` lines of the target's scrollback, top to bottom.
///
/// Output is returned as tmux printed it; surrounding whitespace is kept.
pub fn capture_pane(target: &str, lines: u32) -> Result<String, TmuxError> {
    let start = format!("-{lines}");
    let output = check(
        "capture-pane",
        target,
        run_tmux(["capture-pane", "-t", target, "-p", "-S", start.as_str()])?,
    )?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub fn send_interrupt(target: &str) -> Result<(), TmuxError> {
    send_key(target, KEY_INTERRUPT)
}

pub fn send_escape(target: &str) -> Result<(), TmuxError> {
    send_key(target, KEY_ESCAPE)
}

pub fn send_enter(target: &str) -> Result<(), TmuxError> {
    send_key(target, KEY_SUBMIT)
}

/// One `send-keys` call per keystroke; menus drop batched arrows.
pub fn send_arrow_up(target: &str, count: u32) -> Result<(), TmuxError> {
    for _ in 0..count {
        send_key(target, KEY_UP)?;
    }
    Ok(())
}

pub fn send_arrow_down(target: &str, count: u32) -> Result<(), TmuxError> {
    for _ in 0..count {
        send_key(target, KEY_DOWN)?;
    }
    Ok(())
}

/// Rename at the tmux level only; the registry must be renamed separately.
pub fn rename_session(old: &str, new: &str) -> Result<(), TmuxError> {
    check(
        "rename-session",
        old,
        run_tmux(["rename-session", "-t", old, new])?,
    )?;
    info!(from = old, to = new, "tmux session renamed");
    Ok(())
}

/// Create a session running `program args...` and attach the current
/// terminal to it. Blocks until the client detaches or the program exits.
///
/// `TMUX` is cleared so launching from inside another tmux client works.
pub fn new_session_attached(
    session: &str,
    work_dir: &str,
    program: &str,
    args: &[String],
) -> Result<ExitStatus, TmuxError> {
    info!(session = session, program = program, "starting tmux session");
    Command::new("tmux")
        .args(["new-session", "-s", session, "-c", work_dir])
        .arg(program)
        .args(args)
        .env_remove("TMUX")
        .status()
        .map_err(TmuxError::Unavailable)
}

/// Terminal operations the relay drives. [`TmuxTerminal`] forwards to the
/// free functions above; tests substitute a recording fake.
pub trait Terminal {
    fn session_exists(&self, session: &str) -> bool;
    fn send_keys(&self, target: &str, text: &str) -> Result<(), TmuxError>;
    fn capture_pane(&self, target: &str, lines: u32) -> Result<String, TmuxError>;
    fn send_interrupt(&self, target: &str) -> Result<(), TmuxError>;
    fn send_escape(&self, target: &str) -> Result<(), TmuxError>;
    fn send_enter(&self, target: &str) -> Result<(), TmuxError>;
    fn send_arrow_up(&self, target: &str, count: u32) -> Result<(), TmuxError>;
    fn send_arrow_down(&self, target: &str, count: u32) -> Result<(), TmuxError>;
    fn rename_session(&self, old: &str, new: &str) -> Result<(), TmuxError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TmuxTerminal;

impl Terminal for TmuxTerminal {
    fn session_exists(&self, session: &str) -> bool {
        session_exists(session)
    }

    fn send_keys(&self, target: &str, text: &str) -> Result<(), TmuxError> {
        send_keys(target, text)
    }

    fn capture_pane(&self, target: &str, lines: u32) -> Result<String, TmuxError> {
        capture_pane(target, lines)
    }

    fn send_interrupt(&self, target: &str) -> Result<(), TmuxError> {
        send_interrupt(target)
    }

    fn send_escape(&self, target: &str) -> Result<(), TmuxError> {
        send_escape(target)
    }

    fn send_enter(&self, target: &str) -> Result<(), TmuxError> {
        send_enter(target)
    }

    fn send_arrow_up(&self, target: &str, count: u32) -> Result<(), TmuxError> {
        send_arrow_up(target, count)
    }

    fn send_arrow_down(&self, target: &str, count: u32) -> Result<(), TmuxError> {
        send_arrow_down(target, count)
    }

    fn rename_session(&self, old: &str, new: &str) -> Result<(), TmuxError> {
        rename_session(old, new)
    }
}

impl Liveness for TmuxTerminal {
    fn is_alive(&self, session: &str) -> bool {
        session_exists(session)
    }
}

/// Liveness backed by `tmux has-session`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TmuxLiveness;

impl Liveness for TmuxLiveness {
    fn is_alive(&self, session: &str) -> bool {
        session_exists(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pane_override_wins_over_session() {
        assert_eq!(target("claude-0214-1352", Some("%3")), "%3");
        assert_eq!(target("claude-0214-1352", None), "claude-0214-1352");
        assert_eq!(target("claude-0214-1352", Some("  ")), "claude-0214-1352");
    }

    #[test]
    fn missing_target_stderr_is_classified() {
        assert!(stderr_means_missing_target("can't find session: foo"));
        assert!(stderr_means_missing_target("no server running on /tmp/tmux-0/default"));
        assert!(stderr_means_missing_target("can't find pane: %9"));
        assert!(!stderr_means_missing_target("unknown option -- z"));
    }

    #[test]
    fn not_found_error_reports_target() {
        let err = TmuxError::TargetNotFound {
            target: "gone".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "tmux target 'gone' not found");
    }

    #[test]
    fn nonexistent_session_does_not_exist() {
        assert!(!session_exists("tmuxgram-test-nonexistent-12345"));
    }

    #[cfg(feature = "integration")]
    mod live {
        use super::*;
        use serial_test::serial;
        use std::time::Duration;

        fn start_detached(session: &str, program: &[&str]) {
            let _ = run_tmux(["kill-session", "-t", session]);
            let mut args = vec!["new-session", "-d", "-s", session, "-x", "200", "-y", "50"];
            args.extend_from_slice(program);
            let output = run_tmux(args).unwrap();
            assert!(output.status.success(), "failed to start {session}");
        }

        fn kill(session: &str) {
            let _ = run_tmux(["kill-session", "-t", session]);
        }

        #[test]
        #[serial]
        fn check_tmux_finds_binary() {
            let version = check_tmux().unwrap();
            assert!(version.starts_with("tmux"), "unexpected version: {version}");
        }

        #[test]
        #[serial]
        fn send_keys_clears_draft_and_submits() {
            let session = "tmuxgram-test-sendkeys";
            start_detached(session, &["cat"]);
            std::thread::sleep(Duration::from_millis(200));

            run_tmux(["send-keys", "-t", session, "-l", "stale draft"]).unwrap();
            send_keys(session, "-dash leading text").unwrap();
            std::thread::sleep(Duration::from_millis(300));

            let screen = capture_pane(session, 20).unwrap();
            kill(session);
            assert!(screen.contains("-dash leading text"), "screen: {screen:?}");
            assert!(!screen.contains("stale draft-dash"), "screen: {screen:?}");
        }

        #[test]
        #[serial]
        fn capture_pane_returns_recent_output() {
            let session = "tmuxgram-test-capture";
            start_detached(session, &["bash", "-c", "echo capture-test; sleep 5"]);
            std::thread::sleep(Duration::from_millis(500));

            let content = capture_pane(session, 50).unwrap();
            kill(session);
            assert!(content.contains("capture-test"), "content: {content:?}");
        }

        #[test]
        #[serial]
        fn rename_session_moves_the_name() {
            let session = "tmuxgram-test-rename-a";
            let renamed = "tmuxgram-test-rename-b";
            kill(renamed);
            start_detached(session, &["sleep", "10"]);

            rename_session(session, renamed).unwrap();
            let exists_old = session_exists(session);
            let exists_new = session_exists(renamed);
            kill(renamed);

            assert!(!exists_old);
            assert!(exists_new);
        }

        #[test]
        #[serial]
        fn operations_on_missing_session_are_not_found() {
            let err = send_enter("tmuxgram-test-missing-777").unwrap_err();
            assert!(err.is_not_found(), "unexpected error: {err}");
        }
    }
}
