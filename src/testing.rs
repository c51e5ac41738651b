//! In-memory stand-ins for tmux and the Bot API, shared by unit tests.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::registry::SessionRegistry;
use crate::telegram::{ChatApi, TelegramError, TextFormat};
use crate::tmux::{Terminal, TmuxError};

#[derive(Debug, Default)]
pub struct TerminalState {
    pub alive: Vec<String>,
    pub screen: String,
    /// One line per keystroke or capture, e.g. `keys a hello`.
    pub calls: Vec<String>,
    pub fail_keys: bool,
    /// Registry to unregister the old name from during the next rename.
    pub unregister_on_rename: Option<PathBuf>,
}

/// Records calls into a shared [`TerminalState`].
pub struct FakeTerminal(pub Rc<RefCell<TerminalState>>);

impl FakeTerminal {
    fn call(&self, call: String) {
        self.0.borrow_mut().calls.push(call);
    }
}

impl Terminal for FakeTerminal {
    fn session_exists(&self, session: &str) -> bool {
        self.0.borrow().alive.iter().any(|s| s == session)
    }

    fn send_keys(&self, target: &str, text: &str) -> Result<(), TmuxError> {
        if self.0.borrow().fail_keys {
            return Err(TmuxError::CommandFailed {
                command: "send-keys".to_string(),
                stderr: "server exited".to_string(),
            });
        }
        self.call(format!("keys {target} {text}"));
        Ok(())
    }

    fn capture_pane(&self, target: &str, lines: u32) -> Result<String, TmuxError> {
        self.call(format!("capture {target} {lines}"));
        Ok(self.0.borrow().screen.clone())
    }

    fn send_interrupt(&self, target: &str) -> Result<(), TmuxError> {
        self.call(format!("interrupt {target}"));
        Ok(())
    }

    fn send_escape(&self, target: &str) -> Result<(), TmuxError> {
        self.call(format!("escape {target}"));
        Ok(())
    }

    fn send_enter(&self, target: &str) -> Result<(), TmuxError> {
        self.call(format!("enter {target}"));
        Ok(())
    }

    fn send_arrow_up(&self, target: &str, count: u32) -> Result<(), TmuxError> {
        self.call(format!("up {target} {count}"));
        Ok(())
    }

    fn send_arrow_down(&self, target: &str, count: u32) -> Result<(), TmuxError> {
        self.call(format!("down {target} {count}"));
        Ok(())
    }

    fn rename_session(&self, old: &str, new: &str) -> Result<(), TmuxError> {
        self.call(format!("rename {old} {new}"));
        let sabotage = self.0.borrow_mut().unregister_on_rename.take();
        if let Some(path) = sabotage {
            SessionRegistry::new(path).unregister(old).unwrap();
        }
        let mut state = self.0.borrow_mut();
        for name in state.alive.iter_mut() {
            if name == old {
                *name = new.to_string();
            }
        }
        Ok(())
    }
}

/// Records sent messages; downloads resolve to `download` when set.
#[derive(Default)]
pub struct FakeChat {
    pub sent: RefCell<Vec<(String, String, TextFormat)>>,
    pub download: Option<PathBuf>,
    pub fail_sends: bool,
}

impl FakeChat {
    pub fn texts(&self) -> Vec<String> {
        self.sent.borrow().iter().map(|(_, t, _)| t.clone()).collect()
    }

    pub fn last(&self) -> String {
        self.texts().pop().unwrap()
    }
}

impl ChatApi for FakeChat {
    fn send_message(&self, chat_id: &str, text: &str, format: TextFormat) -> Result<(), TelegramError> {
        if self.fail_sends {
            return Err(TelegramError::Transport("connection refused".to_string()));
        }
        self.sent
            .borrow_mut()
            .push((chat_id.to_string(), text.to_string(), format));
        Ok(())
    }

    fn download_file(&self, _file_id: &str, _dir: &Path) -> Result<PathBuf, TelegramError> {
        self.download
            .clone()
            .ok_or_else(|| TelegramError::Api("file is too big".to_string()))
    }
}
