//! Drive and watch tmux-hosted coding agents from Telegram.

pub mod cli;
pub mod config;
pub mod format;
pub mod gate;
pub mod hook;
pub mod install;
pub mod launcher;
pub mod log;
pub mod notify;
pub mod paths;
pub mod registry;
pub mod relay;
pub mod screen;
pub mod shell_completion;
pub mod telegram;
pub mod tmux;
pub mod transcript;

#[cfg(test)]
pub(crate) mod testing;
