//! Shell completion scripts for the tmuxgram CLI.

use std::io;

use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::cli::{Cli, CompletionShell};

fn to_shell(shell: CompletionShell) -> Shell {
    match shell {
        CompletionShell::Bash => Shell::Bash,
        CompletionShell::Zsh => Shell::Zsh,
        CompletionShell::Fish => Shell::Fish,
    }
}

pub fn write(shell: CompletionShell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    generate(to_shell(shell), &mut cmd, "tmuxgram", out);
}

pub fn print(shell: CompletionShell) {
    write(shell, &mut io::stdout());
}
