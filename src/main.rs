use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use tmuxgram::cli::{self, Cli, Command, LaunchArgs};
use tmuxgram::config::Config;
use tmuxgram::notify::Outcome;
use tmuxgram::paths::Paths;
use tmuxgram::registry::SessionRegistry;
use tmuxgram::tmux::TmuxLiveness;
use tmuxgram::{hook, install, launcher, notify, relay, shell_completion};

fn load_config(paths: &Paths) -> Result<Config> {
    let (config, config_path) = Config::load(&paths.config())?;
    match config_path {
        Some(p) => debug!("loaded config from {}", p.display()),
        None => debug!("no config.toml found, using defaults"),
    }
    Ok(config)
}

fn launch(args: LaunchArgs, paths: &Paths) -> Result<()> {
    let config = load_config(paths)?;
    launcher::run(args.name, args.agent_args, &config, paths)
}

fn run_relay(paths: &Paths) -> Result<()> {
    let config = load_config(paths)?;
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install signal handler")?;
    relay::run(config, paths, stop)
}

/// The hook must never fail the agent, so every problem ends here.
fn run_notify() {
    let paths = match Paths::resolve() {
        Ok(paths) => paths,
        Err(e) => {
            debug!(error = %format!("{e:#}"), "notify skipped");
            return;
        }
    };
    let input = hook::read_with_timeout(io::stdin(), hook::STDIN_TIMEOUT);
    match notify::run(&paths, &input) {
        Outcome::Sent => debug!("notification sent"),
        Outcome::Ignored(reason) => debug!(reason, "notification ignored"),
        Outcome::Suppressed(reason) => debug!(reason = %reason, "notification suppressed"),
        Outcome::Failed(error) => warn!(error = %error, "notification failed"),
    }
}

fn show_sessions(paths: &Paths, json: bool) -> Result<()> {
    let registry = SessionRegistry::new(paths.registry()).list(&TmuxLiveness)?;
    let rendered = if json {
        cli::render_sessions_json(&registry)?
    } else {
        cli::render_sessions_human(&registry)
    };
    print!("{rendered}");
    if json {
        println!();
    }
    io::stdout().flush()?;
    Ok(())
}

fn show_config(paths: &Paths, json: bool) -> Result<()> {
    let (config, config_path) = Config::load(&paths.config())?;
    if json {
        println!("{}", cli::render_config_json(&config, config_path.as_deref())?);
    } else {
        print!("{}", cli::render_config_human(&config, config_path.as_deref()));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet = !matches!(cli.command, None | Some(Command::Launch(_)) | Some(Command::Relay));

    let filter = match cli.verbose {
        0 if quiet => "tmuxgram=warn",
        0 => "tmuxgram=info",
        1 => "tmuxgram=debug",
        _ => "tmuxgram=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if matches!(cli.command, Some(Command::Notify)) {
        run_notify();
        return Ok(());
    }

    let paths = Paths::resolve()?;
    info!(root = %paths.root().display(), "tmuxgram {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        None => launch(cli.launch, &paths),
        Some(Command::Launch(args)) => launch(args, &paths),
        Some(Command::Relay) => run_relay(&paths),
        Some(Command::Notify) => Ok(()),
        Some(Command::Sessions { json }) => show_sessions(&paths, json),
        Some(Command::Setup) => {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .context("HOME is not set; cannot locate the agent settings file")?;
            install::run_setup(&paths, &home)
        }
        Some(Command::Config { json }) => show_config(&paths, json),
        Some(Command::Completions { shell }) => {
            shell_completion::print(shell);
            Ok(())
        }
    }
}
