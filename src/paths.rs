use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment variable that overrides the installation root.
pub const HOME_ENV: &str = "TMUXGRAM_HOME";
const DEFAULT_DIR: &str = ".tmuxgram";

/// Well-known file locations under one installation root.
///
/// Every process kind (launcher, relay, notifier) resolves the same root, so
/// they all agree on where the shared registry and notification log live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the installation root from `$TMUXGRAM_HOME`, falling back to
    /// `$HOME/.tmuxgram`.
    pub fn resolve() -> Result<Self> {
        let root = resolve_root(
            std::env::var_os(HOME_ENV).map(PathBuf::from),
            std::env::var_os("HOME").map(PathBuf::from),
        )
        .context("cannot locate installation root: neither TMUXGRAM_HOME nor HOME is set")?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn registry(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    pub fn notify_log(&self) -> PathBuf {
        self.root.join("notify-log.json")
    }

    pub fn relay_pid(&self) -> PathBuf {
        self.root.join("relay.pid")
    }

    pub fn event_log(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn relay_log(&self) -> PathBuf {
        self.logs_dir().join("relay.log")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }
}

/// Pick the installation root.
///
/// An explicit override wins; otherwise the root is `.tmuxgram` under the
/// user's home directory. Empty values are treated as unset.
fn resolve_root(override_dir: Option<PathBuf>, home: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return Some(dir);
    }
    home.filter(|h| !h.as_os_str().is_empty())
        .map(|h| h.join(DEFAULT_DIR))
}

/// Expand a leading `~/` against `home`.
pub fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Replace `path` with `contents` via a sibling temp file and `rename`.
///
/// Readers either see the old document or the new one, never a torn write.
/// The temp name carries the pid so concurrent writers do not share it.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_home() {
        let root = resolve_root(Some("/opt/tg".into()), Some("/home/u".into()));
        assert_eq!(root, Some(PathBuf::from("/opt/tg")));
    }

    #[test]
    fn falls_back_to_dot_dir_in_home() {
        let root = resolve_root(None, Some("/home/u".into()));
        assert_eq!(root, Some(PathBuf::from("/home/u/.tmuxgram")));
    }

    #[test]
    fn empty_override_is_ignored() {
        let root = resolve_root(Some(PathBuf::new()), Some("/home/u".into()));
        assert_eq!(root, Some(PathBuf::from("/home/u/.tmuxgram")));
    }

    #[test]
    fn returns_none_when_nothing_is_set() {
        assert_eq!(resolve_root(None, None), None);
    }

    #[test]
    fn well_known_files_live_under_root() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());

        assert_eq!(paths.registry(), tmp.path().join("sessions.json"));
        assert_eq!(paths.notify_log(), tmp.path().join("notify-log.json"));
        assert_eq!(paths.relay_log(), tmp.path().join("logs").join("relay.log"));
        assert_eq!(paths.config(), tmp.path().join("config.toml"));
    }

    #[test]
    fn write_atomic_replaces_contents_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("nested").join("state.json");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "second");
        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn expand_home_handles_tilde_prefix() {
        let home = Path::new("/home/u");
        assert_eq!(
            expand_home("~/.claude/plans/a.md", Some(home)),
            PathBuf::from("/home/u/.claude/plans/a.md")
        );
        assert_eq!(expand_home("/abs/a.md", Some(home)), PathBuf::from("/abs/a.md"));
        assert_eq!(expand_home("~/x", None), PathBuf::from("~/x"));
    }
}
