//! Shared session registry.
//!
//! A single JSON document records every named agent session and which one is
//! "active". Launchers, the relay, and per-event notifiers all read and write
//! it without locking: every mutation is a whole-file read-modify-write, and
//! writes land through an atomic rename so a reader never sees a torn
//! document. Lost updates between concurrent writers are tolerated; stale
//! entries are dropped again by the next [`SessionRegistry::prune`].
//!
//! Liveness is never stored. It is asked of a [`Liveness`] oracle (tmux in
//! production, a closure in tests) every time the registry is pruned.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info};

use crate::paths::write_atomic;

/// Answers "does a multiplexer session with this name still exist?".
pub trait Liveness {
    fn is_alive(&self, name: &str) -> bool;
}

impl<F> Liveness for F
where
    F: Fn(&str) -> bool,
{
    fn is_alive(&self, name: &str) -> bool {
        self(name)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to serialize session registry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write session registry {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Session names start with an ASCII letter or digit and continue with
/// letters, digits, or hyphens. tmux treats `.` and `:` as target separators,
/// so anything else is rejected up front.
pub fn is_valid_session_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub cwd: String,
    pub started_at: DateTime<Utc>,
}

/// Sessions keyed by name, in insertion order.
///
/// Serialized as a JSON object whose key order is the insertion order, so the
/// "most recently inserted" session survives a round trip through the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMap {
    entries: Vec<(String, Session)>,
}

impl SessionMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Session> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert at the end. An existing entry with the same name is replaced
    /// and moves to the end.
    pub fn insert(&mut self, name: String, session: Session) {
        self.remove(&name);
        self.entries.push((name, session));
    }

    pub fn remove(&mut self, name: &str) -> Option<Session> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    /// Rename a key in place, keeping its position.
    fn rename_key(&mut self, old: &str, new: &str) -> bool {
        match self.entries.iter_mut().find(|(n, _)| n == old) {
            Some(entry) => {
                entry.0 = new.to_string();
                true
            }
            None => false,
        }
    }

    pub fn last_name(&self) -> Option<&str> {
        self.entries.last().map(|(n, _)| n.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Session)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s))
    }

    fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|(n, _)| keep(n));
    }
}

impl Serialize for SessionMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, session) in &self.entries {
            map.serialize_entry(name, session)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SessionMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = SessionMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of session name to session")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<SessionMap, A::Error> {
                let mut map = SessionMap::default();
                while let Some((name, session)) = access.next_entry::<String, Session>()? {
                    map.insert(name, session);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub active: Option<String>,
    #[serde(default)]
    pub sessions: SessionMap,
}

impl Registry {
    pub fn contains(&self, name: &str) -> bool {
        self.sessions.contains(name)
    }

    /// Restore the "active names a known session" invariant.
    ///
    /// A dangling active pointer moves to the most recently inserted session,
    /// or clears when the registry is empty. Returns whether anything changed.
    fn repair_active(&mut self) -> bool {
        match &self.active {
            Some(name) if !self.sessions.contains(name) => {
                self.active = self.sessions.last_name().map(str::to_string);
                true
            }
            _ => false,
        }
    }

    fn register(&mut self, name: &str, cwd: &str, now: DateTime<Utc>) {
        self.sessions.insert(
            name.to_string(),
            Session {
                cwd: cwd.to_string(),
                started_at: now,
            },
        );
        self.active = Some(name.to_string());
    }

    fn unregister(&mut self, name: &str) {
        self.sessions.remove(name);
        self.repair_active();
    }

    fn set_active(&mut self, name: &str) -> bool {
        if !self.sessions.contains(name) {
            return false;
        }
        self.active = Some(name.to_string());
        true
    }

    fn rename(&mut self, old: &str, new: &str) -> bool {
        if !self.sessions.contains(old) || self.sessions.contains(new) {
            return false;
        }
        self.sessions.rename_key(old, new);
        if self.active.as_deref() == Some(old) {
            self.active = Some(new.to_string());
        }
        true
    }

    fn prune(&mut self, liveness: &dyn Liveness) -> Vec<String> {
        let dead: Vec<String> = self
            .sessions
            .names()
            .filter(|name| !liveness.is_alive(name))
            .map(str::to_string)
            .collect();
        if !dead.is_empty() {
            self.sessions.retain(|name| !dead.iter().any(|d| d == name));
        }
        self.repair_active();
        dead
    }
}

/// File-backed registry handle.
///
/// Holds only the path; every operation re-reads the file so concurrent
/// writers in other processes are picked up.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    path: PathBuf,
}

impl SessionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry. A missing, unreadable, or unparseable file is an
    /// empty registry.
    pub fn load(&self) -> Registry {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return Registry::default(),
        };
        match serde_json::from_str::<Registry>(&contents) {
            Ok(mut registry) => {
                registry.repair_active();
                registry
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "unparseable registry, treating as empty");
                Registry::default()
            }
        }
    }

    pub fn save(&self, registry: &Registry) -> Result<(), RegistryError> {
        let mut json = serde_json::to_string_pretty(registry)?;
        json.push('\n');
        write_atomic(&self.path, json.as_bytes()).map_err(|source| RegistryError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Insert or overwrite `name` and make it active.
    pub fn register(&self, name: &str, cwd: &str) -> Result<(), RegistryError> {
        let mut registry = self.load();
        registry.register(name, cwd, Utc::now());
        self.save(&registry)?;
        info!(session = name, cwd, "session registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut registry = self.load();
        registry.unregister(name);
        self.save(&registry)?;
        info!(session = name, "session unregistered");
        Ok(())
    }

    /// Make `name` active. Unknown names leave the file untouched.
    pub fn set_active(&self, name: &str) -> Result<bool, RegistryError> {
        let mut registry = self.load();
        if !registry.set_active(name) {
            return Ok(false);
        }
        self.save(&registry)?;
        Ok(true)
    }

    /// Move `old` to `new`, keeping its cwd, start time, and position.
    ///
    /// Returns `false` without writing when `old` is unknown or `new` is taken.
    pub fn rename(&self, old: &str, new: &str) -> Result<bool, RegistryError> {
        let mut registry = self.load();
        if !registry.rename(old, new) {
            return Ok(false);
        }
        self.save(&registry)?;
        Ok(true)
    }

    /// Drop sessions whose multiplexer session is gone. Writes only when
    /// something changed.
    pub fn prune(&self, liveness: &dyn Liveness) -> Result<Registry, RegistryError> {
        let mut registry = self.load();
        let before = registry.active.clone();
        let dead = registry.prune(liveness);
        if !dead.is_empty() || registry.active != before {
            debug!(pruned = ?dead, "pruned dead sessions");
            self.save(&registry)?;
        }
        Ok(registry)
    }

    /// Active session after pruning. Performs one liveness query per session.
    pub fn get_active(&self, liveness: &dyn Liveness) -> Result<Option<String>, RegistryError> {
        Ok(self.prune(liveness)?.active)
    }

    /// Whole registry after pruning.
    pub fn list(&self, liveness: &dyn Liveness) -> Result<Registry, RegistryError> {
        self.prune(liveness)
    }

    /// Session whose working directory is `cwd`, else the active session.
    pub fn find_by_cwd(
        &self,
        cwd: Option<&str>,
        liveness: &dyn Liveness,
    ) -> Result<Option<String>, RegistryError> {
        let Some(cwd) = cwd.filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        let registry = self.list(liveness)?;
        let by_cwd = registry
            .sessions
            .iter()
            .find(|(_, s)| s.cwd == cwd)
            .map(|(name, _)| name.to_string());
        Ok(by_cwd.or(registry.active))
    }

    /// Generate `prefix-MMDD-HHMM`, adding two digits of seconds when that
    /// name is already registered.
    ///
    /// Best effort only: two launches inside the same second after a
    /// collision still produce the same name.
    pub fn next_name(&self, prefix: &str, now: NaiveDateTime) -> String {
        let base = format!("{prefix}-{}", now.format("%m%d-%H%M"));
        if self.load().contains(&base) {
            format!("{base}{}", now.format("%S"))
        } else {
            base
        }
    }
}
