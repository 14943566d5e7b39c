//! # Durable per-source state
//! What the monitor remembers about each source between cycles: content
//! fingerprint, seen item identifiers, error counters, timestamps. Persisted
//! as pretty JSON with write-temp-then-rename so a crash mid-write never
//! corrupts previously-good state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

/// Stored page snapshots are capped; beyond this the fingerprint still
/// catches changes, the diff just loses some context.
const SNAPSHOT_MAX_CHARS: usize = 65_536;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SourceState {
    /// SHA-256 hex of the last successfully fetched, normalized content.
    pub fingerprint: Option<String>,
    /// Normalized content of the last snapshot (page sources only).
    pub snapshot: Option<String>,
    /// Previously seen item identifiers, oldest first (feed sources only).
    #[serde(default)]
    pub seen_ids: VecDeque<String>,
    #[serde(default)]
    pub consecutive_errors: u32,
    pub last_success_unix: Option<u64>,
    pub last_attempt_unix: Option<u64>,
}

impl SourceState {
    pub fn has_seen(&self, id: &str) -> bool {
        self.seen_ids.iter().any(|s| s == id)
    }

    /// Record an identifier, evicting the oldest once over `cap`.
    pub fn note_seen(&mut self, id: String, cap: usize) {
        if self.has_seen(&id) {
            return;
        }
        self.seen_ids.push_back(id);
        while self.seen_ids.len() > cap {
            self.seen_ids.pop_front();
        }
    }

    /// Enforce bounded growth before persisting.
    pub fn trim(&mut self, seen_cap: usize) {
        while self.seen_ids.len() > seen_cap {
            self.seen_ids.pop_front();
        }
        if let Some(snap) = &mut self.snapshot {
            if snap.chars().count() > SNAPSHOT_MAX_CHARS {
                let cut = snap
                    .char_indices()
                    .nth(SNAPSHOT_MAX_CHARS)
                    .map(|(i, _)| i)
                    .unwrap_or(snap.len());
                snap.truncate(cut);
            }
        }
    }
}

/// Stable hex fingerprint of content.
pub fn fingerprint(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{digest:x}")
}

/// File-backed store for the full source-id → state mapping.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means a fresh start, not an error.
    pub fn load(&self) -> Result<HashMap<String, SourceState>> {
        match fs::read_to_string(&self.path) {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => {
                Err(e).with_context(|| format!("reading state file {}", self.path.display()))
            }
        }
    }

    /// Atomic replace: write a sibling temp file, then rename over the
    /// target. Readers either see the old mapping or the new one.
    pub fn save(&self, states: &HashMap<String, SourceState>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating state dir {}", dir.display()))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(states).context("serializing source state")?;
        fs::write(&tmp, body)
            .with_context(|| format!("writing temp state file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing state file {}", self.path.display()))?;
        Ok(())
    }
}
