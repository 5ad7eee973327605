//! Durable index of checkpoint existence and location
//!
//! The registry is the single source of truth for which checkpoints exist. A
//! checkpoint file on disk without a registry entry is an orphan and is never
//! adopted. The whole map is rewritten on every mutation via temp file and rename,
//! and the in-memory copy is only updated once the write has succeeded.
//!
//! ```text
//! checkpoint_registry.json
//! {
//!   "3f9a0c1d2e4b5a69": {
//!     "file": "parse_20240101_120000.json",
//!     "stage": "parse",
//!     "timestamp": "2024-01-01T12:00:00.123456789Z",
//!     "seq": 7
//!   },
//!   ...
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::atomic::{atomic_write, WriteOptions};
use crate::checkpoint::CheckpointId;
use crate::error::{CheckpointError, Result};

/// Location and ordering data for one registered checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEntry {
    /// File name relative to the checkpoint directory
    pub file: String,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    /// Registry-wide insertion counter, breaks timestamp ties
    #[serde(default)]
    pub seq: u64,
}

/// Why a registry file on disk could not be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryDiagnostic {
    pub path: PathBuf,
    pub reason: String,
}

impl From<RegistryDiagnostic> for CheckpointError {
    fn from(diagnostic: RegistryDiagnostic) -> Self {
        CheckpointError::RegistryUnreadable {
            path: diagnostic.path,
            reason: diagnostic.reason,
        }
    }
}

/// In-memory view of the registry file
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    entries: BTreeMap<CheckpointId, RegistryEntry>,
    next_seq: u64,
    options: WriteOptions,
}

impl Registry {
    /// Load the registry at `path`
    ///
    /// A missing file yields an empty registry. An unreadable or unparsable file
    /// also yields an empty registry, together with a diagnostic for the caller.
    /// The checkpoint directory is never scanned to rebuild entries.
    pub fn load(path: impl Into<PathBuf>, options: WriteOptions) -> (Self, Option<RegistryDiagnostic>) {
        let path = path.into();
        let (entries, diagnostic) = match read_entries(&path) {
            Ok(entries) => (entries, None),
            Err(reason) => {
                warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Registry unreadable, starting empty; existing checkpoints are invisible until reconciled"
                );
                let diagnostic = RegistryDiagnostic {
                    path: path.clone(),
                    reason,
                };
                (BTreeMap::new(), Some(diagnostic))
            }
        };

        let next_seq = entries.values().map(|e| e.seq.saturating_add(1)).max().unwrap_or(0);
        debug!(path = %path.display(), entries = entries.len(), "Registry loaded");

        (
            Self {
                path,
                entries,
                next_seq,
                options,
            },
            diagnostic,
        )
    }

    /// Re-read the registry file, replacing the in-memory view
    pub fn reload(&mut self) -> Option<RegistryDiagnostic> {
        let (fresh, diagnostic) = Self::load(self.path.clone(), self.options);
        *self = fresh;
        diagnostic
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add or overwrite an entry and persist the whole registry
    pub fn put(
        &mut self,
        id: impl Into<CheckpointId>,
        stage: impl Into<String>,
        file: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<RegistryEntry> {
        let id = id.into();
        let entry = RegistryEntry {
            file: file.into(),
            stage: stage.into(),
            timestamp,
            seq: self.next_seq,
        };

        let mut next = self.entries.clone();
        next.insert(id.clone(), entry.clone());
        self.commit(next)?;
        self.next_seq = self.next_seq.saturating_add(1);

        debug!(checkpoint_id = %id, stage = %entry.stage, file = %entry.file, "Registry entry written");
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Entry with the greatest `(timestamp, seq)` for `stage`
    pub fn latest(&self, stage: &str) -> Option<(&CheckpointId, &RegistryEntry)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.stage == stage)
            .max_by(|a, b| order_key(a.1).cmp(&order_key(b.1)))
    }

    /// Remove one entry and persist; returns the removed entry if it existed
    pub fn remove(&mut self, id: &str) -> Result<Option<RegistryEntry>> {
        let mut removed = self.remove_many([id])?;
        Ok(removed.pop().map(|(_, entry)| entry))
    }

    /// Remove several entries with a single registry write
    pub fn remove_many<I, S>(&mut self, ids: I) -> Result<Vec<(CheckpointId, RegistryEntry)>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next = self.entries.clone();
        let removed: Vec<(CheckpointId, RegistryEntry)> = ids
            .into_iter()
            .filter_map(|id| next.remove_entry(id.as_ref()))
            .collect();

        if removed.is_empty() {
            return Ok(removed);
        }
        self.commit(next)?;
        debug!(removed = removed.len(), "Registry entries removed");
        Ok(removed)
    }

    /// Entries for `stage`, oldest first
    pub fn entries_for_stage(&self, stage: &str) -> Vec<(&CheckpointId, &RegistryEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.stage == stage)
            .collect();
        entries.sort_by(|a, b| order_key(a.1).cmp(&order_key(b.1)));
        entries
    }

    /// Every stage with at least one registered checkpoint
    pub fn stages(&self) -> BTreeSet<String> {
        self.entries.values().map(|e| e.stage.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CheckpointId, &RegistryEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn commit(&mut self, next: BTreeMap<CheckpointId, RegistryEntry>) -> Result<()> {
        let bytes = self.options.encode(&next)?;
        atomic_write(&self.path, &bytes, self.options.sync)?;
        self.entries = next;
        Ok(())
    }
}

fn order_key(entry: &RegistryEntry) -> (DateTime<Utc>, u64) {
    (entry.timestamp, entry.seq)
}

fn read_entries(path: &Path) -> std::result::Result<BTreeMap<CheckpointId, RegistryEntry>, String> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.to_string()),
    };
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registry_in(dir: &Path) -> Registry {
        let (registry, diagnostic) =
            Registry::load(dir.join("checkpoint_registry.json"), WriteOptions::default());
        assert!(diagnostic.is_none());
        registry
    }

    #[test]
    fn test_put_get_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(dir.path());
        let ts = Utc::now();

        registry.put("a1", "parse", "parse_1.json", ts).unwrap();
        assert_eq!(registry.get("a1").unwrap().file, "parse_1.json");

        let reopened = registry_in(dir.path());
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("a1").unwrap().timestamp, ts);
    }

    #[test]
    fn test_latest_uses_timestamp_then_seq() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(dir.path());
        let ts = Utc::now();

        registry.put("old", "parse", "a.json", ts - Duration::seconds(5)).unwrap();
        registry.put("tie1", "parse", "b.json", ts).unwrap();
        registry.put("tie2", "parse", "c.json", ts).unwrap();
        registry.put("other", "thread", "d.json", ts + Duration::seconds(5)).unwrap();

        assert_eq!(registry.latest("parse").unwrap().0, "tie2");
        assert_eq!(registry.latest("thread").unwrap().0, "other");
        assert!(registry.latest("final").is_none());

        let ids: Vec<&str> = registry
            .entries_for_stage("parse")
            .into_iter()
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(ids, vec!["old", "tie1", "tie2"]);
    }

    #[test]
    fn test_seq_continues_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(dir.path());
        let ts = Utc::now();
        registry.put("a", "parse", "a.json", ts).unwrap();
        registry.put("b", "parse", "b.json", ts).unwrap();

        let mut reopened = registry_in(dir.path());
        let entry = reopened.put("c", "parse", "c.json", ts).unwrap();
        assert_eq!(entry.seq, 2);
        assert_eq!(reopened.latest("parse").unwrap().0, "c");
    }

    #[test]
    fn test_seq_at_upper_bound_saturates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint_registry.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"a": {{"file": "a.json", "stage": "parse", "timestamp": "2024-01-01T00:00:00Z", "seq": {}}}}}"#,
                u64::MAX
            ),
        )
        .unwrap();

        let mut registry = registry_in(dir.path());
        assert_eq!(registry.get("a").unwrap().seq, u64::MAX);

        let entry = registry.put("b", "parse", "b.json", Utc::now()).unwrap();
        assert_eq!(entry.seq, u64::MAX);
        assert_eq!(registry.latest("parse").unwrap().0, "b");
    }

    #[test]
    fn test_remove_many_single_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(dir.path());
        let ts = Utc::now();
        for id in ["a", "b", "c"] {
            registry.put(id, "parse", format!("{id}.json"), ts).unwrap();
        }

        let removed = registry.remove_many(["a", "c", "missing"]).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("missing").unwrap().is_none());

        let reopened = registry_in(dir.path());
        assert!(reopened.contains("b"));
        assert!(!reopened.contains("a"));
    }

    #[test]
    fn test_corrupt_registry_starts_empty_with_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint_registry.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let (registry, diagnostic) = Registry::load(&path, WriteOptions::default());
        assert!(registry.is_empty());
        let diagnostic = diagnostic.unwrap();
        assert_eq!(diagnostic.path, path);

        let err: CheckpointError = diagnostic.into();
        assert!(matches!(err, CheckpointError::RegistryUnreadable { .. }));
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone").join("checkpoint_registry.json");
        let (mut registry, _) = Registry::load(&path, WriteOptions::default());

        assert!(registry.put("a", "parse", "a.json", Utc::now()).is_err());
        assert!(registry.is_empty());
    }
}
