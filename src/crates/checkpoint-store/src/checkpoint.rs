//! Core checkpoint data structures
//!
//! This module defines the durable record written for every completed pipeline stage:
//! **[`Checkpoint`]**, its side-channel **[`CheckpointMetadata`]**, and the
//! **[`CheckpointQuery`]** used to select a checkpoint for loading.
//!
//! # Record Layout
//!
//! One checkpoint is one JSON document on disk:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  parse_20240101_120000.json                          │
//! │                                                      │
//! │  • id: "3f9a0c1d2e4b5a69"                            │
//! │  • stage: "parse"                                    │
//! │  • timestamp: 2024-01-01T12:00:00.123456789Z         │
//! │  • data: { ...opaque payload... }                    │
//! │  • metadata: { "message_count": 412 }                │
//! │  • previous_checkpoint: "77b1e0a94c2d3f18" | null    │
//! │  • checksum: sha256 over every field above           │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Records are immutable once written. Updating a stage creates a new record whose
//! `previous_checkpoint` points at the record it supersedes; following those links
//! backward yields the stage's chain (see [`crate::chain`]).
//!
//! # Selecting Checkpoints
//!
//! ```rust,ignore
//! use checkpoint_store::CheckpointQuery;
//!
//! // Latest checkpoint for a stage
//! let query = CheckpointQuery::new().with_stage("parse");
//!
//! // A specific historical checkpoint
//! let query = CheckpointQuery::new().with_checkpoint_id("3f9a0c1d2e4b5a69");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CheckpointError, Result};

/// Checkpoint ID type
pub type CheckpointId = String;

/// Opaque key/value side-channel stored next to the payload
///
/// Covered by the checksum, never interpreted by the store.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(transparent)]
pub struct CheckpointMetadata {
    entries: BTreeMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    /// Create empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry
    pub fn with_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.entries.iter()
    }
}

impl From<BTreeMap<String, serde_json::Value>> for CheckpointMetadata {
    fn from(entries: BTreeMap<String, serde_json::Value>) -> Self {
        Self { entries }
    }
}

/// Durable state snapshot for one pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Derived from stage, timestamp and a digest of `data`
    pub id: CheckpointId,

    /// Name of the stage that produced this checkpoint
    pub stage: String,

    /// Creation time, strictly increasing within a stage
    pub timestamp: DateTime<Utc>,

    /// Opaque payload produced by the stage executor
    pub data: serde_json::Value,

    /// Opaque side-channel information
    #[serde(default)]
    pub metadata: CheckpointMetadata,

    /// Checkpoint this one supersedes within the same stage
    pub previous_checkpoint: Option<CheckpointId>,

    /// SHA-256 over every other field
    pub checksum: String,
}

impl Checkpoint {
    /// Parse a checkpoint document
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize to the on-disk JSON form
    pub fn to_json_bytes(&self, pretty: bool) -> Result<Vec<u8>> {
        let bytes = if pretty {
            serde_json::to_vec_pretty(self)?
        } else {
            serde_json::to_vec(self)?
        };
        Ok(bytes)
    }

    /// True for the first checkpoint of a stage
    pub fn is_root(&self) -> bool {
        self.previous_checkpoint.is_none()
    }
}

/// Selects the checkpoint to load
///
/// An explicit checkpoint id takes precedence over the stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointQuery {
    /// Load the latest checkpoint of this stage
    pub stage: Option<String>,

    /// Load this exact checkpoint
    pub checkpoint_id: Option<CheckpointId>,
}

impl CheckpointQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stage
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Set the checkpoint ID
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Shorthand for the latest checkpoint of `stage`
    pub fn latest(stage: impl Into<String>) -> Self {
        Self::new().with_stage(stage)
    }

    /// Shorthand for a specific checkpoint
    pub fn by_id(checkpoint_id: impl Into<CheckpointId>) -> Self {
        Self::new().with_checkpoint_id(checkpoint_id)
    }
}

/// Check that a stage name is safe to embed in file names
pub fn validate_stage(stage: &str) -> Result<()> {
    let valid = !stage.is_empty()
        && stage
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidStage(stage.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Checkpoint {
        Checkpoint {
            id: "0123456789abcdef".to_string(),
            stage: "parse".to_string(),
            timestamp: Utc::now(),
            data: json!({"messages": [1, 2, 3]}),
            metadata: CheckpointMetadata::new().with_entry("count", json!(3)),
            previous_checkpoint: None,
            checksum: "00".to_string(),
        }
    }

    #[test]
    fn test_checkpoint_json_shape() {
        let checkpoint = sample();
        let value: serde_json::Value =
            serde_json::from_slice(&checkpoint.to_json_bytes(false).unwrap()).unwrap();

        let object = value.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "checksum",
                "data",
                "id",
                "metadata",
                "previous_checkpoint",
                "stage",
                "timestamp"
            ]
        );
        assert_eq!(object["metadata"], json!({"count": 3}));
        assert!(object["previous_checkpoint"].is_null());
    }

    #[test]
    fn test_checkpoint_parses_back() {
        let checkpoint = sample();
        let bytes = checkpoint.to_json_bytes(true).unwrap();
        let parsed = Checkpoint::from_slice(&bytes).unwrap();
        assert_eq!(parsed, checkpoint);
        assert!(parsed.is_root());
    }

    #[test]
    fn test_checkpoint_metadata() {
        let mut metadata = CheckpointMetadata::new().with_entry("rows", json!(10));
        metadata.insert("source", json!("pdf"));

        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata.get("rows"), Some(&json!(10)));
        assert!(metadata.get("missing").is_none());
    }

    #[test]
    fn test_checkpoint_query() {
        let query = CheckpointQuery::new()
            .with_stage("thread")
            .with_checkpoint_id("abc");

        assert_eq!(query.stage.as_deref(), Some("thread"));
        assert_eq!(query.checkpoint_id.as_deref(), Some("abc"));
        assert_eq!(CheckpointQuery::latest("thread").checkpoint_id, None);
    }

    #[test]
    fn test_validate_stage() {
        assert!(validate_stage("parse").is_ok());
        assert!(validate_stage("pdf_parsing").is_ok());
        assert!(validate_stage("stage-2").is_ok());
        assert!(validate_stage("").is_err());
        assert!(validate_stage("../escape").is_err());
        assert!(validate_stage("with space").is_err());
    }
}
