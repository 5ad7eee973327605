//! Deterministic checksums over checkpoint content
//!
//! Digests are SHA-256 over a canonical JSON encoding: object keys sorted
//! lexicographically, no insignificant whitespace. Two records with the same logical
//! content always produce the same digest regardless of how their maps were built.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointMetadata};
use crate::error::Result;

/// Hex length of derived checkpoint identifiers
pub const CHECKPOINT_ID_LEN: usize = 16;

/// Fields covered by the checksum (everything but the checksum itself)
#[derive(Serialize)]
struct DigestView<'a> {
    id: &'a str,
    stage: &'a str,
    timestamp: &'a DateTime<Utc>,
    data: &'a serde_json::Value,
    metadata: &'a CheckpointMetadata,
    previous_checkpoint: &'a Option<CheckpointId>,
}

/// Encode any serializable value as canonical JSON bytes
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &serde_json::Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
        }
        serde_json::Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

/// Lowercase hex SHA-256 of raw bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Digest of a payload alone, used for identifier derivation
pub fn content_digest(data: &serde_json::Value) -> Result<String> {
    Ok(sha256_hex(&canonical_json_bytes(data)?))
}

/// Derive a checkpoint identifier from stage, creation time and content digest
pub fn derive_checkpoint_id(
    stage: &str,
    timestamp: &DateTime<Utc>,
    data_digest: &str,
) -> CheckpointId {
    let mut hasher = Sha256::new();
    hasher.update(stage.as_bytes());
    hasher.update(
        timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.update(data_digest.as_bytes());
    let mut id = format!("{:x}", hasher.finalize());
    id.truncate(CHECKPOINT_ID_LEN);
    id
}

/// Compute the checksum of a record, ignoring its current `checksum` field
pub fn checksum(record: &Checkpoint) -> Result<String> {
    let view = DigestView {
        id: &record.id,
        stage: &record.stage,
        timestamp: &record.timestamp,
        data: &record.data,
        metadata: &record.metadata,
        previous_checkpoint: &record.previous_checkpoint,
    };
    Ok(sha256_hex(&canonical_json_bytes(&view)?))
}

/// Recompute and compare against `expected`
pub fn verify(record: &Checkpoint, expected: &str) -> Result<bool> {
    Ok(checksum(record)? == expected)
}

/// Check a record against the checksum it carries
pub fn verify_record(record: &Checkpoint) -> Result<bool> {
    verify(record, &record.checksum)
}

/// Why a checkpoint file could not be trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDefect {
    Missing,
    Unreadable(String),
    Malformed(String),
    IdMismatch { expected: String, found: String },
    StageMismatch { expected: String, found: String },
    ChecksumMismatch,
}

impl fmt::Display for FileDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileDefect::Missing => write!(f, "file missing"),
            FileDefect::Unreadable(e) => write!(f, "unreadable: {}", e),
            FileDefect::Malformed(e) => write!(f, "malformed checkpoint document: {}", e),
            FileDefect::IdMismatch { expected, found } => {
                write!(f, "id mismatch: expected {}, found {}", expected, found)
            }
            FileDefect::StageMismatch { expected, found } => {
                write!(f, "stage mismatch: expected '{}', found '{}'", expected, found)
            }
            FileDefect::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

/// Read a checkpoint file and check it against its own checksum
///
/// `expected_id` and `expected_stage` additionally pin the record to the registry
/// entry that pointed at the file.
pub fn read_verified(
    path: &Path,
    expected_id: Option<&str>,
    expected_stage: Option<&str>,
) -> std::result::Result<Checkpoint, FileDefect> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FileDefect::Missing,
        _ => FileDefect::Unreadable(e.to_string()),
    })?;
    let record = Checkpoint::from_slice(&bytes).map_err(|e| FileDefect::Malformed(e.to_string()))?;

    if let Some(expected) = expected_id {
        if record.id != expected {
            return Err(FileDefect::IdMismatch {
                expected: expected.to_string(),
                found: record.id,
            });
        }
    }
    if let Some(expected) = expected_stage {
        if record.stage != expected {
            return Err(FileDefect::StageMismatch {
                expected: expected.to_string(),
                found: record.stage,
            });
        }
    }

    match verify_record(&record) {
        Ok(true) => Ok(record),
        Ok(false) => Err(FileDefect::ChecksumMismatch),
        Err(e) => Err(FileDefect::Malformed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Checkpoint {
        let mut record = Checkpoint {
            id: "0011223344556677".to_string(),
            stage: "analyze".to_string(),
            timestamp: Utc::now(),
            data: json!({"b": 2, "a": [1, {"z": null, "y": true}]}),
            metadata: CheckpointMetadata::new().with_entry("rows", json!(2)),
            previous_checkpoint: Some("8899aabbccddeeff".to_string()),
            checksum: String::new(),
        };
        record.checksum = checksum(&record).unwrap();
        record
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let bytes = canonical_json_bytes(&json!({"b": 1, "a": {"d": 4, "c": 3}})).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"c":3,"d":4},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let bytes = canonical_json_bytes(&json!({"k\"ey": "line\nbreak"})).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"k\"ey":"line\nbreak"}"#
        );
    }

    #[test]
    fn test_checksum_ignores_checksum_field() {
        let mut record = record();
        let original = checksum(&record).unwrap();
        record.checksum = "something else".to_string();
        assert_eq!(checksum(&record).unwrap(), original);
    }

    #[test]
    fn test_verify_detects_changes() {
        let record = record();
        assert!(verify_record(&record).unwrap());

        let mut tampered = record.clone();
        tampered.data = json!({"b": 3, "a": [1, {"z": null, "y": true}]});
        assert!(!verify_record(&tampered).unwrap());

        let mut tampered = record.clone();
        tampered.metadata.insert("rows", json!(3));
        assert!(!verify_record(&tampered).unwrap());

        let mut tampered = record;
        tampered.previous_checkpoint = None;
        assert!(!verify_record(&tampered).unwrap());
    }

    #[test]
    fn test_derive_checkpoint_id() {
        let ts = Utc::now();
        let digest = content_digest(&json!({"n": 1})).unwrap();

        let id = derive_checkpoint_id("parse", &ts, &digest);
        assert_eq!(id.len(), CHECKPOINT_ID_LEN);
        assert_eq!(id, derive_checkpoint_id("parse", &ts, &digest));
        assert_ne!(id, derive_checkpoint_id("thread", &ts, &digest));
        assert_ne!(
            id,
            derive_checkpoint_id("parse", &(ts + chrono::Duration::nanoseconds(1)), &digest)
        );
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_read_verified_reports_defects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analyze_20240101_000000.json");
        let record = record();

        assert_eq!(read_verified(&path, None, None), Err(FileDefect::Missing));

        std::fs::write(&path, record.to_json_bytes(true).unwrap()).unwrap();
        assert_eq!(
            read_verified(&path, Some(&record.id), Some("analyze")).unwrap(),
            record
        );
        assert!(matches!(
            read_verified(&path, Some("ffffffffffffffff"), None),
            Err(FileDefect::IdMismatch { .. })
        ));
        assert!(matches!(
            read_verified(&path, None, Some("parse")),
            Err(FileDefect::StageMismatch { .. })
        ));

        let text = String::from_utf8(record.to_json_bytes(true).unwrap()).unwrap();
        std::fs::write(&path, text.replace("\"rows\": 2", "\"rows\": 20")).unwrap();
        assert_eq!(
            read_verified(&path, None, None),
            Err(FileDefect::ChecksumMismatch)
        );

        std::fs::write(&path, b"{ truncated").unwrap();
        assert!(matches!(
            read_verified(&path, None, None),
            Err(FileDefect::Malformed(_))
        ));
    }
}
