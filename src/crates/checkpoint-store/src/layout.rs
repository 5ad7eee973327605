//! On-disk layout and file naming
//!
//! ```text
//! <base_dir>/
//! └── checkpoints/
//!     ├── checkpoint_registry.json
//!     ├── parse_20240101_120000.json
//!     ├── parse_20240101_120000_1.json      (same second, second save)
//!     └── backups/
//!         ├── backup_parse_20240101_120000.json
//!         └── pruned_setup_20231231_235959.json
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::StoreConfig;

/// Prefix of pre-overwrite snapshots in the backup area
pub const BACKUP_PREFIX: &str = "backup_";

/// Prefix of retention snapshots in the backup area
pub const PRUNED_PREFIX: &str = "pruned_";

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const STAMP_LEN: usize = 15;

/// Resolved directories and files of one store
#[derive(Debug, Clone)]
pub struct StoreLayout {
    checkpoint_dir: PathBuf,
    backup_dir: PathBuf,
    registry_path: PathBuf,
}

impl StoreLayout {
    pub fn from_config(config: &StoreConfig) -> Self {
        let checkpoint_dir = config.base_dir.join(&config.checkpoint_dir);
        Self {
            backup_dir: checkpoint_dir.join(&config.backup_dir),
            registry_path: checkpoint_dir.join(&config.registry_file),
            checkpoint_dir,
        }
    }

    /// Create the checkpoint and backup directories
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        std::fs::create_dir_all(&self.backup_dir)
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Path of a live checkpoint file
    pub fn live_path(&self, file_name: &str) -> PathBuf {
        self.checkpoint_dir.join(file_name)
    }

    pub fn backup_path(&self, file_name: &str) -> PathBuf {
        self.backup_dir.join(format!("{BACKUP_PREFIX}{file_name}"))
    }

    pub fn pruned_path(&self, file_name: &str) -> PathBuf {
        self.backup_dir.join(format!("{PRUNED_PREFIX}{file_name}"))
    }

    /// Pick a file name for a new checkpoint that is unused in both the live
    /// area and the backup area
    pub fn fresh_file_name(&self, stage: &str, timestamp: &DateTime<Utc>) -> String {
        let mut name = CheckpointFileName::new(stage, timestamp.naive_utc());
        loop {
            let candidate = name.to_string();
            let taken = self.live_path(&candidate).exists()
                || self.backup_path(&candidate).exists()
                || self.pruned_path(&candidate).exists();
            if !taken {
                return candidate;
            }
            name.seq = Some(name.seq.map_or(1, |n| n + 1));
        }
    }

    /// True for names written by the atomic writer before rename
    pub fn is_temp_file(file_name: &str) -> bool {
        file_name.starts_with('.') && file_name.ends_with(".tmp")
    }
}

/// Parsed `<stage>_<YYYYMMDD_HHMMSS>[_<n>].json` file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFileName {
    pub stage: String,
    pub stamp: NaiveDateTime,
    pub seq: Option<u32>,
}

impl CheckpointFileName {
    pub fn new(stage: &str, stamp: NaiveDateTime) -> Self {
        Self {
            stage: stage.to_string(),
            stamp: stamp.with_nanosecond_zeroed(),
            seq: None,
        }
    }

    /// Parse from the right so stage names may contain underscores
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".json")?;

        // Optional `_<n>` suffix; a 6-digit group is the time part, not a sequence.
        let (rest, seq) = match stem.rsplit_once('_') {
            Some((head, tail))
                if !tail.is_empty()
                    && tail.len() != 6
                    && tail.chars().all(|c| c.is_ascii_digit()) =>
            {
                (head, Some(tail.parse::<u32>().ok()?))
            }
            _ => (stem, None),
        };

        if rest.len() < STAMP_LEN + 2 || !rest.is_char_boundary(rest.len() - STAMP_LEN) {
            return None;
        }
        let (head, stamp) = rest.split_at(rest.len() - STAMP_LEN);
        let stage = head.strip_suffix('_')?;
        if stage.is_empty() {
            return None;
        }
        let stamp = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;

        Some(Self {
            stage: stage.to_string(),
            stamp,
            seq,
        })
    }
}

impl fmt::Display for CheckpointFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.stage, self.stamp.format(STAMP_FORMAT))?;
        if let Some(seq) = self.seq {
            write!(f, "_{seq}")?;
        }
        f.write_str(".json")
    }
}

trait ZeroNanos {
    fn with_nanosecond_zeroed(self) -> Self;
}

impl ZeroNanos for NaiveDateTime {
    fn with_nanosecond_zeroed(self) -> Self {
        use chrono::Timelike;
        self.with_nanosecond(0).unwrap_or(self)
    }
}
