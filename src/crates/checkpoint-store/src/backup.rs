//! Backup area management
//!
//! The backup area holds two kinds of snapshots, both named after the live file
//! they were taken from:
//!
//! - `backup_<file>`: copy of a stage's latest checkpoint, taken before a new
//!   checkpoint for that stage is written or before a rollback.
//! - `pruned_<file>`: checkpoint retired by retention. The live file is removed
//!   only after the archived copy is in place and the registry no longer lists it.
//!
//! Nothing in the backup area is ever deleted by the store.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::atomic::{atomic_copy, atomic_write, WriteOptions};
use crate::checkpoint::{Checkpoint, CheckpointId};
use crate::error::Result;
use crate::integrity::{read_verified, FileDefect};
use crate::layout::{CheckpointFileName, StoreLayout, BACKUP_PREFIX, PRUNED_PREFIX};
use crate::registry::Registry;

/// Kind of snapshot in the backup area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Backup,
    Pruned,
}

impl BackupKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            BackupKind::Backup => BACKUP_PREFIX,
            BackupKind::Pruned => PRUNED_PREFIX,
        }
    }
}

/// One file in the backup area
#[derive(Debug, Clone, Serialize)]
pub struct BackupFile {
    pub kind: BackupKind,
    pub path: PathBuf,
    /// Name of the live file the snapshot was taken from
    pub original_name: String,
    pub stage: String,
    /// Time encoded in the original file name
    pub stamp: NaiveDateTime,
    pub modified: DateTime<Utc>,
}

/// Result of copying a checkpoint into the pruned archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveCopy {
    /// Fresh copy written
    Copied(PathBuf),
    /// Identical bytes were already archived
    AlreadyArchived(PathBuf),
    /// Archive name is taken by different content; nothing written
    Conflict(PathBuf),
}

impl ArchiveCopy {
    pub fn path(&self) -> &Path {
        match self {
            ArchiveCopy::Copied(path)
            | ArchiveCopy::AlreadyArchived(path)
            | ArchiveCopy::Conflict(path) => path,
        }
    }
}

/// Copies checkpoints into and out of the backup area
#[derive(Debug, Clone)]
pub struct BackupCoordinator {
    layout: StoreLayout,
    options: WriteOptions,
}

impl BackupCoordinator {
    pub fn new(layout: StoreLayout, options: WriteOptions) -> Self {
        Self { layout, options }
    }

    /// Back up the registry-latest checkpoint file of `stage`
    ///
    /// Returns the backup path, or `None` when the stage has no registered
    /// checkpoint or its file is gone. A file that fails verification does not
    /// replace an existing backup of the same name.
    pub fn backup_latest(&self, registry: &Registry, stage: &str) -> Result<Option<PathBuf>> {
        let Some((id, entry)) = registry.latest(stage) else {
            return Ok(None);
        };

        let live = self.layout.live_path(&entry.file);
        let target = self.layout.backup_path(&entry.file);

        match read_verified(&live, Some(id.as_str()), Some(stage)) {
            Ok(_) => {}
            Err(FileDefect::Missing) => {
                warn!(stage = %stage, checkpoint_id = %id, path = %live.display(), "Latest checkpoint file missing, nothing to back up");
                return Ok(None);
            }
            Err(defect) if target.exists() => {
                warn!(
                    stage = %stage,
                    checkpoint_id = %id,
                    reason = %defect,
                    "Latest checkpoint fails verification, keeping existing backup"
                );
                return Ok(Some(target));
            }
            Err(defect) => {
                warn!(stage = %stage, checkpoint_id = %id, reason = %defect, "Backing up unverified checkpoint bytes");
            }
        }

        atomic_copy(&live, &target, self.options.sync)?;
        debug!(stage = %stage, checkpoint_id = %id, backup = %target.display(), "Backed up latest checkpoint");
        Ok(Some(target))
    }

    /// Copy the most recent `backup_` snapshot of `stage` back into the live area
    pub fn restore_latest(&self, stage: &str) -> Result<Option<PathBuf>> {
        let newest = self
            .list(Some(stage))?
            .into_iter()
            .filter(|f| f.kind == BackupKind::Backup)
            .max_by(|a, b| (a.modified, a.stamp).cmp(&(b.modified, b.stamp)));

        match newest {
            Some(file) => self.restore_file(&file).map(Some),
            None => {
                debug!(stage = %stage, "No backup available to restore");
                Ok(None)
            }
        }
    }

    /// Restore the backup of one specific live file, falling back to the most
    /// recent backup of `stage`
    pub fn restore_for(&self, stage: &str, file_name: &str) -> Result<Option<PathBuf>> {
        let own = self.layout.backup_path(file_name);
        if own.is_file() {
            let restored = self.layout.live_path(file_name);
            atomic_copy(&own, &restored, self.options.sync)?;
            info!(stage = %stage, path = %restored.display(), "Restored checkpoint from its backup");
            return Ok(Some(restored));
        }
        self.restore_latest(stage)
    }

    fn restore_file(&self, file: &BackupFile) -> Result<PathBuf> {
        let restored = self.layout.live_path(&file.original_name);
        atomic_copy(&file.path, &restored, self.options.sync)?;
        info!(
            stage = %file.stage,
            backup = %file.path.display(),
            path = %restored.display(),
            "Restored checkpoint from backup"
        );
        Ok(restored)
    }

    /// Move a live checkpoint file into the pruned archive
    pub fn archive_for_prune(&self, file_name: &str) -> Result<ArchiveCopy> {
        let copy = self.copy_to_archive(file_name)?;
        if !matches!(copy, ArchiveCopy::Conflict(_)) {
            self.discard_live(file_name)?;
        }
        Ok(copy)
    }

    /// First half of [`archive_for_prune`](Self::archive_for_prune): place the
    /// archived copy, leaving the live file in place
    pub fn copy_to_archive(&self, file_name: &str) -> Result<ArchiveCopy> {
        let live = self.layout.live_path(file_name);
        let target = self.layout.pruned_path(file_name);
        let bytes = std::fs::read(&live)?;

        match std::fs::read(&target) {
            Ok(existing) if existing == bytes => return Ok(ArchiveCopy::AlreadyArchived(target)),
            Ok(_) => return Ok(ArchiveCopy::Conflict(target)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        atomic_write(&target, &bytes, self.options.sync)?;
        Ok(ArchiveCopy::Copied(target))
    }

    /// Second half of [`archive_for_prune`](Self::archive_for_prune): remove the
    /// live file once its archive copy exists
    pub fn discard_live(&self, file_name: &str) -> Result<()> {
        let live = self.layout.live_path(file_name);
        match std::fs::remove_file(&live) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate backup-area files, optionally for one stage, oldest first
    pub fn list(&self, stage: Option<&str>) -> Result<Vec<BackupFile>> {
        let dir = match std::fs::read_dir(self.layout.backup_dir()) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in dir {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((kind, original)) = split_kind(&name) else {
                continue;
            };
            let Some(parsed) = CheckpointFileName::parse(original) else {
                continue;
            };
            if stage.is_some_and(|s| s != parsed.stage) {
                continue;
            }

            files.push(BackupFile {
                kind,
                path: entry.path(),
                original_name: original.to_string(),
                stage: parsed.stage,
                stamp: parsed.stamp,
                modified: DateTime::<Utc>::from(metadata.modified()?),
            });
        }

        files.sort_by(|a, b| {
            (a.modified, a.stamp, &a.original_name).cmp(&(b.modified, b.stamp, &b.original_name))
        });
        Ok(files)
    }

    /// Every verified checkpoint in the pruned archive, keyed by id
    pub fn archived_checkpoints(&self) -> Result<HashMap<CheckpointId, Checkpoint>> {
        let mut archived = HashMap::new();
        for file in self.list(None)? {
            if file.kind != BackupKind::Pruned {
                continue;
            }
            match read_verified(&file.path, None, Some(file.stage.as_str())) {
                Ok(record) => {
                    archived.insert(record.id.clone(), record);
                }
                Err(defect) => {
                    debug!(path = %file.path.display(), reason = %defect, "Ignoring unverifiable archive file");
                }
            }
        }
        Ok(archived)
    }
}

fn split_kind(name: &str) -> Option<(BackupKind, &str)> {
    if let Some(rest) = name.strip_prefix(BACKUP_PREFIX) {
        Some((BackupKind::Backup, rest))
    } else {
        name.strip_prefix(PRUNED_PREFIX)
            .map(|rest| (BackupKind::Pruned, rest))
    }
}
