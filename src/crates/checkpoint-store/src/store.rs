//! Checkpoint store façade
//!
//! [`CheckpointStore`] combines the registry, backup coordinator, chain tracker
//! and integrity checks into the operations a pipeline driver uses.
//!
//! # Crash Safety
//!
//! Each mutating operation writes new bytes under fresh names first and touches
//! the registry last, with a single atomic write:
//!
//! ```text
//! save      backup latest ─► write new file ─► registry put
//! rollback  verify target ─► backup latest  ─► registry remove (newer entries)
//! prune     copy to pruned_ ─► registry remove (all archived) ─► delete live files
//! ```
//!
//! An interruption before the registry write leaves the store as it was (plus
//! unreferenced files); after it, the operation is complete.
//!
//! # Concurrency
//!
//! One writer per stage. Mutations take `&mut self`; two processes saving the
//! same stage concurrently can fork its chain.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::atomic::{atomic_write, WriteOptions};
use crate::backup::{ArchiveCopy, BackupCoordinator, BackupFile};
use crate::chain::{Chain, ChainTracker};
use crate::checkpoint::{validate_stage, Checkpoint, CheckpointId, CheckpointMetadata, CheckpointQuery};
use crate::config::StoreConfig;
use crate::error::{CheckpointError, Result};
use crate::integrity::{self, read_verified, FileDefect};
use crate::layout::StoreLayout;
use crate::registry::{Registry, RegistryDiagnostic, RegistryEntry};

/// Progress of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    NotStarted,
    InProgress,
}

/// Summary of one stage derived from its chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub status: StageState,
    pub checkpoint_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub chain_complete: bool,
    pub latest_id: Option<CheckpointId>,
    pub chain_length: usize,
    pub archived_links: usize,
}

/// A checkpoint file that passed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedFile {
    pub path: PathBuf,
    pub checkpoint_id: CheckpointId,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
}

/// A checkpoint file that failed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidFile {
    pub path: PathBuf,
    pub reason: String,
    /// Stage recorded in the file, when readable
    pub stage: Option<String>,
    /// Timestamp recorded in the file, when readable
    pub timestamp: Option<String>,
}

/// Result of [`CheckpointStore::verify_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub valid: Vec<VerifiedFile>,
    pub invalid: Vec<InvalidFile>,
}

impl VerifyReport {
    pub fn total(&self) -> usize {
        self.valid.len() + self.invalid.len()
    }

    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// A checkpoint retired into the pruned archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedCheckpoint {
    pub stage: String,
    pub checkpoint_id: CheckpointId,
    pub archive_path: PathBuf,
}

/// A prune candidate left in place because removing it could break recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousPrune {
    pub stage: String,
    pub checkpoint_id: CheckpointId,
    pub file: String,
    pub reason: String,
}

/// Result of [`CheckpointStore::prune`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub archived: Vec<ArchivedCheckpoint>,
    pub skipped: Vec<AmbiguousPrune>,
    /// Registered checkpoints per stage after pruning
    pub kept: BTreeMap<String, usize>,
}

/// Durable, verified, chained checkpoints for a multi-stage pipeline
#[derive(Debug)]
pub struct CheckpointStore {
    config: StoreConfig,
    layout: StoreLayout,
    options: WriteOptions,
    registry: Registry,
    backups: BackupCoordinator,
    registry_diagnostic: Option<RegistryDiagnostic>,
}

impl CheckpointStore {
    /// Open (or create) a store
    ///
    /// An unreadable registry starts the store empty and is reported through
    /// [`registry_diagnostic`](Self::registry_diagnostic), unless
    /// `strict_registry` is set, in which case opening fails.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let layout = StoreLayout::from_config(&config);
        layout.ensure_dirs()?;

        let options = WriteOptions::from_config(&config);
        let (registry, registry_diagnostic) = Registry::load(layout.registry_path(), options);
        if let Some(diagnostic) = &registry_diagnostic {
            if config.strict_registry {
                return Err(diagnostic.clone().into());
            }
        }

        info!(
            dir = %layout.checkpoint_dir().display(),
            checkpoints = registry.len(),
            "Opened checkpoint store"
        );

        Ok(Self {
            backups: BackupCoordinator::new(layout.clone(), options),
            config,
            layout,
            options,
            registry,
            registry_diagnostic,
        })
    }

    /// Open with default configuration rooted at `base_dir`
    pub fn open_dir(base_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open(StoreConfig::new(base_dir))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn backups(&self) -> &BackupCoordinator {
        &self.backups
    }

    pub(crate) fn write_options(&self) -> WriteOptions {
        self.options
    }

    /// Problem found with the registry file at open, if any
    pub fn registry_diagnostic(&self) -> Option<&RegistryDiagnostic> {
        self.registry_diagnostic.as_ref()
    }

    /// Stages with at least one registered checkpoint
    pub fn stages(&self) -> BTreeSet<String> {
        self.registry.stages()
    }

    /// Persist a new checkpoint for `stage`
    pub fn save(
        &mut self,
        stage: &str,
        data: serde_json::Value,
        metadata: Option<CheckpointMetadata>,
    ) -> Result<Checkpoint> {
        validate_stage(stage)?;

        let previous: Option<(CheckpointId, RegistryEntry)> = self
            .registry
            .latest(stage)
            .map(|(id, entry)| (id.clone(), entry.clone()));

        self.backups.backup_latest(&self.registry, stage)?;

        let now = Utc::now();
        let timestamp = match &previous {
            Some((_, entry)) if now <= entry.timestamp => entry.timestamp + Duration::nanoseconds(1),
            _ => now,
        };

        let digest = integrity::content_digest(&data)?;
        let id = integrity::derive_checkpoint_id(stage, &timestamp, &digest);
        if self.registry.contains(&id) {
            return Err(CheckpointError::Storage(format!(
                "derived checkpoint id {} already registered",
                id
            )));
        }

        let mut record = Checkpoint {
            id,
            stage: stage.to_string(),
            timestamp,
            data,
            metadata: metadata.unwrap_or_default(),
            previous_checkpoint: previous.map(|(id, _)| id),
            checksum: String::new(),
        };
        record.checksum = integrity::checksum(&record)?;

        let file_name = self.layout.fresh_file_name(stage, &timestamp);
        let path = self.layout.live_path(&file_name);
        atomic_write(&path, &record.to_json_bytes(self.options.pretty)?, self.options.sync)?;
        self.registry
            .put(record.id.clone(), stage, file_name, timestamp)?;

        info!(
            stage = %stage,
            checkpoint_id = %record.id,
            previous = ?record.previous_checkpoint,
            path = %path.display(),
            "Saved checkpoint"
        );
        Ok(record)
    }

    /// Load a verified checkpoint
    ///
    /// A file that is missing, malformed or fails its checksum triggers one
    /// backup restore and one retry. If the retry fails too the error is
    /// [`CheckpointError::CorruptCheckpoint`]; unverified data is never returned.
    pub fn load(&self, query: &CheckpointQuery) -> Result<Checkpoint> {
        let (id, entry) = self.resolve(query)?;

        let path = self.layout.live_path(&entry.file);
        let defect = match read_verified(&path, Some(id.as_str()), Some(entry.stage.as_str())) {
            Ok(record) => {
                debug!(stage = %entry.stage, checkpoint_id = %id, "Loaded checkpoint");
                return Ok(record);
            }
            Err(defect) => defect,
        };

        warn!(
            stage = %entry.stage,
            checkpoint_id = %id,
            path = %path.display(),
            reason = %defect,
            "Checkpoint failed verification, attempting backup restore"
        );

        let restored = match self.backups.restore_for(&entry.stage, &entry.file) {
            Ok(restored) => restored,
            Err(e) => {
                warn!(stage = %entry.stage, error = %e, "Backup restore failed");
                None
            }
        };

        let (retry_id, retry_entry) = self.resolve(query)?;
        let retry_path = self.layout.live_path(&retry_entry.file);
        match read_verified(&retry_path, Some(retry_id.as_str()), Some(retry_entry.stage.as_str())) {
            Ok(record) => {
                info!(stage = %retry_entry.stage, checkpoint_id = %retry_id, "Loaded checkpoint after backup restore");
                Ok(record)
            }
            Err(retry_defect) => {
                let reason = match restored {
                    Some(_) => format!("{} (after backup restore: {})", defect, retry_defect),
                    None => format!("{} (no backup available)", defect),
                };
                Err(CheckpointError::CorruptCheckpoint {
                    stage: retry_entry.stage,
                    checkpoint_id: retry_id,
                    path: retry_path,
                    reason,
                })
            }
        }
    }

    /// Latest verified checkpoint of `stage`
    pub fn load_latest(&self, stage: &str) -> Result<Checkpoint> {
        self.load(&CheckpointQuery::latest(stage))
    }

    /// A specific verified checkpoint
    pub fn load_by_id(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.load(&CheckpointQuery::by_id(checkpoint_id))
    }

    fn resolve(&self, query: &CheckpointQuery) -> Result<(CheckpointId, RegistryEntry)> {
        if let Some(id) = &query.checkpoint_id {
            return self
                .registry
                .get(id)
                .map(|entry| (id.clone(), entry.clone()))
                .ok_or_else(|| CheckpointError::NotFound(format!("checkpoint {}", id)));
        }
        if let Some(stage) = &query.stage {
            return self
                .registry
                .latest(stage)
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .ok_or_else(|| CheckpointError::NotFound(format!("no checkpoints for stage '{}'", stage)));
        }
        Err(CheckpointError::Invalid(
            "query needs a stage or a checkpoint id".to_string(),
        ))
    }

    /// Check every checkpoint file in the checkpoint directory
    ///
    /// Independent of the registry; the result is an audit and never feeds back
    /// into it.
    pub fn verify_all(&self) -> Result<VerifyReport> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(self.layout.checkpoint_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == self.config.registry_file
                || StoreLayout::is_temp_file(&name)
                || !name.ends_with(".json")
            {
                continue;
            }
            paths.push(entry.path());
        }
        paths.sort();

        let mut report = VerifyReport::default();
        for path in paths {
            match read_verified(&path, None, None) {
                Ok(record) => report.valid.push(VerifiedFile {
                    path,
                    checkpoint_id: record.id,
                    stage: record.stage,
                    timestamp: record.timestamp,
                }),
                Err(defect) => {
                    let (stage, timestamp) = recorded_fields(&path);
                    report.invalid.push(InvalidFile {
                        path,
                        reason: defect.to_string(),
                        stage,
                        timestamp,
                    });
                }
            }
        }

        if !report.is_clean() {
            warn!(invalid = report.invalid.len(), valid = report.valid.len(), "Invalid checkpoint files found");
        }
        Ok(report)
    }

    /// Make `checkpoint_id` the latest checkpoint of its stage
    ///
    /// Returns false, changing nothing, when the target is not registered or
    /// fails verification. Newer entries leave the registry; their files stay
    /// on disk.
    pub fn rollback_to(&mut self, checkpoint_id: &str) -> Result<bool> {
        let Some(target) = self.registry.get(checkpoint_id).cloned() else {
            warn!(checkpoint_id = %checkpoint_id, "Rollback target not registered");
            return Ok(false);
        };

        let path = self.layout.live_path(&target.file);
        if let Err(defect) = read_verified(&path, Some(checkpoint_id), Some(target.stage.as_str())) {
            warn!(
                stage = %target.stage,
                checkpoint_id = %checkpoint_id,
                reason = %defect,
                "Rollback target fails verification"
            );
            return Ok(false);
        }

        self.backups.backup_latest(&self.registry, &target.stage)?;

        let newer: Vec<CheckpointId> = self
            .registry
            .entries_for_stage(&target.stage)
            .into_iter()
            .filter(|(_, entry)| entry.timestamp > target.timestamp)
            .map(|(id, _)| id.clone())
            .collect();
        self.registry.remove_many(&newer)?;

        info!(
            stage = %target.stage,
            checkpoint_id = %checkpoint_id,
            detached = newer.len(),
            "Rolled back stage"
        );
        Ok(true)
    }

    /// Rebuild the chain of `stage`
    pub fn build_chain(&self, stage: &str) -> Result<Chain> {
        ChainTracker::new(&self.layout, &self.registry, &self.backups).build_chain(stage)
    }

    /// Status of `stage` derived from its chain
    pub fn stage_status(&self, stage: &str) -> Result<StageStatus> {
        let chain = self.build_chain(stage)?;
        Ok(status_from_chain(&chain))
    }

    /// Most recent backup of `stage` copied back into the live area
    pub fn restore_latest_backup(&self, stage: &str) -> Result<Option<PathBuf>> {
        validate_stage(stage)?;
        self.backups.restore_latest(stage)
    }

    /// Files in the backup area, optionally for one stage
    pub fn list_backups(&self, stage: Option<&str>) -> Result<Vec<BackupFile>> {
        self.backups.list(stage)
    }

    /// Prune with the configured retention policy
    pub fn prune_with_policy(&mut self) -> Result<PruneReport> {
        self.prune(self.config.retention.max_per_stage)
    }

    /// Keep at most `max_per_stage` registered checkpoints per stage
    ///
    /// Older checkpoints move to the pruned archive. The registry-latest
    /// checkpoint of a stage is always kept. Candidates whose removal could
    /// lose recoverable history are skipped and reported.
    pub fn prune(&mut self, max_per_stage: usize) -> Result<PruneReport> {
        if max_per_stage == 0 {
            return Err(CheckpointError::Invalid(
                "max_per_stage must be at least 1".to_string(),
            ));
        }

        let mut report = PruneReport::default();
        let mut staged: Vec<(CheckpointId, String, String)> = Vec::new();

        for stage in self.registry.stages() {
            let candidates = self.prune_candidates(&stage, max_per_stage);
            if candidates.is_empty() {
                continue;
            }
            let linked = self.linked_ids(&stage);

            for (id, file) in candidates {
                match self.stage_for_prune(&stage, &id, &file, &linked)? {
                    Ok(archive_path) => {
                        report.archived.push(ArchivedCheckpoint {
                            stage: stage.clone(),
                            checkpoint_id: id.clone(),
                            archive_path,
                        });
                        staged.push((id, stage.clone(), file));
                    }
                    Err(reason) => {
                        warn!(stage = %stage, checkpoint_id = %id, reason = %reason, "Skipping ambiguous prune candidate");
                        report.skipped.push(AmbiguousPrune {
                            stage: stage.clone(),
                            checkpoint_id: id,
                            file,
                            reason,
                        });
                    }
                }
            }
        }

        if !staged.is_empty() {
            self.registry.remove_many(staged.iter().map(|(id, _, _)| id))?;

            for (id, stage, file) in &staged {
                if let Err(e) = self.backups.discard_live(file) {
                    warn!(stage = %stage, checkpoint_id = %id, error = %e, "Archived checkpoint left in live area");
                }
                info!(stage = %stage, checkpoint_id = %id, "Pruned checkpoint");
            }
        }

        for stage in self.registry.stages() {
            let count = self.registry.entries_for_stage(&stage).len();
            report.kept.insert(stage, count);
        }
        Ok(report)
    }

    /// Registered checkpoints beyond the retention limit, as `(id, file)`
    fn prune_candidates(&self, stage: &str, max_per_stage: usize) -> Vec<(CheckpointId, String)> {
        let entries = self.registry.entries_for_stage(stage);
        if entries.len() <= max_per_stage {
            return Vec::new();
        }
        let latest_id = self.registry.latest(stage).map(|(id, _)| id.clone());

        let mut ordered: Vec<(Option<std::time::SystemTime>, &CheckpointId, &RegistryEntry)> = entries
            .into_iter()
            .map(|(id, entry)| (modified(&self.layout.live_path(&entry.file)), id, entry))
            .collect();
        // Newest first: mtime, then creation time, then insertion order
        ordered.sort_by(|a, b| {
            (b.0, b.2.timestamp, b.2.seq).cmp(&(a.0, a.2.timestamp, a.2.seq))
        });

        let mut keep: Vec<&CheckpointId> = Vec::with_capacity(max_per_stage);
        if let Some(latest) = &latest_id {
            keep.extend(ordered.iter().map(|(_, id, _)| *id).filter(|id| *id == latest));
        }
        for (_, id, _) in &ordered {
            if keep.len() >= max_per_stage {
                break;
            }
            if !keep.contains(id) {
                keep.push(*id);
            }
        }

        ordered
            .iter()
            .filter(|(_, id, _)| !keep.contains(id))
            .map(|(_, id, entry)| ((*id).clone(), entry.file.clone()))
            .collect()
    }

    /// Ids referenced as a predecessor by any readable checkpoint of `stage`
    fn linked_ids(&self, stage: &str) -> HashSet<CheckpointId> {
        self.registry
            .entries_for_stage(stage)
            .into_iter()
            .filter_map(|(_, entry)| std::fs::read(self.layout.live_path(&entry.file)).ok())
            .filter_map(|bytes| Checkpoint::from_slice(&bytes).ok())
            .filter_map(|record| record.previous_checkpoint)
            .collect()
    }

    /// Copy one candidate into the archive; `Ok(Err(reason))` means skip it
    fn stage_for_prune(
        &self,
        stage: &str,
        id: &str,
        file: &str,
        linked: &HashSet<CheckpointId>,
    ) -> Result<std::result::Result<PathBuf, String>> {
        let live = self.layout.live_path(file);
        match read_verified(&live, Some(id), Some(stage)) {
            Ok(_) => {}
            Err(FileDefect::Missing) => return Ok(Err("checkpoint file missing".to_string())),
            Err(defect) if linked.contains(id) => {
                return Ok(Err(format!("linked checkpoint fails verification: {}", defect)))
            }
            Err(defect) => {
                debug!(stage = %stage, checkpoint_id = %id, reason = %defect, "Archiving unlinked unverified checkpoint");
            }
        }

        let archive_path = match self.backups.copy_to_archive(file)? {
            ArchiveCopy::Copied(path) | ArchiveCopy::AlreadyArchived(path) => path,
            ArchiveCopy::Conflict(path) => {
                return Ok(Err(format!(
                    "archive name {} already holds different content",
                    path.display()
                )))
            }
        };

        if linked.contains(id) && read_verified(&archive_path, Some(id), Some(stage)).is_err() {
            return Ok(Err("archived copy does not verify".to_string()));
        }
        Ok(Ok(archive_path))
    }
}

/// Build a [`StageStatus`] from an already built chain
pub fn status_from_chain(chain: &Chain) -> StageStatus {
    let status = if chain.is_empty() && chain.unresolved.is_none() {
        StageState::NotStarted
    } else {
        StageState::InProgress
    };
    StageStatus {
        stage: chain.stage.clone(),
        status,
        checkpoint_count: chain.len(),
        last_updated: chain.last_updated(),
        chain_complete: chain.is_complete(),
        latest_id: chain.latest().map(|c| c.id.clone()),
        chain_length: chain.len(),
        archived_links: chain.archived_links,
    }
}

fn modified(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Stage and timestamp from a file that may not be a valid checkpoint
fn recorded_fields(path: &Path) -> (Option<String>, Option<String>) {
    let value = std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok());
    let field = |name: &str| {
        value
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    (field("stage"), field("timestamp"))
}
