//! Per-stage checkpoint history
//!
//! A chain is derived, never stored. It starts at the registry-latest checkpoint
//! of a stage and follows `previous_checkpoint` links backward:
//!
//! ```text
//!   registry latest
//!         │
//!         ▼
//!   ┌───────────┐  previous   ┌───────────┐  previous   ┌───────────┐
//!   │  C3 (live)│ ──────────► │ C2 (live) │ ──────────► │C1 (pruned)│ ──► null
//!   └───────────┘             └───────────┘             └───────────┘
//!
//!   chain = [C1, C2, C3]   archived_links = 1
//! ```
//!
//! Predecessors are resolved through the registry first and then through verified
//! files in the pruned archive. A link that resolves nowhere, or whose file fails
//! verification, ends the walk and is recorded as unresolved. Building a chain
//! never restores or rewrites anything.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::backup::BackupCoordinator;
use crate::checkpoint::{Checkpoint, CheckpointId};
use crate::error::Result;
use crate::integrity::read_verified;
use crate::layout::StoreLayout;
use crate::registry::Registry;

/// Ordered history of one stage, oldest first
#[derive(Debug, Clone, Default)]
pub struct Chain {
    pub stage: String,
    pub checkpoints: Vec<Checkpoint>,
    /// Link target the walk could not resolve, if any
    pub unresolved: Option<CheckpointId>,
    /// Links resolved from the pruned archive
    pub archived_links: usize,
}

/// Why two neighbours in a chain do not line up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// `previous_checkpoint` names something other than the older neighbour
    Mismatch,
    /// Timestamps do not increase
    OutOfOrder,
    /// Predecessor could not be loaded
    Unresolved,
}

/// One break in a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenLink {
    pub kind: BreakKind,
    /// Index in the chain of the checkpoint whose link is broken
    pub position: usize,
    pub checkpoint_id: CheckpointId,
    pub expected_previous: Option<CheckpointId>,
    pub actual_previous: Option<CheckpointId>,
}

impl Chain {
    pub fn empty(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.checkpoints.iter().map(|c| c.id.as_str()).collect()
    }

    /// Last update time of the stage
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.latest().map(|c| c.timestamp)
    }

    /// True when no link is broken; an empty chain is complete
    pub fn is_complete(&self) -> bool {
        ChainTracker::is_complete(self)
    }

    /// Every break, oldest position first
    pub fn broken_links(&self) -> Vec<BrokenLink> {
        let mut broken = Vec::new();

        if let Some(first) = self.checkpoints.first() {
            if self.unresolved.is_some() || first.previous_checkpoint.is_some() {
                broken.push(BrokenLink {
                    kind: BreakKind::Unresolved,
                    position: 0,
                    checkpoint_id: first.id.clone(),
                    expected_previous: None,
                    actual_previous: first.previous_checkpoint.clone(),
                });
            }
        } else if let Some(unresolved) = &self.unresolved {
            // Even the latest entry could not be loaded
            broken.push(BrokenLink {
                kind: BreakKind::Unresolved,
                position: 0,
                checkpoint_id: unresolved.clone(),
                expected_previous: None,
                actual_previous: None,
            });
        }

        for (i, pair) in self.checkpoints.windows(2).enumerate() {
            let (older, newer) = (&pair[0], &pair[1]);
            if newer.previous_checkpoint.as_deref() != Some(older.id.as_str()) {
                broken.push(BrokenLink {
                    kind: BreakKind::Mismatch,
                    position: i + 1,
                    checkpoint_id: newer.id.clone(),
                    expected_previous: Some(older.id.clone()),
                    actual_previous: newer.previous_checkpoint.clone(),
                });
            } else if newer.timestamp <= older.timestamp {
                broken.push(BrokenLink {
                    kind: BreakKind::OutOfOrder,
                    position: i + 1,
                    checkpoint_id: newer.id.clone(),
                    expected_previous: Some(older.id.clone()),
                    actual_previous: newer.previous_checkpoint.clone(),
                });
            }
        }
        broken
    }
}

/// Rebuilds chains from the registry and the backup area
pub struct ChainTracker<'a> {
    layout: &'a StoreLayout,
    registry: &'a Registry,
    backups: &'a BackupCoordinator,
}

impl<'a> ChainTracker<'a> {
    pub fn new(
        layout: &'a StoreLayout,
        registry: &'a Registry,
        backups: &'a BackupCoordinator,
    ) -> Self {
        Self {
            layout,
            registry,
            backups,
        }
    }

    /// Walk back from the registry-latest checkpoint of `stage`
    pub fn build_chain(&self, stage: &str) -> Result<Chain> {
        let mut chain = Chain::empty(stage);
        let Some((latest_id, _)) = self.registry.latest(stage) else {
            return Ok(chain);
        };

        let mut archive: Option<HashMap<CheckpointId, Checkpoint>> = None;
        let mut visited: HashSet<CheckpointId> = HashSet::new();
        let mut newest_first = Vec::new();
        let mut next = Some(latest_id.clone());

        while let Some(id) = next.take() {
            if !visited.insert(id.clone()) {
                debug!(stage = %stage, checkpoint_id = %id, "Cycle in checkpoint links");
                chain.unresolved = Some(id);
                break;
            }

            match self.resolve(stage, &id, &mut archive)? {
                Some((record, archived)) => {
                    if archived {
                        chain.archived_links += 1;
                    }
                    next = record.previous_checkpoint.clone();
                    newest_first.push(record);
                }
                None => {
                    debug!(stage = %stage, checkpoint_id = %id, "Unresolved checkpoint link");
                    chain.unresolved = Some(id);
                    break;
                }
            }
        }

        newest_first.reverse();
        chain.checkpoints = newest_first;
        Ok(chain)
    }

    fn resolve(
        &self,
        stage: &str,
        id: &str,
        archive: &mut Option<HashMap<CheckpointId, Checkpoint>>,
    ) -> Result<Option<(Checkpoint, bool)>> {
        if let Some(entry) = self.registry.get(id) {
            let path = self.layout.live_path(&entry.file);
            match read_verified(&path, Some(id), Some(stage)) {
                Ok(record) => return Ok(Some((record, false))),
                Err(defect) => {
                    debug!(checkpoint_id = %id, path = %path.display(), reason = %defect, "Registered link fails verification");
                }
            }
        }

        if archive.is_none() {
            *archive = Some(self.backups.archived_checkpoints()?);
        }
        let found = archive
            .as_ref()
            .and_then(|map| map.get(id))
            .filter(|record| record.stage == stage)
            .cloned();
        Ok(found.map(|record| (record, true)))
    }

    /// True iff every adjacent pair is linked, timestamps increase, and the
    /// oldest checkpoint is a root
    pub fn is_complete(chain: &Chain) -> bool {
        chain.broken_links().is_empty()
    }
}
