//! # checkpoint-store - Durable Stage Checkpoints for Multi-Stage Pipelines
//!
//! **Verified, chained, crash-safe persistence** for the intermediate state of a
//! pipeline. Each completed stage hands its output to the store; the store writes
//! it as an immutable JSON checkpoint, links it to the stage's previous
//! checkpoint, and can later reload, audit, roll back or prune that history.
//!
//! ## Overview
//!
//! - **Integrity** - every checkpoint carries a SHA-256 checksum over its canonical content
//! - **Chains** - checkpoints of a stage link backward via `previous_checkpoint`
//! - **Recovery** - a corrupt checkpoint triggers one restore from the backup area
//! - **Rollback** - detach newer checkpoints and make an older one current again
//! - **Retention** - prune old checkpoints into an archive without losing the bytes
//!
//! ## Core Concepts
//!
//! ### 1. Registry
//!
//! The [`Registry`] (`checkpoint_registry.json`) is the only source of truth for
//! which checkpoints exist. Files on disk without an entry are orphans and are
//! never adopted. An unparsable registry starts the store empty and surfaces a
//! [`RegistryDiagnostic`].
//!
//! ### 2. Backup Area
//!
//! The [`BackupCoordinator`] keeps `backup_<file>` copies of a stage's latest
//! checkpoint before it is superseded, and `pruned_<file>` copies of checkpoints
//! retired by [`CheckpointStore::prune`].
//!
//! ### 3. Chains
//!
//! [`ChainTracker`] rebuilds a stage's history from the registry and the pruned
//! archive and reports broken links as data, not errors.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use checkpoint_store::{CheckpointMetadata, CheckpointStore, StoreConfig};
//! use serde_json::json;
//!
//! fn main() -> checkpoint_store::Result<()> {
//!     let mut store = CheckpointStore::open(StoreConfig::new("./pipeline"))?;
//!
//!     let first = store.save("parse", json!({"messages": 412}), None)?;
//!     let second = store.save(
//!         "parse",
//!         json!({"messages": 415}),
//!         Some(CheckpointMetadata::new().with_entry("source", json!("rerun"))),
//!     )?;
//!     assert_eq!(second.previous_checkpoint.as_deref(), Some(first.id.as_str()));
//!
//!     let latest = store.load_latest("parse")?;
//!     assert_eq!(latest.data, json!({"messages": 415}));
//!
//!     let chain = store.build_chain("parse")?;
//!     assert!(chain.is_complete());
//!
//!     store.rollback_to(&first.id)?;
//!     store.prune(5)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`checkpoint`] - record types and queries
//! - [`integrity`] - canonical JSON, checksums, identifier derivation
//! - [`registry`] - the durable index
//! - [`backup`] - backup and pruned archive
//! - [`chain`] - chain reconstruction
//! - [`store`] - the façade
//! - [`config`] - configuration loading
//! - [`report`] - markdown status report
//! - [`traits`] - stage executor interface
//!
//! ## Limitations
//!
//! The store assumes one writer per stage. Two processes saving the same stage
//! at once can both link to the same predecessor and fork the chain.

pub mod atomic;
pub mod backup;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod integrity;
pub mod layout;
pub mod registry;
pub mod report;
pub mod store;
pub mod traits;

// Re-export main types
pub use backup::{ArchiveCopy, BackupCoordinator, BackupFile, BackupKind};
pub use chain::{BreakKind, BrokenLink, Chain, ChainTracker};
pub use checkpoint::{validate_stage, Checkpoint, CheckpointId, CheckpointMetadata, CheckpointQuery};
pub use config::{RetentionPolicy, StoreConfig};
pub use error::{CheckpointError, Result};
pub use integrity::{checksum, verify, FileDefect};
pub use layout::{CheckpointFileName, StoreLayout};
pub use registry::{Registry, RegistryDiagnostic, RegistryEntry};
pub use report::{CheckpointReport, StageReport};
pub use store::{
    AmbiguousPrune, ArchivedCheckpoint, CheckpointStore, InvalidFile, PruneReport, StageState,
    StageStatus, VerifiedFile, VerifyReport,
};
pub use traits::StageCheckpointer;
