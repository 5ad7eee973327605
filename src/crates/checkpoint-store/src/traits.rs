//! Stage executor seam
//!
//! A pipeline driver talks to persistence through [`StageCheckpointer`]: it hands
//! over a payload when a stage completes and asks for one back when resuming.
//! [`CheckpointStore`] is the file-backed implementation; tests and embedders can
//! supply their own.
//!
//! ```text
//! ┌──────────────────────────┐
//! │  Pipeline driver         │
//! │  • run stage             │
//! │  • save_stage(...)       │──────┐
//! │  • resume(stage)?        │      │ StageCheckpointer
//! └──────────────────────────┘      ↓
//!                         ┌───────────────────────────┐
//!                         │  CheckpointStore          │
//!                         │  • registry + files       │
//!                         │  • backups, chains        │
//!                         └───────────────────────────┘
//! ```
//!
//! # Typed Payloads
//!
//! ```rust,ignore
//! #[derive(Serialize, Deserialize)]
//! struct ParseOutput { messages: Vec<String> }
//!
//! store.save_typed("parse", &ParseOutput { messages }, None)?;
//! let parsed: Option<ParseOutput> = store.load_typed("parse")?;
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::checkpoint::{Checkpoint, CheckpointMetadata};
use crate::error::Result;
use crate::store::CheckpointStore;

/// Persistence interface consumed by a stage executor
pub trait StageCheckpointer {
    /// Persist the output of a completed stage
    fn save_stage(
        &mut self,
        stage: &str,
        payload: serde_json::Value,
        metadata: Option<CheckpointMetadata>,
    ) -> Result<Checkpoint>;

    /// Latest verified checkpoint of `stage`
    fn load_stage(&self, stage: &str) -> Result<Checkpoint>;

    /// Like [`load_stage`](Self::load_stage), but a stage that was never
    /// checkpointed yields `None`
    fn resume(&self, stage: &str) -> Result<Option<Checkpoint>> {
        match self.load_stage(stage) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Serialize `payload` and save it
    fn save_typed<T: Serialize>(
        &mut self,
        stage: &str,
        payload: &T,
        metadata: Option<CheckpointMetadata>,
    ) -> Result<Checkpoint>
    where
        Self: Sized,
    {
        let value = serde_json::to_value(payload)?;
        self.save_stage(stage, value, metadata)
    }

    /// Load and deserialize the latest payload of `stage`
    fn load_typed<T: DeserializeOwned>(&self, stage: &str) -> Result<Option<T>>
    where
        Self: Sized,
    {
        match self.resume(stage)? {
            Some(checkpoint) => Ok(Some(serde_json::from_value(checkpoint.data)?)),
            None => Ok(None),
        }
    }
}

impl StageCheckpointer for CheckpointStore {
    fn save_stage(
        &mut self,
        stage: &str,
        payload: serde_json::Value,
        metadata: Option<CheckpointMetadata>,
    ) -> Result<Checkpoint> {
        self.save(stage, payload, metadata)
    }

    fn load_stage(&self, stage: &str) -> Result<Checkpoint> {
        self.load_latest(stage)
    }
}
