//! Error types for checkpoint store operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type for checkpoint store operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint store operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// No registry entry for the requested stage or checkpoint id
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// Checkpoint failed verification, even after one backup restore attempt
    #[error("Corrupt checkpoint {checkpoint_id} for stage '{stage}' at {}: {reason}", path.display())]
    CorruptCheckpoint {
        stage: String,
        checkpoint_id: String,
        path: PathBuf,
        reason: String,
    },

    /// Registry file exists but cannot be parsed
    #[error("Registry unreadable at {}: {reason}", path.display())]
    RegistryUnreadable { path: PathBuf, reason: String },

    /// Stage name cannot be used as a file name component
    #[error("Invalid stage name '{0}': use ASCII letters, digits, '_' or '-'")]
    InvalidStage(String),

    /// Invalid request or argument
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage layout or file system invariant violated
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Returns true for the `NotFound` variant
    pub fn is_not_found(&self) -> bool {
        matches!(self, CheckpointError::NotFound(_))
    }

    /// Returns true for the `CorruptCheckpoint` variant
    pub fn is_corrupt(&self) -> bool {
        matches!(self, CheckpointError::CorruptCheckpoint { .. })
    }
}
