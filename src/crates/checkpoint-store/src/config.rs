//! Store configuration
//!
//! Configuration is passed explicitly into [`CheckpointStore::open`](crate::CheckpointStore::open).
//! Sources are applied in order:
//!
//! 1. Built-in defaults ([`StoreConfig::default`])
//! 2. A config file (`.toml`, `.json`, `.yaml` / `.yml`), see [`StoreConfig::from_file`]
//! 3. Environment variables, see [`StoreConfig::apply_env_overrides`]
//!
//! # Example
//!
//! ```toml
//! base_dir = "/var/lib/pipeline"
//! strict_registry = true
//!
//! [retention]
//! max_per_stage = 3
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::checkpoint::validate_stage;
use crate::error::{CheckpointError, Result};

/// Overrides `base_dir`
pub const ENV_STORE_DIR: &str = "CHECKPOINT_STORE_DIR";

/// Overrides `retention.max_per_stage`
pub const ENV_MAX_PER_STAGE: &str = "CHECKPOINT_MAX_PER_STAGE";

/// How many registered checkpoints each stage keeps when pruning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_per_stage: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_per_stage: 5 }
    }
}

/// Checkpoint store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Root under which the checkpoint directory lives
    pub base_dir: PathBuf,

    /// Checkpoint directory, relative to `base_dir`
    pub checkpoint_dir: PathBuf,

    /// Registry file name inside the checkpoint directory
    pub registry_file: String,

    /// Backup area, relative to the checkpoint directory
    pub backup_dir: PathBuf,

    pub retention: RetentionPolicy,

    /// Fail `open` on an unreadable registry instead of starting empty
    pub strict_registry: bool,

    /// Pretty-print checkpoint and registry documents
    pub pretty_json: bool,

    /// fsync every write before it is considered durable
    pub sync_writes: bool,

    /// Stage names known to the pipeline, used for reporting
    pub stages: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            checkpoint_dir: PathBuf::from("checkpoints"),
            registry_file: "checkpoint_registry.json".to_string(),
            backup_dir: PathBuf::from("backups"),
            retention: RetentionPolicy::default(),
            strict_registry: false,
            pretty_json: true,
            sync_writes: true,
            stages: ["setup", "parse", "thread", "analyze", "final"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_per_stage(mut self, max_per_stage: usize) -> Self {
        self.retention.max_per_stage = max_per_stage;
        self
    }

    pub fn with_strict_registry(mut self, strict: bool) -> Self {
        self.strict_registry = strict;
        self
    }

    pub fn with_pretty_json(mut self, pretty: bool) -> Self {
        self.pretty_json = pretty;
        self
    }

    /// Disable fsync, useful for tests and benchmarks
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages = stages.into_iter().map(Into::into).collect();
        self
    }

    /// Load from a file, choosing the format by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| {
                CheckpointError::Config(format!(
                    "Unable to determine file extension for {}",
                    path.display()
                ))
            })?;

        let content = std::fs::read_to_string(path).map_err(|e| {
            CheckpointError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config = match extension.to_lowercase().as_str() {
            "toml" => parse_with(path, "TOML", || toml::from_str(&content))?,
            "json" => parse_with(path, "JSON", || serde_json::from_str(&content))?,
            "yaml" | "yml" => parse_with(path, "YAML", || serde_yaml::from_str(&content))?,
            other => {
                return Err(CheckpointError::Config(format!(
                    "Unsupported config file extension: {}",
                    other
                )))
            }
        };

        debug!(path = %path.display(), "Loaded store configuration");
        Ok(config)
    }

    /// Apply `CHECKPOINT_STORE_DIR` and `CHECKPOINT_MAX_PER_STAGE`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(ENV_STORE_DIR).filter(|v| !v.is_empty()) {
            debug!(base_dir = %dir, "Store directory overridden from environment");
            self.base_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_MAX_PER_STAGE).filter(|v| !v.is_empty()) {
            self.retention.max_per_stage = raw.trim().parse().map_err(|e| {
                CheckpointError::Config(format!(
                    "Failed to parse environment variable '{}': {}",
                    ENV_MAX_PER_STAGE, e
                ))
            })?;
        }
        Ok(())
    }

    /// Check every field the store relies on
    pub fn validate(&self) -> Result<()> {
        if self.retention.max_per_stage == 0 {
            return Err(CheckpointError::Config(
                "retention.max_per_stage must be at least 1".to_string(),
            ));
        }
        if self.registry_file.is_empty()
            || self.registry_file.contains(['/', '\\'])
            || !self.registry_file.ends_with(".json")
        {
            return Err(CheckpointError::Config(format!(
                "registry_file must be a plain '.json' file name, got '{}'",
                self.registry_file
            )));
        }
        if self.checkpoint_dir.as_os_str().is_empty() || self.backup_dir.as_os_str().is_empty() {
            return Err(CheckpointError::Config(
                "checkpoint_dir and backup_dir must not be empty".to_string(),
            ));
        }
        for stage in &self.stages {
            validate_stage(stage).map_err(|e| CheckpointError::Config(e.to_string()))?;
        }
        Ok(())
    }

    /// Defaults, then `path` if given, then the environment; validated
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_with<T, E, F>(path: &Path, format: &str, parse: F) -> Result<T>
where
    T: DeserializeOwned,
    E: std::fmt::Display,
    F: FnOnce() -> std::result::Result<T, E>,
{
    parse().map_err(|e| {
        CheckpointError::Config(format!(
            "Failed to parse {} config from {}: {}",
            format,
            path.display(),
            e
        ))
    })
}
