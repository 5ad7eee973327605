//! Crash-safe file replacement
//!
//! Every file the store writes (checkpoints, the registry, backups) goes through
//! [`atomic_write`]: the bytes land in a uniquely named temp file beside the target,
//! are flushed, then renamed over the target. A reader observes either the old
//! content or the new content, never a prefix.

use std::io::Write;
use std::path::Path;

use tracing::trace;

use crate::config::StoreConfig;

/// How documents are encoded and flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Pretty-print JSON documents
    pub pretty: bool,
    /// fsync files and directories on write
    pub sync: bool,
}

impl WriteOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            pretty: config.pretty_json,
            sync: config.sync_writes,
        }
    }

    /// Serialize `value` as JSON according to `pretty`
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> serde_json::Result<Vec<u8>> {
        if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
    }
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            pretty: true,
            sync: true,
        }
    }
}

/// Write `data` to `path` via temp file and rename
///
/// With `sync` set, the temp file is fsynced before the rename and the parent
/// directory is fsynced after it (best effort on unix).
pub fn atomic_write(path: &Path, data: &[u8], sync: bool) -> std::io::Result<()> {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(&temp_name);

    let result = write_then_rename(&temp_path, path, data, sync);
    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result?;

    #[cfg(unix)]
    if sync {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }

    trace!(path = %path.display(), bytes = data.len(), "Atomic write complete");
    Ok(())
}

fn write_then_rename(temp_path: &Path, path: &Path, data: &[u8], sync: bool) -> std::io::Result<()> {
    let mut file = std::fs::File::create(temp_path)?;
    file.write_all(data)?;
    if sync {
        file.sync_all()?;
    }
    drop(file);
    std::fs::rename(temp_path, path)
}

/// Copy `from` to `to` with the same all-or-nothing guarantee as [`atomic_write`]
pub fn atomic_copy(from: &Path, to: &Path, sync: bool) -> std::io::Result<Vec<u8>> {
    let bytes = std::fs::read(from)?;
    atomic_write(to, &bytes, sync)?;
    Ok(bytes)
}
