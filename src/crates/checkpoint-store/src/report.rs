//! Markdown status report over a store
//!
//! ```rust,ignore
//! let report = store.report(&store.config().stages)?;
//! let path = report.write_to(Path::new("output/reports"))?;
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::atomic::{atomic_write, WriteOptions};
use crate::chain::BrokenLink;
use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::store::{status_from_chain, CheckpointStore, InvalidFile, StageState, StageStatus};

/// Chains longer than this get a pruning recommendation
pub const PRUNE_RECOMMENDATION_THRESHOLD: usize = 10;

/// Everything the report knows about one stage
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub status: StageStatus,
    pub history: Vec<Checkpoint>,
    pub broken_links: Vec<BrokenLink>,
}

/// Snapshot of store health
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    pub generated_at: DateTime<Utc>,
    pub total_files: usize,
    pub valid_files: usize,
    pub invalid: Vec<InvalidFile>,
    pub stages: Vec<StageReport>,
    #[serde(skip)]
    write_options: WriteOptions,
}

impl CheckpointStore {
    /// Collect a report for `stages`
    pub fn report<S: AsRef<str>>(&self, stages: &[S]) -> Result<CheckpointReport> {
        let verification = self.verify_all()?;

        let mut reports = Vec::with_capacity(stages.len());
        for stage in stages {
            let chain = self.build_chain(stage.as_ref())?;
            reports.push(StageReport {
                status: status_from_chain(&chain),
                broken_links: chain.broken_links(),
                history: chain.checkpoints,
            });
        }

        Ok(CheckpointReport {
            generated_at: Utc::now(),
            total_files: verification.total(),
            valid_files: verification.valid.len(),
            invalid: verification.invalid,
            stages: reports,
            write_options: self.write_options(),
        })
    }
}

impl CheckpointReport {
    pub fn file_name(&self) -> String {
        format!(
            "checkpoint_report_{}.md",
            self.generated_at.format("%Y%m%d_%H%M%S")
        )
    }

    /// Write `checkpoint_report_<YYYYMMDD_HHMMSS>.md` into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        atomic_write(&path, self.render_markdown().as_bytes(), self.write_options.sync)?;
        info!(path = %path.display(), "Wrote checkpoint report");
        Ok(path)
    }

    pub fn render_markdown(&self) -> String {
        let mut lines = vec![
            "# Checkpoint Status Report".to_string(),
            format!("Generated: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")),
            String::new(),
            "## Overall Status".to_string(),
        ];
        self.overall_status(&mut lines);
        lines.push(String::new());
        lines.push("## Stage Details".to_string());
        self.stage_details(&mut lines);
        lines.push(String::new());
        lines.push("## Checkpoint Chain Analysis".to_string());
        self.chain_analysis(&mut lines);
        lines.push(String::new());
        lines.push("## Data Integrity Report".to_string());
        self.integrity(&mut lines);
        lines.push(String::new());
        lines.push("## Recommendations".to_string());
        self.recommendations(&mut lines);

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    fn overall_status(&self, lines: &mut Vec<String>) {
        lines.push(format!("- Total Checkpoints: {}", self.total_files));
        lines.push(format!("- Valid Checkpoints: {}", self.valid_files));
        lines.push(format!("- Invalid/Corrupted: {}", self.invalid.len()));
        lines.push(String::new());
        lines.push("### Stage Progress".to_string());

        for stage in &self.stages {
            let status = &stage.status;
            match status.status {
                StageState::NotStarted => {
                    lines.push(format!("- [ ] {}: not_started", status.stage.to_uppercase()))
                }
                StageState::InProgress => {
                    lines.push(format!("- [x] {}: in_progress", status.stage.to_uppercase()));
                    if let Some(ts) = status.last_updated {
                        lines.push(format!("  - Last Updated: {}", ts.to_rfc3339()));
                    }
                    lines.push(format!("  - Checkpoints: {}", status.checkpoint_count));
                }
            }
        }
    }

    fn stage_details(&self, lines: &mut Vec<String>) {
        for stage in &self.stages {
            let status = &stage.status;
            lines.push(format!("### {}", status.stage.to_uppercase()));
            lines.push(String::new());

            if status.status == StageState::NotStarted {
                lines.push("Stage not started.".to_string());
                lines.push(String::new());
                continue;
            }

            lines.push("#### Statistics".to_string());
            lines.push(format!("- Total Checkpoints: {}", status.checkpoint_count));
            lines.push(format!(
                "- Chain Complete: {}",
                if status.chain_complete { "Yes" } else { "No" }
            ));
            if let Some(ts) = status.last_updated {
                lines.push(format!("- Latest Update: {}", ts.to_rfc3339()));
            }
            if status.archived_links > 0 {
                lines.push(format!("- Archived Links: {}", status.archived_links));
            }
            lines.push(String::new());
            lines.push("#### Checkpoint History".to_string());

            for checkpoint in &stage.history {
                lines.push(format!("- Checkpoint {}:", checkpoint.id));
                lines.push(format!("  - Time: {}", checkpoint.timestamp.to_rfc3339()));
                if !checkpoint.metadata.is_empty() {
                    let metadata = serde_json::to_string(&checkpoint.metadata)
                        .unwrap_or_else(|_| "{}".to_string());
                    lines.push(format!("  - Metadata: {}", metadata));
                }
            }
            lines.push(String::new());
        }
    }

    fn chain_analysis(&self, lines: &mut Vec<String>) {
        for stage in &self.stages {
            if stage.history.is_empty() && stage.broken_links.is_empty() {
                continue;
            }
            lines.push(format!("### {} Chain", stage.status.stage.to_uppercase()));
            lines.push(format!("Chain Length: {}", stage.status.chain_length));
            lines.push(String::new());

            if stage.broken_links.is_empty() {
                lines.push("Chain integrity verified.".to_string());
            } else {
                lines.push("Chain integrity issues detected:".to_string());
                for link in &stage.broken_links {
                    lines.push(format!(
                        "- {:?} at position {} ({}): expected previous {}, found {}",
                        link.kind,
                        link.position,
                        link.checkpoint_id,
                        link.expected_previous.as_deref().unwrap_or("none"),
                        link.actual_previous.as_deref().unwrap_or("none"),
                    ));
                }
            }
            lines.push(String::new());
        }
    }

    fn integrity(&self, lines: &mut Vec<String>) {
        lines.push("### Checkpoint Verification Results".to_string());
        lines.push(format!("- Valid Checkpoints: {}", self.valid_files));
        lines.push(format!("- Invalid Checkpoints: {}", self.invalid.len()));

        if self.invalid.is_empty() {
            return;
        }
        lines.push(String::new());
        lines.push("### Invalid Checkpoints Detected".to_string());
        lines.push(String::new());
        for file in &self.invalid {
            let name = file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.path.display().to_string());
            lines.push(format!("- {}", name));
            lines.push(format!("  - Reason: {}", file.reason));
            match (&file.stage, &file.timestamp) {
                (None, None) => lines.push("  - Unable to read file".to_string()),
                (stage, timestamp) => {
                    lines.push(format!("  - Stage: {}", stage.as_deref().unwrap_or("unknown")));
                    lines.push(format!("  - Time: {}", timestamp.as_deref().unwrap_or("unknown")));
                }
            }
        }
    }

    fn recommendations(&self, lines: &mut Vec<String>) {
        let start = lines.len();

        let not_started: Vec<&str> = self
            .stages
            .iter()
            .filter(|s| s.status.status == StageState::NotStarted)
            .map(|s| s.status.stage.as_str())
            .collect();
        if !not_started.is_empty() {
            lines.push("### Stage Progression".to_string());
            lines.push(format!("- Complete {} stages", not_started.join(", ")));
            lines.push(String::new());
        }

        for stage in &self.stages {
            if stage.status.chain_length > PRUNE_RECOMMENDATION_THRESHOLD {
                lines.push(format!("### {} Checkpoints", stage.status.stage.to_uppercase()));
                lines.push("- Consider pruning old checkpoints to maintain performance".to_string());
                lines.push(format!("- Current count: {}", stage.status.chain_length));
                lines.push(String::new());
            }
        }

        let broken: Vec<&str> = self
            .stages
            .iter()
            .filter(|s| !s.status.chain_complete)
            .map(|s| s.status.stage.as_str())
            .collect();
        if !broken.is_empty() {
            lines.push("### Chain Repair".to_string());
            lines.push(format!(
                "- Investigate broken chains for {}; consider rolling back to the last verified checkpoint",
                broken.join(", ")
            ));
            lines.push(String::new());
        }

        if !self.invalid.is_empty() {
            lines.push("### Data Integrity".to_string());
            lines.push(format!(
                "- Repair or restore {} invalid checkpoint file(s) from backups",
                self.invalid.len()
            ));
            lines.push(String::new());
        }

        if lines.len() == start {
            lines.push("No action needed.".to_string());
        }
    }
}
