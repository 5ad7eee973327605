//! Command execution
//!
//! Every command writes its output to the supplied writer and returns whether
//! the store is healthy for that command; `main` turns `false` into exit code 1.

use anyhow::{bail, Context, Result};
use checkpoint_store::{
    Checkpoint, CheckpointMetadata, CheckpointQuery, CheckpointStore, StageState, StoreConfig,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

use crate::cli::{Cli, Commands, OutputFormat};

/// Build the store configuration: file, then environment, then `--dir`
pub fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(dir) = &cli.dir {
        config.base_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

pub fn execute(cli: &Cli, out: &mut dyn Write) -> Result<bool> {
    let config = load_config(cli)?;
    debug!(base_dir = %config.base_dir.display(), "Opening store");
    let mut store = CheckpointStore::open(config)?;
    if let Some(diagnostic) = store.registry_diagnostic() {
        warn!(
            path = %diagnostic.path.display(),
            reason = %diagnostic.reason,
            "Registry unreadable, store opened empty"
        );
    }

    let format = cli.format;
    match &cli.command {
        Commands::Save {
            stage,
            data,
            file,
            meta,
        } => {
            let payload = read_payload(data.as_deref(), file.as_deref())?;
            let metadata = parse_metadata(meta)?;
            let checkpoint = store.save(stage, payload, metadata)?;
            match format {
                OutputFormat::Json => print_json(out, &checkpoint)?,
                OutputFormat::Text => writeln!(
                    out,
                    "Saved {} for stage '{}' (previous: {})",
                    checkpoint.id,
                    checkpoint.stage,
                    checkpoint.previous_checkpoint.as_deref().unwrap_or("none")
                )?,
            }
            Ok(true)
        }

        Commands::Load {
            stage,
            id,
            data_only,
        } => {
            let query = match (id, stage) {
                (Some(id), _) => CheckpointQuery::by_id(id.clone()),
                (None, Some(stage)) => CheckpointQuery::latest(stage.clone()),
                (None, None) => bail!("either a stage or --id is required"),
            };
            let checkpoint = store.load(&query)?;
            if *data_only {
                writeln!(out, "{}", serde_json::to_string_pretty(&checkpoint.data)?)?;
            } else {
                match format {
                    OutputFormat::Json => print_json(out, &checkpoint)?,
                    OutputFormat::Text => print_checkpoint(out, &checkpoint)?,
                }
            }
            Ok(true)
        }

        Commands::Chain { stage } => {
            let chain = store.build_chain(stage)?;
            let complete = chain.is_complete();
            match format {
                OutputFormat::Json => {
                    #[derive(Serialize)]
                    struct ChainView<'a> {
                        stage: &'a str,
                        complete: bool,
                        checkpoints: &'a [Checkpoint],
                        unresolved: Option<&'a str>,
                        archived_links: usize,
                        broken_links: Vec<checkpoint_store::BrokenLink>,
                    }
                    print_json(
                        out,
                        &ChainView {
                            stage,
                            complete,
                            checkpoints: &chain.checkpoints,
                            unresolved: chain.unresolved.as_deref(),
                            archived_links: chain.archived_links,
                            broken_links: chain.broken_links(),
                        },
                    )?;
                }
                OutputFormat::Text => {
                    writeln!(out, "Chain for '{}': {} checkpoint(s)", stage, chain.len())?;
                    for (i, checkpoint) in chain.checkpoints.iter().enumerate() {
                        writeln!(
                            out,
                            "{:>3}. {}  {}",
                            i + 1,
                            checkpoint.id,
                            checkpoint.timestamp.to_rfc3339()
                        )?;
                    }
                    if let Some(unresolved) = &chain.unresolved {
                        writeln!(out, "unresolved link: {}", unresolved)?;
                    }
                    writeln!(out, "complete: {}", if complete { "yes" } else { "no" })?;
                }
            }
            Ok(complete)
        }

        Commands::Status { stages } => {
            let stages = stage_selection(&store, stages);
            let mut statuses = Vec::with_capacity(stages.len());
            for stage in &stages {
                statuses.push(store.stage_status(stage)?);
            }
            let healthy = statuses.iter().all(|s| s.chain_complete);
            match format {
                OutputFormat::Json => print_json(out, &statuses)?,
                OutputFormat::Text => {
                    writeln!(
                        out,
                        "{:<16} {:<12} {:>6} {:<9} {}",
                        "Stage", "Status", "Count", "Complete", "Last Updated"
                    )?;
                    writeln!(out, "{}", "-".repeat(72))?;
                    for status in &statuses {
                        let state = match status.status {
                            StageState::NotStarted => "not_started",
                            StageState::InProgress => "in_progress",
                        };
                        writeln!(
                            out,
                            "{:<16} {:<12} {:>6} {:<9} {}",
                            status.stage,
                            state,
                            status.checkpoint_count,
                            if status.chain_complete { "yes" } else { "no" },
                            status
                                .last_updated
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "-".to_string())
                        )?;
                    }
                }
            }
            Ok(healthy)
        }

        Commands::Verify => {
            let report = store.verify_all()?;
            match format {
                OutputFormat::Json => print_json(out, &report)?,
                OutputFormat::Text => {
                    writeln!(
                        out,
                        "{} file(s): {} valid, {} invalid",
                        report.total(),
                        report.valid.len(),
                        report.invalid.len()
                    )?;
                    for file in &report.invalid {
                        writeln!(out, "  invalid {}: {}", file.path.display(), file.reason)?;
                    }
                }
            }
            Ok(report.is_clean())
        }

        Commands::Rollback { id } => {
            let rolled_back = store.rollback_to(id)?;
            match format {
                OutputFormat::Json => print_json(
                    out,
                    &serde_json::json!({ "rolled_back": rolled_back, "checkpoint_id": id }),
                )?,
                OutputFormat::Text if rolled_back => writeln!(out, "Rolled back to {}", id)?,
                OutputFormat::Text => writeln!(
                    out,
                    "Rollback refused: {} is not registered or fails verification",
                    id
                )?,
            }
            Ok(rolled_back)
        }

        Commands::Prune { max } => {
            let report = match max {
                Some(max) => store.prune(*max)?,
                None => store.prune_with_policy()?,
            };
            match format {
                OutputFormat::Json => print_json(out, &report)?,
                OutputFormat::Text => {
                    writeln!(out, "Archived {} checkpoint(s)", report.archived.len())?;
                    for archived in &report.archived {
                        writeln!(
                            out,
                            "  {} {} -> {}",
                            archived.stage,
                            archived.checkpoint_id,
                            archived.archive_path.display()
                        )?;
                    }
                    for skipped in &report.skipped {
                        writeln!(
                            out,
                            "  skipped {} {}: {}",
                            skipped.stage, skipped.checkpoint_id, skipped.reason
                        )?;
                    }
                }
            }
            Ok(report.skipped.is_empty())
        }

        Commands::Backups { stage } => {
            let files = store.list_backups(stage.as_deref())?;
            match format {
                OutputFormat::Json => print_json(out, &files)?,
                OutputFormat::Text => {
                    for file in &files {
                        writeln!(
                            out,
                            "{:<8} {:<16} {}  {}",
                            file.kind.prefix().trim_end_matches('_'),
                            file.stage,
                            file.original_name,
                            file.modified.to_rfc3339()
                        )?;
                    }
                    if files.is_empty() {
                        writeln!(out, "No backups")?;
                    }
                }
            }
            Ok(true)
        }

        Commands::Restore { stage } => match store.restore_latest_backup(stage)? {
            Some(path) => {
                writeln!(out, "Restored {}", path.display())?;
                Ok(true)
            }
            None => {
                writeln!(out, "No backup available for stage '{}'", stage)?;
                Ok(false)
            }
        },

        Commands::Report { out: dir, stages } => {
            let stages: Vec<String> = stage_selection(&store, stages).into_iter().collect();
            let report = store.report(stages.as_slice())?;
            match dir {
                Some(dir) => {
                    let path = report.write_to(dir)?;
                    writeln!(out, "Report written to {}", path.display())?;
                }
                None => write!(out, "{}", report.render_markdown())?,
            }
            Ok(report.invalid.is_empty())
        }
    }
}

/// Requested stages, or every configured and registered stage
fn stage_selection(store: &CheckpointStore, requested: &[String]) -> BTreeSet<String> {
    if !requested.is_empty() {
        return requested.iter().cloned().collect();
    }
    let mut stages: BTreeSet<String> = store.config().stages.iter().cloned().collect();
    stages.extend(store.stages());
    stages
}

fn read_payload(data: Option<&str>, file: Option<&Path>) -> Result<serde_json::Value> {
    match (data, file) {
        (Some(data), _) => serde_json::from_str(data).context("--data is not valid JSON"),
        (None, Some(path)) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("{} is not valid JSON", path.display()))
        }
        (None, None) => bail!("a payload is required: use --data or --file"),
    }
}

fn parse_metadata(entries: &[String]) -> Result<Option<CheckpointMetadata>> {
    if entries.is_empty() {
        return Ok(None);
    }
    let mut metadata = CheckpointMetadata::new();
    for entry in entries {
        let Some((key, raw)) = entry.split_once('=') else {
            bail!("metadata must be key=value, got '{}'", entry);
        };
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        metadata.insert(key.trim(), value);
    }
    Ok(Some(metadata))
}

fn print_json<T: Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn print_checkpoint(out: &mut dyn Write, checkpoint: &Checkpoint) -> Result<()> {
    writeln!(out, "id:        {}", checkpoint.id)?;
    writeln!(out, "stage:     {}", checkpoint.stage)?;
    writeln!(out, "timestamp: {}", checkpoint.timestamp.to_rfc3339())?;
    writeln!(
        out,
        "previous:  {}",
        checkpoint.previous_checkpoint.as_deref().unwrap_or("none")
    )?;
    writeln!(out, "checksum:  {}", checkpoint.checksum)?;
    if !checkpoint.metadata.is_empty() {
        writeln!(out, "metadata:  {}", serde_json::to_string(&checkpoint.metadata)?)?;
    }
    writeln!(out, "data:")?;
    writeln!(out, "{}", serde_json::to_string_pretty(&checkpoint.data)?)?;
    Ok(())
}
