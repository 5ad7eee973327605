//! Command-line definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "checkpoint")]
#[command(about = "Inspect and maintain pipeline checkpoints", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Store base directory (overrides config file and CHECKPOINT_STORE_DIR)
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    /// Config file (.toml, .json, .yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Save a checkpoint for a stage
    Save {
        /// Stage name
        stage: String,

        /// Payload as inline JSON
        #[arg(long, conflicts_with = "file")]
        data: Option<String>,

        /// Read the payload from a JSON file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Metadata entry as key=value (value parsed as JSON when possible)
        #[arg(short, long = "meta")]
        meta: Vec<String>,
    },

    /// Load the latest checkpoint of a stage, or one by id
    Load {
        /// Stage name
        #[arg(required_unless_present = "id")]
        stage: Option<String>,

        /// Checkpoint id
        #[arg(long)]
        id: Option<String>,

        /// Print only the payload
        #[arg(long)]
        data_only: bool,
    },

    /// Show the checkpoint chain of a stage
    Chain {
        /// Stage name
        stage: String,
    },

    /// Show stage status (defaults to configured and registered stages)
    Status {
        /// Stage names
        stages: Vec<String>,
    },

    /// Verify every checkpoint file
    Verify,

    /// Make an earlier checkpoint the latest of its stage
    Rollback {
        /// Checkpoint id
        id: String,
    },

    /// Archive old checkpoints beyond the retention limit
    Prune {
        /// Checkpoints to keep per stage (defaults to retention.max_per_stage)
        #[arg(short, long)]
        max: Option<usize>,
    },

    /// List files in the backup area
    Backups {
        /// Only this stage
        stage: Option<String>,
    },

    /// Restore the most recent backup of a stage
    Restore {
        /// Stage name
        stage: String,
    },

    /// Generate a markdown status report
    Report {
        /// Directory to write the report to (prints to stdout when omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Stage names (defaults to configured and registered stages)
        stages: Vec<String>,
    },
}
