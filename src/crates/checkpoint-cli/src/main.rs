//! # checkpoint
//!
//! Command-line front end for a checkpoint store: save and load stage
//! checkpoints, inspect chains, audit files, roll back, prune and report.
//!
//! Exit status is 1 when a command finds the store unhealthy (an incomplete
//! chain, invalid files, a refused rollback or skipped prune candidates).

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let healthy = commands::execute(&cli, &mut out)?;
    if !healthy {
        std::process::exit(1);
    }
    Ok(())
}
