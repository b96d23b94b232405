//! Command-line interface of the spawnkit agent binary.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use crate::setupper::{self, SetupperMode};

#[derive(Parser)]
#[command(name = "spawnkit-agent", version, about = "Application spawning agent")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the spawn environment inside a forked subprocess, then
    /// exec the next stage. Not meant to be invoked by hand.
    #[command(name = "spawn-env-setupper")]
    SpawnEnvSetupper {
        /// The spawn work directory.
        work_dir: PathBuf,
        /// Run the pre-shell stage (user switching, ulimits, cwd).
        #[arg(long)]
        before: bool,
        /// Run the post-shell stage (app environment, final exec).
        #[arg(long)]
        after: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::SpawnEnvSetupper {
            work_dir,
            before,
            after,
        } => {
            let mode = match (before, after) {
                (true, false) => SetupperMode::Before,
                (false, true) => SetupperMode::After,
                _ => bail!("specify exactly one of --before or --after"),
            };
            std::process::exit(setupper::run(&work_dir, mode));
        }
    }
}
