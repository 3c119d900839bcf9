//! Command line interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(after_help = concat!(
    "Environment variables:\n",
    "  TALLY_REMOTE_URL    Base URL of the realtime database\n",
    "  RUST_LOG            Log filter (default tally_agent=info)\n\n",
    "Examples:",
    r"
  # Daily run from cron
  $ tally-agent penalty

  # Sync a replica kept somewhere else
  $ tally-agent sync --state /var/lib/tally/state.json
"
))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Apply due penalties to the remote document
    Penalty {
        /// Re-check users already settled today and periodic keys already applied
        #[arg(short, long)]
        force: bool,
    },
    /// Sync the local replica once
    Sync {
        /// File backing the replica, overrides TALLY_STATE_PATH
        #[arg(long, value_name = "PATH")]
        state: Option<PathBuf>,
    },
}
