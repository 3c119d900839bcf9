//! Tally Agent - scheduled penalty worker and one-shot sync.
//!
//! `tally-agent penalty [--force]` is meant to run from cron once a day;
//! `tally-agent sync` pushes and pulls the file-backed replica once.

use clap::Parser;
use tally_agent::cli::{Cli, Command};
use tally_agent::config;
use tally_agent::time::{local_today, now_timestamp};
use tally_agent::{
    Config, FilePersistence, FixedDecider, HttpRemote, PenaltyWorker, SyncCoordinator,
};
use tally_engine::{LocalReplica, PenaltyPlanner, PenaltyRules, PenaltyRun};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env first so RUST_LOG from it reaches the filter
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(config::log_filter("tally_agent=info"))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let remote = HttpRemote::new(
        config.remote_url.clone(),
        config.remote_root.clone(),
        config.remote_auth.clone(),
    );

    match cli.command {
        Command::Penalty { force } => {
            let planner = PenaltyPlanner::new(PenaltyRules::default(), config.users.clone());
            let worker = PenaltyWorker::new(remote, planner, config.remote_timeout);

            let mut run = PenaltyRun::new(local_today(config.utc_offset), now_timestamp());
            run.force = force;

            let report = worker.run(&run).await?;
            tracing::info!(
                deducted = report.total_deducted(),
                penalties = report.applied.len(),
                "Penalty check finished"
            );
        }
        Command::Sync { state } => {
            let path = state.unwrap_or_else(|| config.state_path.clone());
            tracing::info!(path = %path.display(), "Opening local replica");

            let replica = LocalReplica::open(FilePersistence::new(path), config.users.clone())?;
            let coordinator = SyncCoordinator::new(
                replica,
                remote,
                FixedDecider(config.conflict_policy),
                config.sync_config(),
            );
            coordinator.sync_now().await?;
        }
    }

    Ok(())
}
