//! The scheduled penalty worker.
//!
//! One run reads the shared document once, plans the penalties and writes
//! the changed sub-paths in a single multi-path update. Nothing is written
//! before that update, so a failed run leaves the remote untouched.

use crate::error::WorkerError;
use crate::remote::{with_timeout, RemoteStore};
use std::collections::BTreeMap;
use std::time::Duration;
use tally_engine::{
    AppliedPenalty, DailyOutcome, Document, PenaltyKind, PenaltyPlanner, PenaltyRun, UserId,
};
use uuid::Uuid;

/// Summary of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub daily: BTreeMap<UserId, DailyOutcome>,
    pub applied: Vec<AppliedPenalty>,
    /// Number of sub-paths written, zero when nothing changed
    pub written_paths: usize,
}

impl RunReport {
    pub fn total_deducted(&self) -> u64 {
        self.applied.iter().map(|p| p.points).sum()
    }
}

/// Applies daily and periodic penalties to the remote document.
#[derive(Debug)]
pub struct PenaltyWorker<R> {
    remote: R,
    planner: PenaltyPlanner,
    timeout: Duration,
}

impl<R: RemoteStore> PenaltyWorker<R> {
    pub fn new(remote: R, planner: PenaltyPlanner, timeout: Duration) -> Self {
        Self {
            remote,
            planner,
            timeout,
        }
    }

    /// Run one penalty check.
    pub async fn run(&self, run: &PenaltyRun) -> Result<RunReport, WorkerError> {
        tracing::info!(today = %run.today, force = run.force, "Starting penalty check");

        let document = match with_timeout(self.timeout, self.remote.read_document()).await? {
            Some(value) => Document::from_value(value)?,
            None => {
                tracing::info!("Remote document absent, starting from defaults");
                Document::with_users(self.planner.users())
            }
        };

        let plan = self.planner.plan(&document, run, &mut |prefix| {
            format!("{prefix}_{}", Uuid::new_v4())
        })?;

        for (user, outcome) in &plan.daily {
            match outcome {
                DailyOutcome::AlreadySettled => {
                    tracing::info!(user = %user, "Already settled today, skipping")
                }
                DailyOutcome::Safe => tracing::info!(user = %user, "Daily target met, streak reset"),
                DailyOutcome::Penalized { points, streak } => {
                    tracing::info!(user = %user, points, streak, "Daily target missed")
                }
            }
        }
        for penalty in &plan.applied {
            if let PenaltyKind::Periodic { scope, task, key } = &penalty.kind {
                tracing::info!(
                    user = %penalty.user,
                    points = penalty.points,
                    %scope,
                    task = %task,
                    key = %key,
                    "Periodic task missed"
                );
            }
        }

        if plan.is_empty() {
            tracing::info!("Nothing to update");
        } else {
            with_timeout(self.timeout, self.remote.write_paths(&plan.patch)).await?;
            tracing::info!(
                paths = plan.patch.len(),
                deducted = plan.total_deducted(),
                "Remote document updated"
            );
        }

        Ok(RunReport {
            written_paths: plan.patch.len(),
            daily: plan.daily,
            applied: plan.applied,
        })
    }
}
