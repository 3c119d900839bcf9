//! Client-side synchronization.
//!
//! [`SyncCoordinator`] owns the push/pull cycle of one local replica.
//! Conflicting point totals are settled by a [`ConflictDecider`].

mod coordinator;
mod decider;

pub use coordinator::{RemoteUpdate, SharedReplica, SyncCoordinator};
pub use decider::{ChannelDecider, ConflictDecider, ConflictRequest, FixedDecider};

use std::time::Duration;
use tally_engine::{MergeStrategy, UserId};

/// Coordinator state, published on a watch channel.
///
/// The result of the last attempt stays visible until the next one starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No attempt has run yet
    Idle,
    Syncing,
    /// Waiting for a conflict decision
    ConflictPending,
    /// Last attempt succeeded
    Merged,
    /// Last attempt failed
    Failed,
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after a local change before syncing
    pub debounce: Duration,
    pub remote_timeout: Duration,
    /// Periodic sync interval, `None` to disable
    pub auto_sync: Option<Duration>,
    pub strategy: MergeStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            remote_timeout: Duration::from_secs(10),
            auto_sync: Some(Duration::from_secs(30)),
            strategy: MergeStrategy::default(),
        }
    }
}

/// How a successful attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The remote was empty and got the local copy
    FirstPush,
    /// Nothing changed on either side
    UpToDate,
    /// Only the remote changed; the local copy was replaced
    Pulled,
    /// Only the local copy changed; it was pushed as is
    FastForward,
    /// Both changed and were merged
    Merged {
        /// Users whose totals came from a later remote penalty
        penalty_precedence: Vec<UserId>,
        /// Local edits landed during the attempt and wait for the next one
        local_deferred: bool,
    },
    /// Conflict resolved by pushing the local copy
    KeptLocal,
    /// Conflict resolved by taking the remote copy
    KeptRemote,
}
