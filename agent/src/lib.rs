//! Tally Agent - IO side of the Tally engine.
//!
//! Talks to the remote store, keeps the local replica on disk, drives the
//! client sync cycle and runs the scheduled penalty worker.

pub mod cli;
pub mod config;
pub mod error;
pub mod local;
pub mod remote;
pub mod sync;
pub mod time;
pub mod worker;

pub use config::{Config, ConfigError};
pub use error::{SyncError, WorkerError};
pub use local::FilePersistence;
pub use remote::{FailureMode, HttpRemote, MemoryRemote, RemoteError, RemoteStore};
pub use sync::{
    ChannelDecider, ConflictDecider, FixedDecider, SyncConfig, SyncCoordinator, SyncOutcome,
    SyncState,
};
pub use worker::{PenaltyWorker, RunReport};
