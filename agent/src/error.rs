//! Unified error handling for the agent.

use crate::remote::RemoteError;
use std::time::Duration;

/// Failure of a sync attempt.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Remote store timed out after {0:?}")]
    TransportTimeout(Duration),

    #[error("Remote store unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Malformed remote data: {0}")]
    MalformedRemoteData(String),

    #[error("Conflict left unresolved")]
    ConflictUnresolved,

    #[error("Local persistence failed: {0}")]
    LocalPersistenceFailure(#[from] tally_engine::Error),

    #[error("Another sync attempt is in progress")]
    InProgress,

    #[error("Remote document does not exist")]
    RemoteAbsent,
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Timeout(after) => SyncError::TransportTimeout(after),
            RemoteError::Unavailable(msg) => SyncError::TransportUnavailable(msg),
            RemoteError::Status { status, body } => {
                SyncError::TransportUnavailable(format!("status {status}: {body}"))
            }
            RemoteError::Decode(msg) => SyncError::MalformedRemoteData(msg),
            RemoteError::Encode(e) => SyncError::MalformedRemoteData(e.to_string()),
        }
    }
}

/// Failure of a penalty worker run.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Malformed remote document: {0}")]
    MalformedDocument(#[from] tally_engine::Error),
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
