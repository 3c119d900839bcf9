//! Remote store access.
//!
//! The shared document lives in a realtime database. The agent only needs
//! three operations: read the whole document, overwrite it, and write a set
//! of sub-paths in one atomic update.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::{FailureMode, MemoryRemote};

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tally_engine::{Document, PathPatch};

/// Errors from a remote store.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The shared remote copy of the document.
pub trait RemoteStore: Send + Sync + 'static {
    /// Read the whole document; `None` when nothing is stored.
    fn read_document(&self) -> impl Future<Output = Result<Option<Value>, RemoteError>> + Send;

    /// Overwrite the whole document.
    fn write_document(
        &self,
        document: &Document,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Write several sub-paths in one atomic update.
    ///
    /// Paths are `/`-separated and relative to the document root. A `null`
    /// value deletes the path.
    fn write_paths(&self, patch: &PathPatch)
        -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// Run a remote operation with a deadline.
pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| RemoteError::Timeout(limit))?
}
