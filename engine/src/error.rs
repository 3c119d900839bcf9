//! Error types for the Tally engine.

use thiserror::Error;

/// All possible errors from the Tally engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Path errors
    #[error("invalid path: {0}")]
    InvalidPath(String),

    // Document errors
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid import: {0}")]
    InvalidImport(String),

    // Durable storage errors
    #[error("local persistence failed: {0}")]
    Persistence(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
