//! Error types for tally-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using tally-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tally-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote document store error
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A sync cycle is already in flight
    #[error("Sync already running")]
    SyncAlreadyRunning,

    /// The engine has not been initialized against a reachable remote store
    #[error("Sync engine not initialized; call initialize() once the remote store is reachable")]
    SyncNotReady,
}
