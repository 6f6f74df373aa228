//! Remote document store client.
//!
//! All network I/O lives behind the [`RemoteStore`] trait so the sync
//! engine can be exercised against fakes. [`CouchClient`] is the HTTP
//! implementation speaking standard document-store REST semantics
//! (`_bulk_docs`, `_changes`, revision-based optimistic concurrency).

mod client;
mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use client::CouchClient;
pub use types::{
    BulkOutcome, BulkWriteResult, ChangesPage, ConnectionStatus, DatabaseInfo, RemoteChange,
    RemoteDocument, ServerInfo,
};

/// Errors raised by the remote document store
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection-level failure (DNS, refused, reset, TLS)
    #[error("Network error: {0}")]
    Network(String),

    /// The per-request timeout elapsed
    #[error("Request timed out")]
    Timeout,

    /// Non-2xx response other than not-found and revision conflicts
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// A write carried a stale revision token
    #[error("Document revision conflict")]
    Conflict,

    /// The response body could not be decoded
    #[error("Invalid response payload: {0}")]
    InvalidPayload(String),
}

impl RemoteError {
    /// Whether the failure is worth retrying with backoff
    ///
    /// Network errors, timeouts, and 5xx responses are transient; 4xx
    /// responses and revision conflicts are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Conflict | Self::InvalidPayload(_) => false,
        }
    }
}

/// Operations the sync engine requires from the remote document store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Health check; reports failure as data, never as an error
    async fn validate_connection(&self) -> ConnectionStatus;

    /// Whether the configured database exists
    async fn database_exists(&self) -> Result<bool, RemoteError>;

    /// Create the configured database; "already exists" counts as success
    async fn create_database(&self) -> Result<bool, RemoteError>;

    /// Fetch a document by id; `None` on not-found
    async fn get_document(&self, document_id: &str)
        -> Result<Option<RemoteDocument>, RemoteError>;

    /// Write a single document, returning the new revision token
    async fn put_document(&self, document: &RemoteDocument) -> Result<String, RemoteError>;

    /// Write a batch of documents; partial success is reported per document
    async fn bulk_write(
        &self,
        documents: &[RemoteDocument],
    ) -> Result<Vec<BulkWriteResult>, RemoteError>;

    /// Poll the change feed from the given cursor (`None` = from the
    /// beginning)
    async fn changes_since(
        &self,
        since: Option<&str>,
        limit: usize,
    ) -> Result<ChangesPage, RemoteError>;

    /// Database metadata (document count, current sequence)
    async fn database_info(&self) -> Result<DatabaseInfo, RemoteError>;
}
