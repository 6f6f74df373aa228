//! Wire types for the remote document store REST contract

use serde::{Deserialize, Serialize};

use crate::models::SyncRecord;

/// A document as stored remotely
///
/// The document id is derived deterministically from the record
/// (`<kind>:<id>`) so local and remote identities map both ways. The
/// revision token is opaque and supplied by the store; updates without
/// the current token are rejected as conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    #[serde(rename = "_id")]
    pub document_id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(flatten)]
    pub record: SyncRecord,
}

impl RemoteDocument {
    /// Wrap a record for upload (no revision yet)
    #[must_use]
    pub fn from_record(record: SyncRecord) -> Self {
        Self {
            document_id: record.document_id(),
            revision: None,
            record,
        }
    }

    /// Attach a revision token for an update of an existing document
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// Result of a connection health check; never an error
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub server_info: Option<ServerInfo>,
    pub error: Option<String>,
}

/// Server greeting payload
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub couchdb: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Per-document outcome of a bulk write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub document_id: String,
    pub outcome: BulkOutcome,
}

/// Outcome variants for one document within a bulk write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOutcome {
    /// Stored; carries the new revision token
    Accepted { revision: String },
    /// Rejected with a stale revision token
    Conflict,
    /// Rejected for another reason
    Rejected { reason: String },
}

/// One entry from the change feed
#[derive(Debug, Clone)]
pub struct RemoteChange {
    /// Sequence at which the change occurred
    pub seq: String,
    pub document_id: String,
    pub deleted: bool,
    /// Decoded document; `None` for deletions and unrecognized payloads
    pub document: Option<RemoteDocument>,
}

/// One page of the change feed
#[derive(Debug, Clone, Default)]
pub struct ChangesPage {
    pub changes: Vec<RemoteChange>,
    /// Cursor for the next poll
    pub last_seq: String,
}

/// Database metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub doc_count: u64,
    pub update_seq: String,
}

// ---------------------------------------------------------------------------
// Raw response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct BulkDocsRequest<'a> {
    pub docs: &'a [RemoteDocument],
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkDocsRow {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl From<BulkDocsRow> for BulkWriteResult {
    fn from(row: BulkDocsRow) -> Self {
        let outcome = match (row.error.as_deref(), row.rev) {
            (Some("conflict"), _) => BulkOutcome::Conflict,
            (Some(error), _) => BulkOutcome::Rejected {
                reason: row
                    .reason
                    .unwrap_or_else(|| error.to_string()),
            },
            (None, Some(revision)) => BulkOutcome::Accepted { revision },
            (None, None) => BulkOutcome::Rejected {
                reason: "response carried neither revision nor error".to_string(),
            },
        };
        Self {
            document_id: row.id,
            outcome,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutDocumentResponse {
    pub rev: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChangesResponse {
    pub results: Vec<ChangesRow>,
    pub last_seq: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChangesRow {
    pub seq: serde_json::Value,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<serde_json::Value>,
}

impl From<ChangesRow> for RemoteChange {
    fn from(row: ChangesRow) -> Self {
        let document = row.doc.and_then(|value| {
            match serde_json::from_value::<RemoteDocument>(value) {
                Ok(document) => Some(document),
                Err(error) => {
                    tracing::debug!(
                        document_id = %row.id,
                        "skipping change with undecodable payload: {error}"
                    );
                    None
                }
            }
        });
        Self {
            seq: seq_to_string(&row.seq),
            document_id: row.id,
            deleted: row.deleted,
            document,
        }
    }
}

impl From<ChangesResponse> for ChangesPage {
    fn from(response: ChangesResponse) -> Self {
        Self {
            last_seq: seq_to_string(&response.last_seq),
            changes: response.results.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DatabaseInfoResponse {
    pub doc_count: u64,
    pub update_seq: serde_json::Value,
}

impl From<DatabaseInfoResponse> for DatabaseInfo {
    fn from(response: DatabaseInfoResponse) -> Self {
        Self {
            doc_count: response.doc_count,
            update_seq: seq_to_string(&response.update_seq),
        }
    }
}

/// Change-feed sequences arrive as JSON numbers or strings depending on
/// the server; normalize to an opaque string cursor.
fn seq_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
