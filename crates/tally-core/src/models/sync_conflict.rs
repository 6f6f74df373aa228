//! Sync conflict journal model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RecordKind;

/// Recorded sync conflict resolved by strategy (e.g., remote-wins)
///
/// For conflicts journaled under the `manual` resolution mode both
/// versions are kept as serialized JSON so a later resolution path can
/// present them to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Kind of the record involved in the conflict
    pub record_kind: RecordKind,
    /// Record involved in the conflict
    pub record_id: String,
    /// Existing record's timestamp when the conflict occurred
    pub local_updated_at: DateTime<Utc>,
    /// Incoming record's timestamp
    pub remote_updated_at: DateTime<Utc>,
    /// Resolution timestamp
    pub resolved_at: DateTime<Utc>,
    /// Resolution strategy name
    pub strategy: String,
    /// Serialized local version (kept for manual conflicts)
    pub local_version: Option<String>,
    /// Serialized remote version (kept for manual conflicts)
    pub remote_version: Option<String>,
}
