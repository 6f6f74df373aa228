//! Local record store abstraction.
//!
//! The sync engine only depends on the [`LocalStore`] contract: a
//! changed-since query with strict `>` semantics, lookup by key, and an
//! overwrite-or-insert primitive. The conflict journal lives here too so
//! resolutions survive restarts alongside the records they concern.

mod memory;
mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{RecordKind, SyncConflict, SyncRecord};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Contract the sync engine requires from the on-device store
///
/// No transactional guarantees are assumed beyond single-record atomicity.
pub trait LocalStore {
    /// Records of the given kind with `updated_at` strictly greater than
    /// `since`, ordered oldest first
    fn changed_since(&self, kind: RecordKind, since: DateTime<Utc>) -> Result<Vec<SyncRecord>>;

    /// Look up a record by kind and id
    fn get(&self, kind: RecordKind, id: &str) -> Result<Option<SyncRecord>>;

    /// Overwrite-or-insert, keyed by the record's id
    fn upsert(&self, record: &SyncRecord) -> Result<()>;

    /// Append an entry to the conflict journal (the entry's `id` field is
    /// assigned by the store)
    fn record_conflict(&self, conflict: &SyncConflict) -> Result<()>;

    /// Most recently resolved conflicts, newest first
    fn recent_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}