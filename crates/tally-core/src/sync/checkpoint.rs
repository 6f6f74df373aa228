//! Sync checkpoints and the durable metadata store.
//!
//! Checkpoints and the last known status are persisted as small JSON
//! blobs under well-known file names, independent of the record store's
//! schema, so they survive restarts and schema migrations. They are
//! written immediately after each phase advances; a crash mid-cycle can
//! only cause re-processing of already-applied changes, never loss.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::status::SyncStatus;

const CHECKPOINT_FILE: &str = "sync-checkpoint.json";
const STATUS_FILE: &str = "sync-status.json";

/// Durable watermarks for the upload and download phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Local records with `updated_at` strictly greater than this are
    /// considered not yet uploaded
    pub last_upload_at: DateTime<Utc>,
    /// Opaque change-feed cursor observed after the last upload
    #[serde(default)]
    pub last_upload_seq: Option<String>,
    /// Opaque change-feed cursor for the download phase; `None` means
    /// "from the beginning"
    #[serde(default)]
    pub last_download_seq: Option<String>,
    /// Informational only
    #[serde(default)]
    pub last_download_at: Option<DateTime<Utc>>,
}

impl Default for SyncCheckpoint {
    fn default() -> Self {
        Self {
            last_upload_at: DateTime::UNIX_EPOCH,
            last_upload_seq: None,
            last_download_seq: None,
            last_download_at: None,
        }
    }
}

/// Durable key-value persistence for sync metadata
pub trait MetadataStore {
    /// Load the persisted checkpoint, if any
    fn load_checkpoint(&self) -> Result<Option<SyncCheckpoint>>;

    /// Persist the checkpoint immediately (no batching)
    fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()>;

    /// Load the last mirrored status, if any
    fn load_status(&self) -> Result<Option<SyncStatus>>;

    /// Mirror the status for restart recovery
    fn save_status(&self, status: &SyncStatus) -> Result<()>;
}

/// File-backed [`MetadataStore`] storing JSON blobs in a data directory
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    /// Create a store rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load_json<T: for<'de> Deserialize<'de>>(&self, file_name: &str) -> Result<Option<T>> {
        let path = self.dir.join(file_name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let serialized = serde_json::to_string_pretty(value)?;
        std::fs::write(self.dir.join(file_name), serialized)?;
        Ok(())
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Path of the checkpoint blob (for diagnostics)
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.path(CHECKPOINT_FILE)
    }
}

impl MetadataStore for FileMetadataStore {
    fn load_checkpoint(&self) -> Result<Option<SyncCheckpoint>> {
        self.load_json(CHECKPOINT_FILE)
    }

    fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.save_json(CHECKPOINT_FILE, checkpoint)
    }

    fn load_status(&self) -> Result<Option<SyncStatus>> {
        self.load_json(STATUS_FILE)
    }

    fn save_status(&self, status: &SyncStatus) -> Result<()> {
        self.save_json(STATUS_FILE, status)
    }
}

/// In-memory [`MetadataStore`] used by tests
#[derive(Default)]
pub struct MemoryMetadataStore {
    checkpoint: Mutex<Option<SyncCheckpoint>>,
    status: Mutex<Option<SyncStatus>>,
}

impl MemoryMetadataStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load_checkpoint(&self) -> Result<Option<SyncCheckpoint>> {
        Ok(lock_contents(&self.checkpoint).clone())
    }

    fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        *lock_contents(&self.checkpoint) = Some(checkpoint.clone());
        Ok(())
    }

    fn load_status(&self) -> Result<Option<SyncStatus>> {
        Ok(lock_contents(&self.status).clone())
    }

    fn save_status(&self, status: &SyncStatus) -> Result<()> {
        *lock_contents(&self.status) = Some(status.clone());
        Ok(())
    }
}

fn lock_contents<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_default_checkpoint_starts_at_epoch() {
        let checkpoint = SyncCheckpoint::default();
        assert_eq!(checkpoint.last_upload_at, DateTime::UNIX_EPOCH);
        assert!(checkpoint.last_download_seq.is_none());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let tmp = tempdir().unwrap();
        let store = FileMetadataStore::new(tmp.path().join("meta"));

        assert!(store.load_checkpoint().unwrap().is_none());

        let checkpoint = SyncCheckpoint {
            last_upload_at: Utc::now(),
            last_upload_seq: Some("12-a".to_string()),
            last_download_seq: Some("15-b".to_string()),
            last_download_at: Some(Utc::now()),
        };
        store.save_checkpoint(&checkpoint).unwrap();

        let loaded = store.load_checkpoint().unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(store.checkpoint_path().exists());
    }

    #[test]
    fn test_file_store_status_roundtrip() {
        let tmp = tempdir().unwrap();
        let store = FileMetadataStore::new(tmp.path());

        let mut status = SyncStatus::default();
        status.documents_uploaded = 7;
        status.error = Some("boom".to_string());
        store.save_status(&status).unwrap();

        let loaded = store.load_status().unwrap().unwrap();
        assert_eq!(loaded, status);
    }

    #[test]
    fn test_file_store_rejects_corrupt_blob() {
        let tmp = tempdir().unwrap();
        let store = FileMetadataStore::new(tmp.path());
        std::fs::write(store.checkpoint_path(), "not json").unwrap();
        assert!(store.load_checkpoint().is_err());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryMetadataStore::new();
        assert!(store.load_checkpoint().unwrap().is_none());

        let checkpoint = SyncCheckpoint::default();
        store.save_checkpoint(&checkpoint).unwrap();
        assert_eq!(store.load_checkpoint().unwrap().unwrap(), checkpoint);
    }
}
