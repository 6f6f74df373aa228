//! In-memory implementation of the local record store

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::{RecordKind, SyncConflict, SyncRecord};

use super::LocalStore;

#[derive(Default)]
struct MemoryState {
    records: HashMap<(RecordKind, String), SyncRecord>,
    conflicts: Vec<SyncConflict>,
    next_conflict_id: i64,
}

/// HashMap-backed [`LocalStore`] used by tests and tools
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::InvalidInput("memory store lock poisoned".to_string()))?;
        Ok(f(&mut state))
    }

    /// Number of records currently held, across all kinds
    pub fn len(&self) -> Result<usize> {
        self.with_state(|state| state.records.len())
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> Result<bool> {
        self.with_state(|state| state.records.is_empty())
    }
}

impl LocalStore for MemoryStore {
    fn changed_since(&self, kind: RecordKind, since: DateTime<Utc>) -> Result<Vec<SyncRecord>> {
        self.with_state(|state| {
            let mut changed: Vec<SyncRecord> = state
                .records
                .iter()
                .filter(|((record_kind, _), record)| {
                    *record_kind == kind && record.updated_at() > since
                })
                .map(|(_, record)| record.clone())
                .collect();
            changed.sort_by_key(SyncRecord::updated_at);
            changed
        })
    }

    fn get(&self, kind: RecordKind, id: &str) -> Result<Option<SyncRecord>> {
        self.with_state(|state| state.records.get(&(kind, id.to_string())).cloned())
    }

    fn upsert(&self, record: &SyncRecord) -> Result<()> {
        self.with_state(|state| {
            state
                .records
                .insert((record.kind(), record.id()), record.clone());
        })
    }

    fn record_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        self.with_state(|state| {
            state.next_conflict_id += 1;
            let mut entry = conflict.clone();
            entry.id = state.next_conflict_id;
            state.conflicts.push(entry);
        })
    }

    fn recent_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.with_state(|state| {
            let mut conflicts = state.conflicts.clone();
            conflicts.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at).then(b.id.cmp(&a.id)));
            conflicts.truncate(limit);
            conflicts
        })
    }
}
