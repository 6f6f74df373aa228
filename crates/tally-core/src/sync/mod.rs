//! Bidirectional sync engine.
//!
//! A cycle runs an upload phase (local changes past the watermark pushed
//! in batches) and a download phase (change feed applied with
//! last-writer-wins). Operational failures are collected into the cycle
//! report instead of aborting it; only misuse (`SyncNotReady`,
//! `SyncAlreadyRunning`) surfaces as `Err`. Progress and state changes
//! fan out through [`StatusPublisher`] and are mirrored to the metadata
//! store so the last known state survives restarts.

mod checkpoint;
mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::{ConflictResolution, SyncSettings};
use crate::error::{Error, Result};
use crate::models::{RecordKind, SyncConflict, SyncRecord};
use crate::remote::{BulkOutcome, ConnectionStatus, RemoteDocument, RemoteError, RemoteStore};
use crate::store::LocalStore;

pub use checkpoint::{FileMetadataStore, MemoryMetadataStore, MetadataStore, SyncCheckpoint};
pub use status::{StatusPublisher, Subscription, SyncDirection, SyncEvent, SyncPhase, SyncStatus};

/// Maximum change-feed entries fetched per cycle
const CHANGES_PAGE_LIMIT: usize = 500;

/// Outcome of one sync cycle
///
/// `success` means no errors were collected; resolved conflicts are not
/// errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub documents_uploaded: usize,
    pub documents_downloaded: usize,
    pub conflicts_resolved: usize,
    pub errors: Vec<String>,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Dependency-injected sync engine over a local store, a remote store,
/// and a metadata store
///
/// The engine has a caller-owned lifecycle: construct it, `initialize()`
/// once the remote is reachable, then call [`SyncEngine::sync`] directly
/// or schedule it with [`SyncEngine::start_auto_sync`].
pub struct SyncEngine<L, R, M> {
    local: L,
    remote: R,
    metadata: M,
    settings: SyncSettings,
    initialized: AtomicBool,
    running: AtomicBool,
    status: Mutex<SyncStatus>,
    publisher: StatusPublisher,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

/// Resets the running flag on every exit path, including panics
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl<L, R, M> SyncEngine<L, R, M>
where
    L: LocalStore,
    R: RemoteStore,
    M: MetadataStore,
{
    /// Construct an engine; restores the last mirrored status, resetting
    /// transient fields
    pub fn new(local: L, remote: R, metadata: M, settings: SyncSettings) -> Self {
        let mut status = match metadata.load_status() {
            Ok(status) => status.unwrap_or_default(),
            Err(error) => {
                tracing::warn!("failed to load persisted sync status: {error}");
                SyncStatus::default()
            }
        };
        status.is_running = false;
        status.direction = SyncDirection::Idle;

        Self {
            local,
            remote,
            metadata,
            settings,
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            status: Mutex::new(status),
            publisher: StatusPublisher::new(),
            auto_sync: Mutex::new(None),
        }
    }

    /// Validate the connection and ensure the remote database exists
    ///
    /// A failed initialize leaves the engine usable offline; `sync()`
    /// keeps returning [`Error::SyncNotReady`] until this succeeds.
    pub async fn initialize(&self) -> Result<ConnectionStatus> {
        self.settings.validate()?;

        let connection = self.remote.validate_connection().await;
        if !connection.connected {
            let reason = connection
                .error
                .unwrap_or_else(|| "remote store unreachable".to_string());
            return Err(Error::Remote(RemoteError::Network(reason)));
        }

        if !self.remote.database_exists().await? {
            self.remote.create_database().await?;
            tracing::info!(database = %self.settings.database, "created remote database");
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::debug!(database = %self.settings.database, "sync engine initialized");
        Ok(connection)
    }

    /// Whether `initialize()` has succeeded
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether a cycle is currently in flight
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current status snapshot
    pub fn status(&self) -> SyncStatus {
        self.status_lock().clone()
    }

    /// The settings this engine was built with
    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Register a callback for sync events
    pub fn subscribe(&self, callback: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.publisher.subscribe(callback)
    }

    /// Reset the error field of the status
    pub fn clear_error(&self) {
        self.update_status(|status| status.error = None);
    }

    /// Run one sync cycle
    ///
    /// Returns `Err` only for misuse; operational failures land in the
    /// report's `errors` and flip `success` to false.
    pub async fn sync(&self) -> Result<SyncReport> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::SyncNotReady);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::SyncAlreadyRunning);
        }
        let _guard = RunGuard { flag: &self.running };

        let uploads = self.settings.mode.uploads();
        let downloads = self.settings.mode.downloads();
        let both = uploads && downloads;

        let mut checkpoint = match self.metadata.load_checkpoint() {
            Ok(checkpoint) => checkpoint.unwrap_or_default(),
            Err(error) => {
                tracing::warn!("failed to load sync checkpoint, starting over: {error}");
                SyncCheckpoint::default()
            }
        };

        let mut report = SyncReport {
            success: false,
            documents_uploaded: 0,
            documents_downloaded: 0,
            conflicts_resolved: 0,
            errors: Vec::new(),
            timestamp: Utc::now(),
        };

        self.update_status(|status| {
            status.is_running = true;
            status.progress = 0;
            status.documents_uploaded = 0;
            status.documents_downloaded = 0;
            status.error = None;
        });

        if uploads {
            self.upload_phase(&mut checkpoint, &mut report, both).await;
        }
        if downloads {
            self.download_phase(&mut checkpoint, &mut report, both).await;
        }

        report.timestamp = Utc::now();
        report.success = report.errors.is_empty();

        self.update_status(|status| {
            status.is_running = false;
            status.direction = SyncDirection::Idle;
            status.progress = 100;
            status.last_sync = Some(report.timestamp);
            status.error = report.errors.first().cloned();
        });

        if let Some(first) = report.errors.first() {
            self.publisher.emit(&SyncEvent::Error(first.clone()));
        }
        self.publisher.emit(&SyncEvent::Finished {
            success: report.success,
        });

        if report.success {
            tracing::info!(
                uploaded = report.documents_uploaded,
                downloaded = report.documents_downloaded,
                conflicts = report.conflicts_resolved,
                "sync cycle finished"
            );
        } else {
            tracing::warn!(
                errors = report.errors.len(),
                "sync cycle finished with errors"
            );
        }
        Ok(report)
    }

    async fn upload_phase(
        &self,
        checkpoint: &mut SyncCheckpoint,
        report: &mut SyncReport,
        both: bool,
    ) {
        self.publisher.emit(&SyncEvent::PhaseStarted(SyncPhase::Upload));
        self.update_status(|status| {
            status.direction = if both {
                SyncDirection::Both
            } else {
                SyncDirection::Upload
            };
        });

        let mut pending = Vec::new();
        for kind in RecordKind::ALL {
            match self.local.changed_since(kind, checkpoint.last_upload_at) {
                Ok(records) => pending.extend(records),
                Err(error) => report
                    .errors
                    .push(format!("query changed {kind} records: {error}")),
            }
        }
        for record in &pending {
            if !record.timestamps_consistent() {
                tracing::warn!(
                    document_id = %record.document_id(),
                    "record updated_at precedes created_at"
                );
            }
        }
        tracing::debug!(pending = pending.len(), "upload phase starting");

        let total = pending.chunks(self.settings.batch_size).count();
        for (index, batch) in pending.chunks(self.settings.batch_size).enumerate() {
            let documents: Vec<RemoteDocument> = batch
                .iter()
                .cloned()
                .map(RemoteDocument::from_record)
                .collect();

            match self.remote.bulk_write(&documents).await {
                Ok(results) => {
                    let mut stale = Vec::new();
                    for result in results {
                        match result.outcome {
                            BulkOutcome::Accepted { .. } => report.documents_uploaded += 1,
                            BulkOutcome::Conflict => {
                                if let Some(document) = documents
                                    .iter()
                                    .find(|d| d.document_id == result.document_id)
                                {
                                    stale.push(document.clone());
                                }
                            }
                            BulkOutcome::Rejected { reason } => report
                                .errors
                                .push(format!("upload {}: {reason}", result.document_id)),
                        }
                    }
                    if !stale.is_empty() {
                        self.retry_stale_uploads(stale, report).await;
                    }
                }
                Err(error) => report
                    .errors
                    .push(format!("upload batch {}/{total}: {error}", index + 1)),
            }

            let percent = phase_progress(index + 1, total, both, SyncPhase::Upload);
            self.publish_progress(percent, report);
        }

        // Advance only after something actually landed, so failed cycles
        // re-offer the same records.
        if report.documents_uploaded > 0 {
            checkpoint.last_upload_at = Utc::now();
            match self.remote.database_info().await {
                Ok(info) => checkpoint.last_upload_seq = Some(info.update_seq),
                // Informational cursor; the timestamp watermark is what
                // drives the next upload
                Err(error) => {
                    tracing::debug!("could not observe post-upload sequence: {error}");
                }
            }
            if let Err(error) = self.metadata.save_checkpoint(checkpoint) {
                report
                    .errors
                    .push(format!("persist upload checkpoint: {error}"));
            }
        }
        self.publisher
            .emit(&SyncEvent::PhaseFinished(SyncPhase::Upload));
    }

    /// Retry documents rejected with a stale revision once, using the
    /// revision currently stored remotely
    async fn retry_stale_uploads(&self, stale: Vec<RemoteDocument>, report: &mut SyncReport) {
        let mut retry = Vec::new();
        for document in stale {
            match self.remote.get_document(&document.document_id).await {
                Ok(Some(current)) => match current.revision {
                    Some(revision) => retry.push(document.with_revision(revision)),
                    None => report.errors.push(format!(
                        "upload {}: remote returned no revision",
                        document.document_id
                    )),
                },
                // Deleted remotely since the conflict; retry as a create
                Ok(None) => retry.push(document),
                Err(error) => report.errors.push(format!(
                    "upload {}: fetch current revision: {error}",
                    document.document_id
                )),
            }
        }
        if retry.is_empty() {
            return;
        }

        match self.remote.bulk_write(&retry).await {
            Ok(results) => {
                for result in results {
                    match result.outcome {
                        BulkOutcome::Accepted { .. } => {
                            report.documents_uploaded += 1;
                            report.conflicts_resolved += 1;
                        }
                        BulkOutcome::Conflict => report.errors.push(format!(
                            "upload {}: unresolved revision conflict",
                            result.document_id
                        )),
                        BulkOutcome::Rejected { reason } => report
                            .errors
                            .push(format!("upload {}: {reason}", result.document_id)),
                    }
                }
            }
            Err(error) => report.errors.push(format!("upload retry: {error}")),
        }
    }

    async fn download_phase(
        &self,
        checkpoint: &mut SyncCheckpoint,
        report: &mut SyncReport,
        both: bool,
    ) {
        self.publisher
            .emit(&SyncEvent::PhaseStarted(SyncPhase::Download));
        self.update_status(|status| {
            status.direction = if both {
                SyncDirection::Both
            } else {
                SyncDirection::Download
            };
        });

        let page = match self
            .remote
            .changes_since(checkpoint.last_download_seq.as_deref(), CHANGES_PAGE_LIMIT)
            .await
        {
            Ok(page) => page,
            // Cursor stays put so the next cycle refetches this page
            Err(error) => {
                report.errors.push(format!("fetch change feed: {error}"));
                self.publisher
                    .emit(&SyncEvent::PhaseFinished(SyncPhase::Download));
                return;
            }
        };

        let documents: Vec<RemoteDocument> = page
            .changes
            .into_iter()
            .filter(|change| !change.deleted)
            .filter_map(|change| change.document)
            .collect();
        tracing::debug!(pending = documents.len(), "download phase starting");

        let total = documents.chunks(self.settings.batch_size).count();
        for (index, batch) in documents.chunks(self.settings.batch_size).enumerate() {
            for document in batch {
                self.apply_remote_document(document, report);
            }
            let percent = phase_progress(index + 1, total, both, SyncPhase::Download);
            self.publish_progress(percent, report);
        }

        checkpoint.last_download_seq = Some(page.last_seq);
        checkpoint.last_download_at = Some(Utc::now());
        if let Err(error) = self.metadata.save_checkpoint(checkpoint) {
            report
                .errors
                .push(format!("persist download checkpoint: {error}"));
        }
        self.publisher
            .emit(&SyncEvent::PhaseFinished(SyncPhase::Download));
    }

    /// Last-writer-wins apply of one downloaded document
    fn apply_remote_document(&self, document: &RemoteDocument, report: &mut SyncReport) {
        let record = &document.record;
        if !record.timestamps_consistent() {
            tracing::warn!(
                document_id = %document.document_id,
                "downloaded record updated_at precedes created_at"
            );
        }

        let existing = match self.local.get(record.kind(), &record.id()) {
            Ok(existing) => existing,
            Err(error) => {
                report
                    .errors
                    .push(format!("download {}: {error}", document.document_id));
                return;
            }
        };

        match existing {
            None => match self.local.upsert(record) {
                Ok(()) => report.documents_downloaded += 1,
                Err(error) => report
                    .errors
                    .push(format!("download {}: {error}", document.document_id)),
            },
            Some(local) => match record.updated_at().cmp(&local.updated_at()) {
                std::cmp::Ordering::Greater => match self.local.upsert(record) {
                    Ok(()) => report.documents_downloaded += 1,
                    Err(error) => {
                        tracing::debug!(
                            document_id = %document.document_id,
                            "apply failed, deferring to conflict policy: {error}"
                        );
                        self.resolve_conflict(&local, record, report);
                    }
                },
                // Local copy is newer; upload phase owns it
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => {
                    if *record != local {
                        self.resolve_conflict(&local, record, report);
                    }
                }
            },
        }
    }

    /// Apply the configured policy to a conflict timestamps cannot settle
    fn resolve_conflict(&self, local: &SyncRecord, remote: &SyncRecord, report: &mut SyncReport) {
        let policy = self.settings.conflict_resolution;
        let strategy = match policy {
            ConflictResolution::RemoteWins => "remote-wins",
            ConflictResolution::LocalWins => "local-wins",
            ConflictResolution::Manual => "manual",
        };
        self.journal_conflict(local, remote, strategy, policy == ConflictResolution::Manual);

        match policy {
            ConflictResolution::LocalWins => {
                report.conflicts_resolved += 1;
            }
            ConflictResolution::RemoteWins | ConflictResolution::Manual => {
                if policy == ConflictResolution::Manual {
                    tracing::warn!(
                        record_id = %remote.id(),
                        "manual resolution pending; applying remote version meanwhile"
                    );
                }
                match self.local.upsert(remote) {
                    Ok(()) => {
                        report.conflicts_resolved += 1;
                        report.documents_downloaded += 1;
                    }
                    Err(error) => report
                        .errors
                        .push(format!("resolve conflict for {}: {error}", remote.id())),
                }
            }
        }
    }

    fn journal_conflict(
        &self,
        local: &SyncRecord,
        remote: &SyncRecord,
        strategy: &str,
        keep_versions: bool,
    ) {
        let conflict = SyncConflict {
            id: 0,
            record_kind: remote.kind(),
            record_id: remote.id(),
            local_updated_at: local.updated_at(),
            remote_updated_at: remote.updated_at(),
            resolved_at: Utc::now(),
            strategy: strategy.to_string(),
            local_version: keep_versions
                .then(|| serde_json::to_string(local).ok())
                .flatten(),
            remote_version: keep_versions
                .then(|| serde_json::to_string(remote).ok())
                .flatten(),
        };
        if let Err(error) = self.local.record_conflict(&conflict) {
            tracing::warn!(record_id = %conflict.record_id, "failed to journal conflict: {error}");
        }
    }

    fn publish_progress(&self, percent: u8, report: &SyncReport) {
        self.update_status(|status| {
            status.progress = percent;
            status.documents_uploaded = report.documents_uploaded;
            status.documents_downloaded = report.documents_downloaded;
        });
        self.publisher.emit(&SyncEvent::Progress {
            percent,
            uploaded: report.documents_uploaded,
            downloaded: report.documents_downloaded,
        });
    }

    /// Mutate the status snapshot and mirror it to the metadata store
    fn update_status(&self, mutate: impl FnOnce(&mut SyncStatus)) {
        let snapshot = {
            let mut status = self.status_lock();
            mutate(&mut status);
            status.clone()
        };
        if let Err(error) = self.metadata.save_status(&snapshot) {
            tracing::warn!("failed to mirror sync status: {error}");
        }
    }

    fn status_lock(&self) -> std::sync::MutexGuard<'_, SyncStatus> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<L, R, M> SyncEngine<L, R, M>
where
    L: LocalStore + Send + Sync + 'static,
    R: RemoteStore + 'static,
    M: MetadataStore + Send + Sync + 'static,
{
    /// Start the auto-sync timer
    ///
    /// Runs `sync()` every `sync_interval`; ticks that land while a cycle
    /// is in flight are skipped, never queued. Starting twice is a no-op.
    pub fn start_auto_sync(self: &Arc<Self>) {
        let mut slot = match self.auto_sync.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let engine = Arc::clone(self);
        let period = self.settings.sync_interval();
        tracing::debug!(?period, "auto-sync started");
        *slot = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if engine.is_running() {
                    tracing::debug!("auto-sync tick skipped; cycle in flight");
                    continue;
                }
                match engine.sync().await {
                    Ok(report) if report.success => {}
                    Ok(report) => tracing::warn!(
                        errors = report.errors.len(),
                        "auto-sync cycle finished with errors"
                    ),
                    Err(error) => tracing::debug!("auto-sync cycle skipped: {error}"),
                }
            }
        }));
    }

    /// Stop the auto-sync timer; idempotent
    pub fn stop_auto_sync(&self) {
        let handle = match self.auto_sync.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!("auto-sync stopped");
        }
    }
}

impl<L, R, M> Drop for SyncEngine<L, R, M> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.auto_sync.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn phase_progress(done: usize, total: usize, both_phases: bool, phase: SyncPhase) -> u8 {
    let fraction = if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    };
    let percent = if both_phases {
        match phase {
            SyncPhase::Upload => fraction * 50.0,
            SyncPhase::Download => fraction.mul_add(50.0, 50.0),
        }
    } else {
        fraction * 100.0
    };
    percent.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    use crate::config::SyncMode;
    use crate::models::Transaction;
    use crate::remote::{BulkWriteResult, ChangesPage, DatabaseInfo, RemoteChange, ServerInfo};
    use crate::store::MemoryStore;

    use super::*;

    #[derive(Default)]
    struct FakeState {
        documents: HashMap<String, RemoteDocument>,
        rev_counter: u64,
        reject_ids: HashSet<String>,
        bulk_calls: Vec<Vec<String>>,
        changes_calls: Vec<Option<String>>,
        changes: Vec<RemoteChange>,
        last_seq: String,
        offline: bool,
    }

    #[derive(Default)]
    struct FakeRemote {
        state: std::sync::Mutex<FakeState>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeRemote {
        fn new() -> Self {
            let fake = Self::default();
            fake.state.lock().unwrap().last_seq = "0".to_string();
            fake
        }

        fn offline() -> Self {
            let fake = Self::new();
            fake.state.lock().unwrap().offline = true;
            fake
        }

        fn gated(gate: Arc<Notify>) -> Self {
            let mut fake = Self::new();
            fake.gate = Some(gate);
            fake
        }

        fn seed_document(&self, record: SyncRecord) {
            let mut state = self.state.lock().unwrap();
            state.rev_counter += 1;
            let revision = format!("{}-fake", state.rev_counter);
            let document = RemoteDocument::from_record(record).with_revision(revision);
            state.documents.insert(document.document_id.clone(), document);
        }

        fn push_change(&self, record: SyncRecord, seq: &str) {
            let document = RemoteDocument::from_record(record).with_revision("1-fake");
            let mut state = self.state.lock().unwrap();
            state.changes.push(RemoteChange {
                seq: seq.to_string(),
                document_id: document.document_id.clone(),
                deleted: false,
                document: Some(document),
            });
            state.last_seq = seq.to_string();
        }

        fn push_deletion(&self, document_id: &str, seq: &str) {
            let mut state = self.state.lock().unwrap();
            state.changes.push(RemoteChange {
                seq: seq.to_string(),
                document_id: document_id.to_string(),
                deleted: true,
                document: None,
            });
            state.last_seq = seq.to_string();
        }

        fn reject(&self, document_id: &str) {
            self.state
                .lock()
                .unwrap()
                .reject_ids
                .insert(document_id.to_string());
        }

        fn bulk_calls(&self) -> Vec<Vec<String>> {
            self.state.lock().unwrap().bulk_calls.clone()
        }

        fn changes_calls(&self) -> Vec<Option<String>> {
            self.state.lock().unwrap().changes_calls.clone()
        }

        fn stored(&self, document_id: &str) -> Option<RemoteDocument> {
            self.state.lock().unwrap().documents.get(document_id).cloned()
        }
    }

    #[async_trait]
    impl RemoteStore for FakeRemote {
        async fn validate_connection(&self) -> ConnectionStatus {
            if self.state.lock().unwrap().offline {
                ConnectionStatus {
                    connected: false,
                    server_info: None,
                    error: Some("connection refused".to_string()),
                }
            } else {
                ConnectionStatus {
                    connected: true,
                    server_info: Some(ServerInfo {
                        couchdb: Some("Welcome".to_string()),
                        version: Some("3.3.0".to_string()),
                    }),
                    error: None,
                }
            }
        }

        async fn database_exists(&self) -> std::result::Result<bool, RemoteError> {
            Ok(true)
        }

        async fn create_database(&self) -> std::result::Result<bool, RemoteError> {
            Ok(true)
        }

        async fn get_document(
            &self,
            document_id: &str,
        ) -> std::result::Result<Option<RemoteDocument>, RemoteError> {
            Ok(self.state.lock().unwrap().documents.get(document_id).cloned())
        }

        async fn put_document(
            &self,
            document: &RemoteDocument,
        ) -> std::result::Result<String, RemoteError> {
            let results = self.bulk_write(std::slice::from_ref(document)).await?;
            match results.into_iter().next().map(|r| r.outcome) {
                Some(BulkOutcome::Accepted { revision }) => Ok(revision),
                _ => Err(RemoteError::Conflict),
            }
        }

        async fn bulk_write(
            &self,
            documents: &[RemoteDocument],
        ) -> std::result::Result<Vec<BulkWriteResult>, RemoteError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let mut state = self.state.lock().unwrap();
            state
                .bulk_calls
                .push(documents.iter().map(|d| d.document_id.clone()).collect());

            let mut results = Vec::new();
            for document in documents {
                if state.reject_ids.contains(&document.document_id) {
                    results.push(BulkWriteResult {
                        document_id: document.document_id.clone(),
                        outcome: BulkOutcome::Rejected {
                            reason: "forbidden".to_string(),
                        },
                    });
                    continue;
                }
                let current = state
                    .documents
                    .get(&document.document_id)
                    .and_then(|d| d.revision.clone());
                if current.is_some() && document.revision != current {
                    results.push(BulkWriteResult {
                        document_id: document.document_id.clone(),
                        outcome: BulkOutcome::Conflict,
                    });
                    continue;
                }
                state.rev_counter += 1;
                let revision = format!("{}-fake", state.rev_counter);
                state.last_seq = state.rev_counter.to_string();
                state.documents.insert(
                    document.document_id.clone(),
                    document.clone().with_revision(revision.clone()),
                );
                results.push(BulkWriteResult {
                    document_id: document.document_id.clone(),
                    outcome: BulkOutcome::Accepted { revision },
                });
            }
            Ok(results)
        }

        async fn changes_since(
            &self,
            since: Option<&str>,
            _limit: usize,
        ) -> std::result::Result<ChangesPage, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.changes_calls.push(since.map(ToString::to_string));
            if since == Some(state.last_seq.as_str()) {
                return Ok(ChangesPage {
                    changes: Vec::new(),
                    last_seq: state.last_seq.clone(),
                });
            }
            Ok(ChangesPage {
                changes: state.changes.clone(),
                last_seq: state.last_seq.clone(),
            })
        }

        async fn database_info(&self) -> std::result::Result<DatabaseInfo, RemoteError> {
            let state = self.state.lock().unwrap();
            Ok(DatabaseInfo {
                doc_count: state.documents.len() as u64,
                update_seq: state.last_seq.clone(),
            })
        }
    }

    type TestEngine = SyncEngine<MemoryStore, FakeRemote, MemoryMetadataStore>;

    fn settings() -> SyncSettings {
        SyncSettings::new("https://couch.example.com", "tally")
    }

    async fn ready_engine(remote: FakeRemote, settings: SyncSettings) -> TestEngine {
        let engine = SyncEngine::new(
            MemoryStore::new(),
            remote,
            MemoryMetadataStore::new(),
            settings,
        );
        engine.initialize().await.unwrap();
        engine
    }

    fn transaction_at(description: &str, updated_at: DateTime<Utc>) -> Transaction {
        let mut tx = Transaction::new(-4.2, description);
        tx.created_at = updated_at - Duration::seconds(10);
        tx.updated_at = updated_at;
        tx
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_requires_initialize() {
        let engine = SyncEngine::new(
            MemoryStore::new(),
            FakeRemote::new(),
            MemoryMetadataStore::new(),
            settings(),
        );
        assert!(matches!(engine.sync().await, Err(Error::SyncNotReady)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_initialize_leaves_engine_offline() {
        let engine = SyncEngine::new(
            MemoryStore::new(),
            FakeRemote::offline(),
            MemoryMetadataStore::new(),
            settings(),
        );
        assert!(engine.initialize().await.is_err());
        assert!(!engine.is_initialized());
        assert!(matches!(engine.sync().await, Err(Error::SyncNotReady)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_advances_watermark_and_is_idempotent() {
        let engine = ready_engine(FakeRemote::new(), settings()).await;
        let record = SyncRecord::from(Transaction::new(-12.0, "Groceries"));
        engine.local.upsert(&record).unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.documents_uploaded, 1);
        assert!(engine.remote.stored(&record.document_id()).is_some());

        // Unchanged records are not re-offered
        let report = engine.sync().await.unwrap();
        assert_eq!(report.documents_uploaded, 0);
        assert_eq!(engine.remote.bulk_calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_at_watermark_is_not_uploaded() {
        let remote = FakeRemote::new();
        let metadata = MemoryMetadataStore::new();
        let tx = Transaction::new(-3.0, "Coffee");
        let mut checkpoint = SyncCheckpoint::default();
        checkpoint.last_upload_at = tx.updated_at;
        metadata.save_checkpoint(&checkpoint).unwrap();

        let engine = SyncEngine::new(MemoryStore::new(), remote, metadata, settings());
        engine.local.upsert(&SyncRecord::from(tx)).unwrap();
        engine.initialize().await.unwrap();

        let report = engine.sync().await.unwrap();
        assert_eq!(report.documents_uploaded, 0);
        assert!(engine.remote.bulk_calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_download_applies_strictly_newer_remote_version() {
        let base = Utc::now();
        let local_tx = transaction_at("Rent", base);
        let mut remote_tx = local_tx.clone();
        remote_tx.amount = -950.0;
        remote_tx.updated_at = base + Duration::seconds(5);

        let remote = FakeRemote::new();
        remote.push_change(SyncRecord::from(remote_tx.clone()), "1");

        let engine = ready_engine(remote, settings().with_mode(SyncMode::DownloadOnly)).await;
        engine.local.upsert(&SyncRecord::from(local_tx)).unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.documents_downloaded, 1);

        let stored = engine
            .local
            .get(RecordKind::Transaction, &remote_tx.id.to_string())
            .unwrap()
            .unwrap();
        assert_eq!(stored, SyncRecord::from(remote_tx));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_download_keeps_local_when_remote_is_older() {
        let base = Utc::now();
        let local_tx = transaction_at("Rent", base);
        let mut remote_tx = local_tx.clone();
        remote_tx.amount = -950.0;
        remote_tx.updated_at = base - Duration::seconds(5);

        let remote = FakeRemote::new();
        remote.push_change(SyncRecord::from(remote_tx), "1");

        let engine = ready_engine(remote, settings().with_mode(SyncMode::DownloadOnly)).await;
        let local = SyncRecord::from(local_tx.clone());
        engine.local.upsert(&local).unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.documents_downloaded, 0);
        assert_eq!(
            engine
                .local
                .get(RecordKind::Transaction, &local_tx.id.to_string())
                .unwrap()
                .unwrap(),
            local
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_equal_timestamps_different_payload_remote_wins_and_journals() {
        let base = Utc::now();
        let local_tx = transaction_at("Lunch", base);
        let mut remote_tx = local_tx.clone();
        remote_tx.description = "Lunch with team".to_string();

        let remote = FakeRemote::new();
        remote.push_change(SyncRecord::from(remote_tx.clone()), "1");

        let engine = ready_engine(remote, settings().with_mode(SyncMode::DownloadOnly)).await;
        engine.local.upsert(&SyncRecord::from(local_tx)).unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(
            engine
                .local
                .get(RecordKind::Transaction, &remote_tx.id.to_string())
                .unwrap()
                .unwrap(),
            SyncRecord::from(remote_tx)
        );

        let conflicts = engine.local.recent_conflicts(10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].strategy, "remote-wins");
        assert!(conflicts[0].local_version.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_wins_policy_keeps_local_version() {
        let base = Utc::now();
        let local_tx = transaction_at("Lunch", base);
        let mut remote_tx = local_tx.clone();
        remote_tx.description = "Lunch with team".to_string();

        let remote = FakeRemote::new();
        remote.push_change(SyncRecord::from(remote_tx), "1");

        let engine = ready_engine(
            remote,
            settings()
                .with_mode(SyncMode::DownloadOnly)
                .with_conflict_resolution(ConflictResolution::LocalWins),
        )
        .await;
        let local = SyncRecord::from(local_tx.clone());
        engine.local.upsert(&local).unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(report.documents_downloaded, 0);
        assert_eq!(
            engine
                .local
                .get(RecordKind::Transaction, &local_tx.id.to_string())
                .unwrap()
                .unwrap(),
            local
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_manual_policy_journals_both_versions() {
        let base = Utc::now();
        let local_tx = transaction_at("Lunch", base);
        let mut remote_tx = local_tx.clone();
        remote_tx.description = "Lunch with team".to_string();

        let remote = FakeRemote::new();
        remote.push_change(SyncRecord::from(remote_tx.clone()), "1");

        let engine = ready_engine(
            remote,
            settings()
                .with_mode(SyncMode::DownloadOnly)
                .with_conflict_resolution(ConflictResolution::Manual),
        )
        .await;
        engine.local.upsert(&SyncRecord::from(local_tx)).unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.conflicts_resolved, 1);

        let conflicts = engine.local.recent_conflicts(10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].strategy, "manual");
        let local_version = conflicts[0].local_version.as_deref().unwrap();
        let remote_version = conflicts[0].remote_version.as_deref().unwrap();
        assert!(local_version.contains("Lunch"));
        assert!(remote_version.contains("Lunch with team"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_batch_failure_continues_and_reports() {
        let base = Utc::now();
        let plain = SyncRecord::from(Transaction::new(-1.0, "a"));
        let mut conflicted_tx = transaction_at("b", base - Duration::seconds(60));
        let bad = SyncRecord::from(Transaction::new(-3.0, "c"));

        let remote = FakeRemote::new();
        // Stale remote copy makes the first write of this document conflict
        remote.seed_document(SyncRecord::from(conflicted_tx.clone()));
        conflicted_tx.amount = -2.0;
        conflicted_tx.updated_at = base;
        let conflicted = SyncRecord::from(conflicted_tx);

        let engine = ready_engine(remote, settings().with_mode(SyncMode::UploadOnly)).await;
        for record in [&plain, &conflicted, &bad] {
            engine.local.upsert(record).unwrap();
        }
        engine.remote.reject(&bad.document_id());

        let report = engine.sync().await.unwrap();
        assert!(!report.success);
        assert_eq!(report.documents_uploaded, 2);
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("forbidden"));
        assert!(engine.remote.stored(&plain.document_id()).is_some());
        assert_eq!(
            engine
                .remote
                .stored(&conflicted.document_id())
                .unwrap()
                .record,
            conflicted
        );

        // The first error of the cycle lands in the status
        assert_eq!(engine.status().error.as_deref(), Some(report.errors[0].as_str()));
        engine.clear_error();
        assert!(engine.status().error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_revision_retried_with_current_revision() {
        let base = Utc::now();
        let old_tx = transaction_at("Phone bill", base - Duration::seconds(60));
        let mut new_tx = old_tx.clone();
        new_tx.amount = -35.0;
        new_tx.updated_at = base;

        let remote = FakeRemote::new();
        remote.seed_document(SyncRecord::from(old_tx));

        let engine = ready_engine(remote, settings().with_mode(SyncMode::UploadOnly)).await;
        engine.local.upsert(&SyncRecord::from(new_tx.clone())).unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.success, "errors: {:?}", report.errors);
        assert_eq!(report.documents_uploaded, 1);
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(engine.remote.bulk_calls().len(), 2);

        let stored = engine
            .remote
            .stored(&format!("transaction:{}", new_tx.id))
            .unwrap();
        assert_eq!(stored.record, SyncRecord::from(new_tx));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_scenario_with_dated_checkpoint() {
        let checkpoint_at: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let edited_at: DateTime<Utc> = "2024-01-02T00:00:00Z".parse().unwrap();

        let metadata = MemoryMetadataStore::new();
        let mut checkpoint = SyncCheckpoint::default();
        checkpoint.last_upload_at = checkpoint_at;
        metadata.save_checkpoint(&checkpoint).unwrap();

        let engine = SyncEngine::new(
            MemoryStore::new(),
            FakeRemote::new(),
            metadata,
            settings().with_mode(SyncMode::UploadOnly),
        );
        let tx = transaction_at("Rent", edited_at);
        engine.local.upsert(&SyncRecord::from(tx.clone())).unwrap();
        engine.initialize().await.unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.documents_uploaded, 1);

        let calls = engine.remote.bulk_calls();
        assert_eq!(calls, vec![vec![format!("transaction:{}", tx.id)]]);

        let advanced = engine.metadata.load_checkpoint().unwrap().unwrap();
        assert!(advanced.last_upload_at >= edited_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_records_remote_sequence() {
        let engine = ready_engine(FakeRemote::new(), settings().with_mode(SyncMode::UploadOnly)).await;
        engine
            .local
            .upsert(&SyncRecord::from(Transaction::new(-7.0, "Books")))
            .unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.documents_uploaded, 1);

        let checkpoint = engine.metadata.load_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.last_upload_seq.as_deref(), Some("1"));

        // A cycle that uploads nothing leaves the observed sequence alone
        let report = engine.sync().await.unwrap();
        assert_eq!(report.documents_uploaded, 0);
        let checkpoint = engine.metadata.load_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.last_upload_seq.as_deref(), Some("1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bidirectional_cycle_reports_both_direction() {
        let gate = Arc::new(Notify::new());
        let remote = FakeRemote::gated(Arc::clone(&gate));
        let engine = Arc::new(ready_engine(remote, settings()).await);
        engine
            .local
            .upsert(&SyncRecord::from(Transaction::new(-6.0, "Museum")))
            .unwrap();

        let cycle = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.sync().await })
        };
        while engine.status().direction == SyncDirection::Idle {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.status().direction, SyncDirection::Both);

        gate.notify_one();
        let report = cycle.await.unwrap().unwrap();
        assert!(report.success);
        assert_eq!(engine.status().direction, SyncDirection::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deletions_are_skipped_and_cursor_advances() {
        let remote = FakeRemote::new();
        remote.push_deletion("transaction:gone", "5");

        let engine = ready_engine(remote, settings().with_mode(SyncMode::DownloadOnly)).await;

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.documents_downloaded, 0);

        engine.sync().await.unwrap();
        let calls = engine.remote.changes_calls();
        assert_eq!(calls, vec![None, Some("5".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_only_mode_never_polls_changes() {
        let remote = FakeRemote::new();
        remote.push_change(SyncRecord::from(Transaction::new(-1.0, "x")), "1");

        let engine = ready_engine(remote, settings().with_mode(SyncMode::UploadOnly)).await;
        let report = engine.sync().await.unwrap();
        assert_eq!(report.documents_downloaded, 0);
        assert!(engine.remote.changes_calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_sync_is_rejected() {
        let gate = Arc::new(Notify::new());
        let remote = FakeRemote::gated(Arc::clone(&gate));
        let engine = Arc::new(ready_engine(remote, settings()).await);
        engine
            .local
            .upsert(&SyncRecord::from(Transaction::new(-2.0, "blocked")))
            .unwrap();

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.sync().await })
        };
        while !engine.is_running() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            engine.sync().await,
            Err(Error::SyncAlreadyRunning)
        ));

        gate.notify_one();
        let report = first.await.unwrap().unwrap();
        assert!(report.success);
        assert!(!engine.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_and_events_over_a_cycle() {
        let engine = ready_engine(FakeRemote::new(), settings()).await;
        engine
            .local
            .upsert(&SyncRecord::from(Transaction::new(-8.0, "Cinema")))
            .unwrap();

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let _subscription = engine.subscribe({
            let events = Arc::clone(&events);
            move |event| events.lock().unwrap().push(event.clone())
        });

        let report = engine.sync().await.unwrap();
        assert!(report.success);

        let events = events.lock().unwrap();
        assert!(events.contains(&SyncEvent::PhaseStarted(SyncPhase::Upload)));
        assert!(events.contains(&SyncEvent::PhaseStarted(SyncPhase::Download)));
        // Upload phase tops out at 50% when both phases run
        assert!(events.contains(&SyncEvent::Progress {
            percent: 50,
            uploaded: 1,
            downloaded: 0
        }));
        assert_eq!(events.last(), Some(&SyncEvent::Finished { success: true }));

        let status = engine.status();
        assert!(!status.is_running);
        assert_eq!(status.progress, 100);
        assert_eq!(status.documents_uploaded, 1);
        assert!(status.last_sync.is_some());
        assert_eq!(status.direction, SyncDirection::Idle);

        // Mirrored for restart recovery
        let mirrored = engine.metadata.load_status().unwrap().unwrap();
        assert_eq!(mirrored, status);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auto_sync_runs_and_stops() {
        let mut settings = settings();
        settings.sync_interval_ms = 20;

        let engine = Arc::new(ready_engine(FakeRemote::new(), settings).await);
        engine
            .local
            .upsert(&SyncRecord::from(Transaction::new(-5.0, "Bus")))
            .unwrap();

        engine.start_auto_sync();
        engine.start_auto_sync(); // no-op

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        engine.stop_auto_sync();
        engine.stop_auto_sync(); // idempotent

        assert!(engine.remote.stored(
            &engine
                .local
                .changed_since(RecordKind::Transaction, DateTime::UNIX_EPOCH)
                .unwrap()
                .first()
                .map(SyncRecord::document_id)
                .unwrap_or_default()
        )
        .is_some());
        assert!(engine.status().last_sync.is_some());
    }

    #[test]
    fn test_phase_progress_mapping() {
        assert_eq!(phase_progress(1, 2, true, SyncPhase::Upload), 25);
        assert_eq!(phase_progress(2, 2, true, SyncPhase::Upload), 50);
        assert_eq!(phase_progress(1, 2, true, SyncPhase::Download), 75);
        assert_eq!(phase_progress(2, 2, true, SyncPhase::Download), 100);
        assert_eq!(phase_progress(1, 1, false, SyncPhase::Upload), 100);
        assert_eq!(phase_progress(1, 0, false, SyncPhase::Download), 100);
    }
}
