//! Sync status snapshots and the subscriber fan-out

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the engine is currently driving
///
/// `Both` covers the whole of a bidirectional cycle; single-direction
/// modes report `Upload` or `Download`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    #[default]
    Idle,
    Upload,
    Download,
    Both,
}

/// Point-in-time snapshot of the engine's state
///
/// Mirrored to the metadata store at every transition so the last known
/// state survives restarts. `error` carries the first error of the most
/// recent cycle and is cleared when a new cycle starts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_running: bool,
    /// 0-100; in bidirectional mode the upload phase maps to 0-50 and
    /// the download phase to 50-100
    pub progress: u8,
    pub documents_uploaded: usize,
    pub documents_downloaded: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub direction: SyncDirection,
}

/// The two sequential phases of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Upload,
    Download,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// Events delivered to subscribers during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    PhaseStarted(SyncPhase),
    Progress {
        percent: u8,
        uploaded: usize,
        downloaded: usize,
    },
    PhaseFinished(SyncPhase),
    /// First error of the cycle, emitted once before `Finished`
    Error(String),
    Finished {
        success: bool,
    },
}

type Callback = Box<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct PublisherInner {
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

/// Fan-out of [`SyncEvent`]s to registered callbacks
///
/// Callbacks run synchronously on the emitting task. A panicking
/// subscriber is logged and does not disturb the cycle or the other
/// subscribers.
#[derive(Clone, Default)]
pub struct StatusPublisher {
    inner: Arc<PublisherInner>,
}

/// Handle for one subscription; dropping it keeps the subscription
/// alive, call [`Subscription::cancel`] to detach
pub struct Subscription {
    id: u64,
    inner: Weak<PublisherInner>,
}

impl Subscription {
    /// Detach the callback; safe to call after the publisher is gone
    pub fn cancel(self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Ok(mut subscribers) = inner.subscribers.lock() {
                subscribers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl StatusPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every subsequent event
    pub fn subscribe(&self, callback: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.push((id, Box::new(callback)));
        }
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every live subscriber
    pub fn emit(&self, event: &SyncEvent) {
        let Ok(subscribers) = self.inner.subscribers.lock() else {
            return;
        };
        for (id, callback) in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(subscriber = id, "status subscriber panicked, continuing");
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}
