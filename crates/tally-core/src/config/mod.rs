//! Sync engine configuration.
//!
//! `SyncSettings` carries everything needed to reach the remote document
//! store plus the tuning knobs for batching, retries, and scheduling. All
//! options have defaults so a config file only needs the server URL and
//! database name.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which sync phases run during a cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Upload local changes, then download remote changes
    #[default]
    Bidirectional,
    /// Only push local changes
    UploadOnly,
    /// Only pull remote changes
    DownloadOnly,
}

impl SyncMode {
    /// Whether the upload phase runs under this mode
    #[must_use]
    pub const fn uploads(self) -> bool {
        matches!(self, Self::Bidirectional | Self::UploadOnly)
    }

    /// Whether the download phase runs under this mode
    #[must_use]
    pub const fn downloads(self) -> bool {
        matches!(self, Self::Bidirectional | Self::DownloadOnly)
    }
}

/// Policy for conflicts that timestamp comparison cannot settle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Overwrite local state with the remote version
    #[default]
    RemoteWins,
    /// Keep local state, mark the remote change as seen
    LocalWins,
    /// Journal both versions for later user resolution, then apply the
    /// remote version (remote-wins fallback)
    Manual,
}

/// Configuration for the sync engine
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Remote document store base URL (e.g. `https://couch.example.com`)
    pub server_url: String,
    /// Remote database name
    pub database: String,
    /// Basic auth username
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,
    /// Auto-sync timer period in milliseconds
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Documents per upload/download batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retry ceiling for transient remote failures
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Initial retry delay in milliseconds, doubled per attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Which phases run
    #[serde(default)]
    pub mode: SyncMode,
    /// Conflict resolution policy
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
}

const fn default_sync_interval_ms() -> u64 {
    30_000
}

const fn default_batch_size() -> usize {
    50
}

const fn default_retry_attempts() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    1_000
}

impl SyncSettings {
    /// Create settings with defaults for the given remote database
    pub fn new(server_url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            database: database.into(),
            username: None,
            password: None,
            sync_interval_ms: default_sync_interval_ms(),
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            mode: SyncMode::default(),
            conflict_resolution: ConflictResolution::default(),
        }
    }

    /// Set basic auth credentials
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the batch size
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set which phases run
    #[must_use]
    pub const fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the conflict resolution policy
    #[must_use]
    pub const fn with_conflict_resolution(mut self, policy: ConflictResolution) -> Self {
        self.conflict_resolution = policy;
        self
    }

    /// Auto-sync timer period
    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Initial retry delay
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        let url = self.server_url.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::InvalidInput(
                "server_url must include http:// or https://".to_string(),
            ));
        }
        if self.database.trim().is_empty() {
            return Err(Error::InvalidInput(
                "database name must not be empty".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncSettings {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SyncSettings")
            .field("server_url", &self.server_url)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("sync_interval_ms", &self.sync_interval_ms)
            .field("batch_size", &self.batch_size)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("mode", &self.mode)
            .field("conflict_resolution", &self.conflict_resolution)
            .finish()
    }
}
