//! tally-core - Core library for Tally
//!
//! This crate contains the shared models, local storage, remote document
//! store client, and the sync engine used by the Tally interfaces.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::{ConflictResolution, SyncMode, SyncSettings};
pub use error::{Error, Result};
pub use models::{Category, CategoryId, RecordKind, SyncRecord, Transaction, TransactionId};
pub use sync::{SyncEngine, SyncReport, SyncStatus};
