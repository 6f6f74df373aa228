//! Domain models shared by the local store, the remote client, and the
//! sync engine.

mod category;
mod sync_conflict;
mod transaction;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use category::{Category, CategoryId};
pub use sync_conflict::SyncConflict;
pub use transaction::{Transaction, TransactionId};

/// The kinds of records that participate in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Transaction,
    Category,
}

impl RecordKind {
    /// All kinds, in the order the sync engine processes them
    pub const ALL: [Self; 2] = [Self::Transaction, Self::Category];

    /// Stable wire name, also the remote document id prefix
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Category => "category",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transaction" => Ok(Self::Transaction),
            "category" => Ok(Self::Category),
            other => Err(format!("unknown record kind: {other}")),
        }
    }
}

/// A record of any syncable kind
///
/// Downloaded changes are applied through an exhaustive match on this
/// enum, so adding a record kind is a compile-time decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncRecord {
    Transaction(Transaction),
    Category(Category),
}

impl SyncRecord {
    /// The kind of this record
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Transaction(_) => RecordKind::Transaction,
            Self::Category(_) => RecordKind::Category,
        }
    }

    /// The record's primary sync key
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Transaction(tx) => tx.id.as_str(),
            Self::Category(category) => category.id.as_str(),
        }
    }

    /// Last modification timestamp
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::Transaction(tx) => tx.updated_at,
            Self::Category(category) => category.updated_at,
        }
    }

    /// Creation timestamp
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Transaction(tx) => tx.created_at,
            Self::Category(category) => category.created_at,
        }
    }

    /// Deterministic remote document id: `<kind>:<id>`
    #[must_use]
    pub fn document_id(&self) -> String {
        format!("{}:{}", self.kind(), self.id())
    }

    /// Whether the record satisfies `updated_at >= created_at`
    ///
    /// A violation is a data-integrity warning, not a fatal error.
    #[must_use]
    pub fn timestamps_consistent(&self) -> bool {
        self.updated_at() >= self.created_at()
    }
}

impl From<Transaction> for SyncRecord {
    fn from(tx: Transaction) -> Self {
        Self::Transaction(tx)
    }
}

impl From<Category> for SyncRecord {
    fn from(category: Category) -> Self {
        Self::Category(category)
    }
}

/// Split a remote document id into record kind and record id
///
/// Returns `None` when the prefix is not a recognized kind.
#[must_use]
pub fn parse_document_id(document_id: &str) -> Option<(RecordKind, &str)> {
    let (prefix, id) = document_id.split_once(':')?;
    let kind = prefix.parse().ok()?;
    Some((kind, id))
}
