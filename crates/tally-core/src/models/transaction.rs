//! Transaction model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::CategoryId;

/// A unique identifier for a transaction, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new unique transaction ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A single financial transaction
///
/// Negative amounts are expenses, positive amounts income. `updated_at`
/// drives change detection and last-writer-wins comparisons during sync;
/// `created_at` is immutable and used for audit only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique identifier
    pub id: TransactionId,
    /// Signed amount in the account currency
    pub amount: f64,
    /// Free-form description
    pub description: String,
    /// Category this transaction belongs to, if any
    pub category_id: Option<CategoryId>,
    /// Calendar date the transaction occurred on
    pub occurred_on: NaiveDate,
    /// Creation timestamp, immutable after creation
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp, monotonically non-decreasing
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a new transaction dated today
    #[must_use]
    pub fn new(amount: f64, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::new(),
            amount,
            description: description.into(),
            category_id: None,
            occurred_on: now.date_naive(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Assign a category
    #[must_use]
    pub fn with_category(mut self, category_id: CategoryId) -> Self {
        self.category_id = Some(category_id);
        self
    }

    /// Set the calendar date
    #[must_use]
    pub const fn with_date(mut self, occurred_on: NaiveDate) -> Self {
        self.occurred_on = occurred_on;
        self
    }

    /// Mark the transaction as modified now
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
