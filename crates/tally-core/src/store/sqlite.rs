//! `SQLite` implementation of the local record store

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{
    Category, RecordKind, SyncConflict, SyncRecord, Transaction,
};

use super::LocalStore;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// `SQLite`-backed [`LocalStore`]
///
/// The connection is wrapped in a mutex so the store can be shared with
/// the auto-sync task.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    /// Open a store at the given path, creating and migrating as needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::open(path)?),
        })
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::open_in_memory()?),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| Error::InvalidInput("database lock poisoned".to_string()))?;
        f(db.connection())
    }

    /// Insert or replace a transaction
    pub fn put_transaction(&self, tx: &Transaction) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO transactions
                 (id, amount, description, category_id, occurred_on, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    tx.id.as_str(),
                    tx.amount,
                    tx.description,
                    tx.category_id.map(|id| id.as_str()),
                    tx.occurred_on.format(DATE_FORMAT).to_string(),
                    tx.created_at.timestamp_micros(),
                    tx.updated_at.timestamp_micros(),
                ],
            )?;
            Ok(())
        })
    }

    /// Insert or replace a category
    pub fn put_category(&self, category: &Category) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO categories
                 (id, name, color, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    category.id.as_str(),
                    category.name,
                    category.color,
                    category.created_at.timestamp_micros(),
                    category.updated_at.timestamp_micros(),
                ],
            )?;
            Ok(())
        })
    }

    /// List transactions, most recent date first
    pub fn list_transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, amount, description, category_id, occurred_on, created_at, updated_at
                 FROM transactions
                 ORDER BY occurred_on DESC, updated_at DESC
                 LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], parse_transaction)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// List all categories, sorted by name
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, color, created_at, updated_at
                 FROM categories
                 ORDER BY name COLLATE NOCASE ASC",
            )?;
            let rows = stmt
                .query_map([], parse_category)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Find a category by name (case-insensitive)
    pub fn find_category_by_name(&self, name: &str) -> Result<Option<Category>> {
        self.with_conn(|conn| {
            let category = conn
                .query_row(
                    "SELECT id, name, color, created_at, updated_at
                     FROM categories WHERE name = ? COLLATE NOCASE",
                    params![name],
                    parse_category,
                )
                .optional()?;
            Ok(category)
        })
    }
}

impl LocalStore for SqliteStore {
    fn changed_since(&self, kind: RecordKind, since: DateTime<Utc>) -> Result<Vec<SyncRecord>> {
        let watermark = since.timestamp_micros();
        self.with_conn(|conn| match kind {
            RecordKind::Transaction => {
                let mut stmt = conn.prepare(
                    "SELECT id, amount, description, category_id, occurred_on, created_at, updated_at
                     FROM transactions
                     WHERE updated_at > ?
                     ORDER BY updated_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![watermark], parse_transaction)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows.into_iter().map(SyncRecord::from).collect())
            }
            RecordKind::Category => {
                let mut stmt = conn.prepare(
                    "SELECT id, name, color, created_at, updated_at
                     FROM categories
                     WHERE updated_at > ?
                     ORDER BY updated_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![watermark], parse_category)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows.into_iter().map(SyncRecord::from).collect())
            }
        })
    }

    fn get(&self, kind: RecordKind, id: &str) -> Result<Option<SyncRecord>> {
        self.with_conn(|conn| match kind {
            RecordKind::Transaction => {
                let tx = conn
                    .query_row(
                        "SELECT id, amount, description, category_id, occurred_on, created_at, updated_at
                         FROM transactions WHERE id = ?",
                        params![id],
                        parse_transaction,
                    )
                    .optional()?;
                Ok(tx.map(SyncRecord::from))
            }
            RecordKind::Category => {
                let category = conn
                    .query_row(
                        "SELECT id, name, color, created_at, updated_at
                         FROM categories WHERE id = ?",
                        params![id],
                        parse_category,
                    )
                    .optional()?;
                Ok(category.map(SyncRecord::from))
            }
        })
    }

    fn upsert(&self, record: &SyncRecord) -> Result<()> {
        match record {
            SyncRecord::Transaction(tx) => self.put_transaction(tx),
            SyncRecord::Category(category) => self.put_category(category),
        }
    }

    fn record_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_conflicts
                 (record_kind, record_id, local_updated_at, remote_updated_at,
                  resolved_at, strategy, local_version, remote_version)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    conflict.record_kind.as_str(),
                    conflict.record_id,
                    conflict.local_updated_at.timestamp_micros(),
                    conflict.remote_updated_at.timestamp_micros(),
                    conflict.resolved_at.timestamp_micros(),
                    conflict.strategy,
                    conflict.local_version,
                    conflict.remote_version,
                ],
            )?;
            Ok(())
        })
    }

    fn recent_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, record_kind, record_id, local_updated_at, remote_updated_at,
                        resolved_at, strategy, local_version, remote_version
                 FROM sync_conflicts
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], parse_conflict)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn timestamp_from_micros(micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {micros}").into(),
        )
    })
}

fn id_from_text<T>(raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = uuid::Error>,
{
    raw.parse().map_err(|e: uuid::Error| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn parse_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let id: String = row.get(0)?;
    let category_id: Option<String> = row.get(3)?;
    let occurred_on: String = row.get(4)?;
    Ok(Transaction {
        id: id_from_text(&id)?,
        amount: row.get(1)?,
        description: row.get(2)?,
        category_id: category_id.and_then(|raw| raw.parse().ok()),
        occurred_on: NaiveDate::parse_from_str(&occurred_on, DATE_FORMAT).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?,
        created_at: timestamp_from_micros(row.get(5)?)?,
        updated_at: timestamp_from_micros(row.get(6)?)?,
    })
}

fn parse_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    let id: String = row.get(0)?;
    Ok(Category {
        id: id_from_text(&id)?,
        name: row.get(1)?,
        color: row.get(2)?,
        created_at: timestamp_from_micros(row.get(3)?)?,
        updated_at: timestamp_from_micros(row.get(4)?)?,
    })
}

fn parse_conflict(row: &Row<'_>) -> rusqlite::Result<SyncConflict> {
    let kind: String = row.get(1)?;
    Ok(SyncConflict {
        id: row.get(0)?,
        record_kind: kind.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
        })?,
        record_id: row.get(2)?,
        local_updated_at: timestamp_from_micros(row.get(3)?)?,
        remote_updated_at: timestamp_from_micros(row.get(4)?)?,
        resolved_at: timestamp_from_micros(row.get(5)?)?,
        strategy: row.get(6)?,
        local_version: row.get(7)?,
        remote_version: row.get(8)?,
    })
}
