//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: record tables
///
/// Timestamps are stored as Unix microseconds so watermark comparisons
/// stay plain integer comparisons.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE IF NOT EXISTS schema_version (
             version INTEGER PRIMARY KEY
         );
         CREATE TABLE IF NOT EXISTS transactions (
             id TEXT PRIMARY KEY,
             amount REAL NOT NULL,
             description TEXT NOT NULL,
             category_id TEXT,
             occurred_on TEXT NOT NULL,
             created_at INTEGER NOT NULL,
             updated_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_transactions_updated ON transactions(updated_at DESC);
         CREATE INDEX IF NOT EXISTS idx_transactions_occurred ON transactions(occurred_on DESC);
         CREATE INDEX IF NOT EXISTS idx_transactions_category ON transactions(category_id);
         CREATE TABLE IF NOT EXISTS categories (
             id TEXT PRIMARY KEY,
             name TEXT NOT NULL UNIQUE COLLATE NOCASE,
             color TEXT,
             created_at INTEGER NOT NULL,
             updated_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_categories_updated ON categories(updated_at DESC);
         INSERT INTO schema_version (version) VALUES (1);
         COMMIT;",
    )?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: sync conflict journal
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE IF NOT EXISTS sync_conflicts (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             record_kind TEXT NOT NULL,
             record_id TEXT NOT NULL,
             local_updated_at INTEGER NOT NULL,
             remote_updated_at INTEGER NOT NULL,
             resolved_at INTEGER NOT NULL,
             strategy TEXT NOT NULL,
             local_version TEXT,
             remote_version TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record ON sync_conflicts(record_kind, record_id);
         CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC);
         INSERT INTO schema_version (version) VALUES (2);
         COMMIT;",
    )?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
