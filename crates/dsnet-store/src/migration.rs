//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema {} is newer than supported {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, crate::now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Content-addressed blocks
        CREATE TABLE blocks (
            block_id BLOB PRIMARY KEY,        -- 32 bytes, blake3 of data
            data BLOB NOT NULL,               -- codec tag + body
            size INTEGER NOT NULL,
            stored_at INTEGER NOT NULL        -- local time of first store
        );

        -- Log entries in application order
        CREATE TABLE entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id BLOB NOT NULL UNIQUE,    -- 32 bytes, blake3 of canonical bytes
            dataset BLOB NOT NULL,            -- 32 bytes, lineage id
            author BLOB NOT NULL,             -- 32 bytes, Ed25519 public key
            op INTEGER NOT NULL,              -- OpType as u8
            parent BLOB,                      -- 32 bytes, NULL for Init
            timestamp INTEGER NOT NULL,       -- author-claimed (Unix ms)
            canonical_bytes BLOB NOT NULL,
            applied_at INTEGER NOT NULL
        );

        -- Current head path per lineage
        CREATE TABLE heads (
            dataset BLOB PRIMARY KEY,
            path BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Same-author fork evidence
        CREATE TABLE forks (
            dataset BLOB NOT NULL,
            author BLOB NOT NULL,
            parent BLOB NOT NULL,
            entry_id BLOB NOT NULL,
            detected_at INTEGER NOT NULL,
            PRIMARY KEY (dataset, parent, entry_id)
        );

        CREATE INDEX idx_entries_dataset ON entries(dataset, seq);
        CREATE INDEX idx_entries_author ON entries(author);
        CREATE INDEX idx_entries_parent ON entries(parent);
        "#,
    )?;

    Ok(())
}
