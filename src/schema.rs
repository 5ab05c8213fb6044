//! # SQLite Schema
//!
//! Database layout and connection handling. The store keeps four tables:
//!
//! ```text
//! payloads                         last_block
//! ┌────────────────────┐           ┌──────────────────┐
//! │ id (PK, rowid)     │           │ id = 0 (PK)      │
//! │ entity_key UNIQUE  │           │ block            │
//! │ payload BLOB       │           └──────────────────┘
//! │ content_type       │
//! │ string_attributes  │           string_attribute_bitmaps
//! │ numeric_attributes │           ┌──────────────────────────┐
//! └────────────────────┘           │ (name, value) PK         │
//!                                  │ bitmap BLOB              │
//! numeric_attribute_bitmaps        └──────────────────────────┘
//! ┌──────────────────────────┐
//! │ (name, value) PK         │     one roaring bitmap per distinct
//! │ bitmap BLOB              │     (attribute, value) pair
//! └──────────────────────────┘
//! ```
//!
//! ## Connections
//!
//! One writer, many readers, WAL journal mode. The writer opens
//! read-write-create with `BEGIN IMMEDIATE` transactions; readers open
//! read-only with `query_only` set, so a stray write on a read path fails
//! loudly. Long-lived read transactions on dedicated reader connections are
//! what pins historic snapshots (see the pool module).
//!
//! ## Internal ids
//!
//! `payloads.id` is the rowid. It is stable for the lifetime of a row - an
//! upsert on an existing `entity_key` updates in place - and may be reused
//! by SQLite after a delete, which is exactly the contract the bitmaps need.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};

use crate::error::{Error, Result};

/// Current schema version, stored in `PRAGMA user_version`. A database with
/// a different non-zero version is rejected rather than migrated.
const SCHEMA_VERSION: i32 = 1;

/// SQLite busy timeout, matching the 11 s the writer and readers tolerate
/// before surfacing a lock error.
const BUSY_TIMEOUT_MS: u64 = 11_000;

/// Page cache size, in pages.
const CACHE_SIZE_PAGES: i64 = 65_536;

// =============================================================================
// DDL
// =============================================================================

/// One row per live entity. `id` is the internal id every bitmap refers to.
const CREATE_PAYLOADS: &str = r#"
CREATE TABLE IF NOT EXISTS payloads (
    id                 INTEGER PRIMARY KEY,
    entity_key         BLOB NOT NULL UNIQUE,
    payload            BLOB NOT NULL,
    content_type       TEXT NOT NULL,
    string_attributes  BLOB NOT NULL,
    numeric_attributes BLOB NOT NULL
)
"#;

/// Single-row table holding the greatest committed block number.
const CREATE_LAST_BLOCK: &str = r#"
CREATE TABLE IF NOT EXISTS last_block (
    id    INTEGER PRIMARY KEY CHECK (id = 0),
    block INTEGER NOT NULL
)
"#;

/// Roaring bitmap per distinct (string attribute, value) pair. No row ever
/// holds an empty bitmap; emptiness is expressed by deleting the row.
const CREATE_STRING_BITMAPS: &str = r#"
CREATE TABLE IF NOT EXISTS string_attribute_bitmaps (
    name   TEXT NOT NULL,
    value  TEXT NOT NULL,
    bitmap BLOB NOT NULL,
    PRIMARY KEY (name, value)
)
"#;

/// Roaring bitmap per distinct (numeric attribute, value) pair.
const CREATE_NUMERIC_BITMAPS: &str = r#"
CREATE TABLE IF NOT EXISTS numeric_attribute_bitmaps (
    name   TEXT NOT NULL,
    value  INTEGER NOT NULL,
    bitmap BLOB NOT NULL,
    PRIMARY KEY (name, value)
)
"#;

// =============================================================================
// Database
// =============================================================================

/// A handle to an initialized database file. Cheap to clone; connections are
/// opened on demand so the writer, the live readers, and the snapshot pool
/// can each hold their own.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Opens (creating if needed) the database at `path`, applies the
    /// schema, and verifies the schema version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| {
                    Error::Schema(format!("failed to create {}: {e}", dir.display()))
                })?;
            }
        }

        let db = Self { path };
        let conn = db.write_connection()?;
        db.init_schema(&conn)?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the writer connection: read-write-create, immediate-lock
    /// transactions are taken by the applier.
    pub fn write_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        // auto_vacuum must be configured before the first table is created.
        conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL")?;
        apply_common_pragmas(&conn)?;
        Ok(conn)
    }

    /// Opens a reader connection: read-only flags plus `query_only`, WAL
    /// snapshot isolation.
    pub fn read_connection(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_common_pragmas(&conn)?;
        conn.execute_batch("PRAGMA query_only = ON")?;
        Ok(conn)
    }

    fn init_schema(&self, conn: &Connection) -> Result<()> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(CREATE_PAYLOADS)?;
                conn.execute_batch(CREATE_LAST_BLOCK)?;
                conn.execute_batch(CREATE_STRING_BITMAPS)?;
                conn.execute_batch(CREATE_NUMERIC_BITMAPS)?;
                conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
                Ok(())
            }
            SCHEMA_VERSION => Ok(()),
            other => Err(Error::Schema(format!(
                "unsupported schema version {other}, expected {SCHEMA_VERSION}"
            ))),
        }
    }
}

fn apply_common_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    conn.execute_batch(&format!("PRAGMA cache_size = {CACHE_SIZE_PAGES}"))?;
    Ok(())
}
