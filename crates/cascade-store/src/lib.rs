//! SQLite-backed implementations of every cascade store trait.
//!
//! One [`SqliteStore`] holds all tables so change approval can commit the
//! master field write and the review transition in a single transaction.

mod changes;
mod executions;
mod fields;
mod runs;
mod shared_cache;
mod workflows;

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::types::Type;
use rusqlite::Connection;
use tracing::debug;

use cascade_core::error::{CascadeError, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS entity_runs (
        run_id TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        start_node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        progress_json TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_entity
        ON entity_runs(entity_id, created_at DESC);

    CREATE INDEX IF NOT EXISTS idx_runs_status
        ON entity_runs(status, updated_at);

    CREATE TABLE IF NOT EXISTS node_executions (
        entity_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        output_json TEXT,
        content_hash TEXT,
        version INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (entity_id, workflow_id, node_id)
    );

    CREATE INDEX IF NOT EXISTS idx_exec_node
        ON node_executions(workflow_id, node_id);

    CREATE TABLE IF NOT EXISTS master_fields (
        entity_id TEXT NOT NULL,
        domain TEXT NOT NULL,
        field_key TEXT NOT NULL,
        value_json TEXT NOT NULL,
        require_approval_create INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (entity_id, domain, field_key)
    );

    CREATE TABLE IF NOT EXISTS shared_caches (
        cache_id TEXT PRIMARY KEY,
        name TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS shared_cache_data (
        cache_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        data_json TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        version INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (cache_id, entity_id, workflow_id, node_id)
    );

    CREATE TABLE IF NOT EXISTS ssot_pending_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        change_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        target_domain TEXT NOT NULL,
        target_path TEXT NOT NULL,
        action TEXT NOT NULL,
        proposed_json TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        resolved_at TEXT,
        resolved_by TEXT
    );

    DROP INDEX IF EXISTS idx_changes_one_pending;
    CREATE UNIQUE INDEX IF NOT EXISTS idx_changes_one_pending_per_entity
        ON ssot_pending_changes(entity_id, node_id, change_id) WHERE status = 'pending';

    CREATE INDEX IF NOT EXISTS idx_changes_status
        ON ssot_pending_changes(status, created_at);

    CREATE TABLE IF NOT EXISTS workflows (
        workflow_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        graph_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );";

/// SQLite store for runs, execution cache, master fields, shared caches,
/// pending changes and workflow definitions.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CascadeError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets the reaper and a CLI read while a cascade writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CascadeError::Database(e.to_string()))
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> CascadeError {
    CascadeError::Database(e.to_string())
}

/// Parse a text column into a string-backed enum inside a row mapper.
pub(crate) fn parse_col<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = CascadeError>,
{
    T::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse a JSON text column inside a row mapper.
pub(crate) fn json_col(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
