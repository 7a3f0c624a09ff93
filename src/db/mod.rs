//! Persistence layer.
//!
//! A thin wrapper over SQLite owning the tables this core persists:
//! `jobs`, `standing_rules`, `plugins`, `llm_calls`, and the daily cost
//! aggregate. Statements are short and run under one connection mutex;
//! transactional boundaries are at the statement level and callers never
//! see SQL.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::types::{Error, Result};

/// Shared handle to the core's database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    source_type TEXT NOT NULL,
    source_message_id TEXT,
    metadata_json TEXT,
    plan_json TEXT,
    validation_json TEXT,
    result_json TEXT,
    error_json TEXT,
    lease_owner TEXT,
    lease_expires_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT,
    approval_nonce TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_queue
    ON jobs (status, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_dedup
    ON jobs (idempotency_key, created_at);

CREATE TABLE IF NOT EXISTS standing_rules (
    id TEXT PRIMARY KEY,
    action_pattern TEXT NOT NULL,
    scope TEXT NOT NULL,
    verdict TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    created_by TEXT NOT NULL,
    approval_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_standing_rules_recency
    ON standing_rules (created_at DESC);

CREATE TABLE IF NOT EXISTS plugins (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    manifest_json TEXT NOT NULL,
    origin TEXT NOT NULL,
    draft INTEGER NOT NULL DEFAULT 0,
    installed_at TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    config_json TEXT,
    signature TEXT,
    checksum TEXT NOT NULL,
    package_path TEXT
);

CREATE TABLE IF NOT EXISTS llm_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT,
    component TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cached_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL,
    duration_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_llm_calls_job ON llm_calls (job_id);

CREATE TABLE IF NOT EXISTS cost_daily (
    day TEXT PRIMARY KEY,
    total_usd REAL NOT NULL,
    call_count INTEGER NOT NULL
);
"#;

impl Database {
    /// Open (or create) the database file and initialize the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // WAL improves concurrency between workers and the recovery sweep.
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .ok();
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Idempotent schema creation.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run a closure against the locked connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn).map_err(Error::from)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("database connection lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();
        db.init_schema().unwrap();
    }

    #[test]
    fn test_owned_tables_exist() {
        let db = Database::open_in_memory().unwrap();
        for table in ["jobs", "standing_rules", "plugins", "llm_calls", "cost_daily"] {
            let count: i64 = db
                .with_conn(|conn| {
                    conn.query_row(
                        "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                        [table],
                        |row| row.get(0),
                    )
                })
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cost_daily (day, total_usd, call_count) VALUES ('2026-01-01', 1.5, 3)",
                [],
            )
        })
        .unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        let total: f64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT total_usd FROM cost_daily WHERE day='2026-01-01'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert!((total - 1.5).abs() < f64::EPSILON);
    }
}
