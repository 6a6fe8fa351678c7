//! SQLite handle shared by the ledger, fleet status and notification tables.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sequence_ledger (
    kind           TEXT PRIMARY KEY,
    published_seq  INTEGER NOT NULL DEFAULT 0,
    requested_seq  INTEGER NOT NULL DEFAULT 0,
    content_hash   TEXT,
    entry_count    INTEGER NOT NULL DEFAULT 0,
    updated_at_ms  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fleet_nodes (
    id                 TEXT PRIMARY KEY,
    name               TEXT NOT NULL,
    host               TEXT NOT NULL,
    region             TEXT NOT NULL,
    health_url         TEXT NOT NULL,
    last_attempt_at_ms INTEGER,
    last_seen_at_ms    INTEGER,
    last_poll_error    TEXT
);

CREATE TABLE IF NOT EXISTS fleet_status (
    node_id                  TEXT NOT NULL,
    kind                     TEXT NOT NULL,
    applied_seq              INTEGER,
    applied_at_ms            INTEGER,
    processing_seq           INTEGER,
    processing_started_at_ms INTEGER,
    last_error               TEXT,
    entry_count              INTEGER NOT NULL DEFAULT 0,
    last_seen_at_ms          INTEGER NOT NULL,
    PRIMARY KEY (node_id, kind)
);

CREATE TABLE IF NOT EXISTS notifications (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    severity        TEXT NOT NULL,
    category        TEXT NOT NULL,
    code            TEXT NOT NULL,
    message         TEXT NOT NULL,
    details         TEXT NOT NULL,
    created_at_ms   INTEGER NOT NULL,
    updated_at_ms   INTEGER NOT NULL,
    acknowledged    INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS notifications_open
    ON notifications (code, category) WHERE acknowledged = 0;
"#;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Cloneable handle over one serialized connection.
#[derive(Debug, Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection. Never hold the guard across an `.await`.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// SQLite stores integers as i64; sequence numbers never approach the sign bit.
pub(crate) fn to_sql_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.db");
        Db::open(&path).unwrap();
        let db = Db::open(&path).unwrap();
        let conn = db.lock().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('sequence_ledger', 'fleet_nodes', 'fleet_status', 'notifications')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
