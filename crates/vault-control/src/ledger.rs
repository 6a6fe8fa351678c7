//! Per-kind sequence ledger.
//!
//! One row per configuration kind. `requested_seq` is the change-counter
//! high-water mark bumped by business mutations; `published_seq` only ever
//! moves inside [`SequenceLedger::commit_publish`], which is the single path
//! that mints sequence numbers.

use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use thiserror::Error;
use vault_protocol::ConfigKind;
use vault_protocol::api::LedgerHealth;
use vault_store::{ContentHash, StoreError};

use crate::db::{Db, DbError, from_sql_u64, now_ms, to_sql_u64};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("publish of {kind} raced: expected published_seq {expected}, found {actual}")]
    ConcurrentPublish {
        kind: ConfigKind,
        expected: u64,
        actual: u64,
    },
    #[error("refusing to move {kind} from published_seq {current} to {proposed}")]
    NonMonotonic {
        kind: ConfigKind,
        current: u64,
        proposed: u64,
    },
    #[error("artifact write for {kind}@{seq} failed: {source}")]
    Artifact {
        kind: ConfigKind,
        seq: u64,
        #[source]
        source: StoreError,
    },
    #[error("ledger row for {kind} holds an unreadable content hash '{value}'")]
    CorruptHash { kind: ConfigKind, value: String },
    #[error("ledger holds an invalid kind '{value}'")]
    CorruptKind { value: String },
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Db(DbError::Sqlite(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub kind: ConfigKind,
    pub published_seq: u64,
    pub requested_seq: u64,
    pub content_hash: Option<ContentHash>,
    pub entry_count: u64,
    pub updated_at_ms: u64,
}

impl LedgerRow {
    pub fn zero(kind: ConfigKind) -> Self {
        Self {
            kind,
            published_seq: 0,
            requested_seq: 0,
            content_hash: None,
            entry_count: 0,
            updated_at_ms: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.requested_seq > self.published_seq
    }

    pub fn health(&self) -> LedgerHealth {
        LedgerHealth {
            kind: self.kind.clone(),
            published_seq: self.published_seq,
            requested_seq: self.requested_seq,
            has_pending: self.has_pending(),
        }
    }
}

/// Values written by a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishCommit {
    pub expected_published: u64,
    pub new_seq: u64,
    pub content_hash: ContentHash,
    pub entry_count: u64,
}

#[derive(Debug, Clone)]
pub struct SequenceLedger {
    db: Db,
}

const SELECT_COLUMNS: &str =
    "kind, published_seq, requested_seq, content_hash, entry_count, updated_at_ms";

impl SequenceLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create zero rows for kinds that have none yet.
    pub fn ensure_kinds(&self, kinds: &[ConfigKind]) -> Result<(), LedgerError> {
        let conn = self.db.lock()?;
        let now = to_sql_u64(now_ms());
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO sequence_ledger
                 (kind, published_seq, requested_seq, entry_count, updated_at_ms)
             VALUES (?1, 0, 0, 0, ?2)",
        )?;
        for kind in kinds {
            stmt.execute(params![kind.as_str(), now])?;
        }
        Ok(())
    }

    pub fn get(&self, kind: &ConfigKind) -> Result<Option<LedgerRow>, LedgerError> {
        let conn = self.db.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM sequence_ledger WHERE kind = ?1"),
                params![kind.as_str()],
                RawRow::read,
            )
            .optional()?;
        raw.map(RawRow::into_row).transpose()
    }

    /// The row for `kind`, or its zero state when it has never been touched.
    pub fn get_or_zero(&self, kind: &ConfigKind) -> Result<LedgerRow, LedgerError> {
        Ok(self
            .get(kind)?
            .unwrap_or_else(|| LedgerRow::zero(kind.clone())))
    }

    pub fn list(&self) -> Result<Vec<LedgerRow>, LedgerError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM sequence_ledger ORDER BY kind"
        ))?;
        let raws = stmt
            .query_map([], RawRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawRow::into_row).collect()
    }

    /// Record a change request and return the new high-water mark.
    ///
    /// The mark always lands above `published_seq`, so a request arriving
    /// right after a publish is never absorbed by it.
    pub fn request_publish(&self, kind: &ConfigKind) -> Result<u64, LedgerError> {
        let conn = self.db.lock()?;
        let requested: i64 = conn.query_row(
            "INSERT INTO sequence_ledger
                 (kind, published_seq, requested_seq, entry_count, updated_at_ms)
             VALUES (?1, 0, 1, 0, ?2)
             ON CONFLICT(kind) DO UPDATE SET
                 requested_seq = MAX(requested_seq, published_seq) + 1,
                 updated_at_ms = excluded.updated_at_ms
             RETURNING requested_seq",
            params![kind.as_str(), to_sql_u64(now_ms())],
            |row| row.get(0),
        )?;
        Ok(from_sql_u64(requested))
    }

    /// Advance `published_seq` to `commit.new_seq`, running `write_artifact`
    /// inside the same immediate transaction.
    ///
    /// The artifact is durable before the row moves, so no reader sees a
    /// published sequence without its artifact. If the write fails the
    /// transaction rolls back and the row is unchanged.
    pub fn commit_publish<F>(
        &self,
        kind: &ConfigKind,
        commit: PublishCommit,
        write_artifact: F,
    ) -> Result<LedgerRow, LedgerError>
    where
        F: FnOnce() -> Result<(), StoreError>,
    {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<i64> = tx
            .query_row(
                "SELECT published_seq FROM sequence_ledger WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.map(from_sql_u64).unwrap_or_default();
        if current != commit.expected_published {
            return Err(LedgerError::ConcurrentPublish {
                kind: kind.clone(),
                expected: commit.expected_published,
                actual: current,
            });
        }
        if commit.new_seq <= current {
            return Err(LedgerError::NonMonotonic {
                kind: kind.clone(),
                current,
                proposed: commit.new_seq,
            });
        }

        write_artifact().map_err(|source| LedgerError::Artifact {
            kind: kind.clone(),
            seq: commit.new_seq,
            source,
        })?;

        let now = now_ms();
        tx.execute(
            "INSERT INTO sequence_ledger
                 (kind, published_seq, requested_seq, content_hash, entry_count, updated_at_ms)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5)
             ON CONFLICT(kind) DO UPDATE SET
                 published_seq = excluded.published_seq,
                 requested_seq = MAX(requested_seq, excluded.published_seq),
                 content_hash = excluded.content_hash,
                 entry_count = excluded.entry_count,
                 updated_at_ms = excluded.updated_at_ms",
            params![
                kind.as_str(),
                to_sql_u64(commit.new_seq),
                commit.content_hash.to_hex(),
                to_sql_u64(commit.entry_count),
                to_sql_u64(now),
            ],
        )?;
        let raw = tx.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM sequence_ledger WHERE kind = ?1"),
            params![kind.as_str()],
            RawRow::read,
        )?;
        tx.commit()?;
        raw.into_row()
    }

    /// Zero every row. Used only by drift recovery, after artifact storage
    /// has been cleared.
    pub fn reset_all(&self) -> Result<usize, LedgerError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE sequence_ledger
             SET published_seq = 0, requested_seq = 0, content_hash = NULL,
                 entry_count = 0, updated_at_ms = ?1",
            params![to_sql_u64(now_ms())],
        )?;
        Ok(changed)
    }
}

struct RawRow {
    kind: String,
    published_seq: i64,
    requested_seq: i64,
    content_hash: Option<String>,
    entry_count: i64,
    updated_at_ms: i64,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            kind: row.get(0)?,
            published_seq: row.get(1)?,
            requested_seq: row.get(2)?,
            content_hash: row.get(3)?,
            entry_count: row.get(4)?,
            updated_at_ms: row.get(5)?,
        })
    }

    fn into_row(self) -> Result<LedgerRow, LedgerError> {
        let kind = ConfigKind::new(&self.kind)
            .map_err(|_| LedgerError::CorruptKind { value: self.kind })?;
        let content_hash = match self.content_hash {
            Some(value) => Some(ContentHash::from_hex_str(&value).map_err(|_| {
                LedgerError::CorruptHash {
                    kind: kind.clone(),
                    value,
                }
            })?),
            None => None,
        };
        Ok(LedgerRow {
            kind,
            published_seq: from_sql_u64(self.published_seq),
            requested_seq: from_sql_u64(self.requested_seq),
            content_hash,
            entry_count: from_sql_u64(self.entry_count),
            updated_at_ms: from_sql_u64(self.updated_at_ms),
        })
    }
}
