//! Deduplicated operator notifications.
//!
//! At most one unacknowledged record exists per `(code, category)`. Repeating
//! a condition with the same message is a no-op; a changed message rewrites
//! the open record in place.

use rusqlite::{OptionalExtension, params};
use vault_protocol::api::{NotificationView, Severity};

use crate::db::{Db, DbError, from_sql_u64, now_ms, to_sql_u64};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Inserted(i64),
    /// An open record with the same message already exists.
    Duplicate(i64),
    /// The open record's message changed and was rewritten.
    Updated(i64),
}

impl NotifyOutcome {
    pub fn id(&self) -> i64 {
        match self {
            NotifyOutcome::Inserted(id)
            | NotifyOutcome::Duplicate(id)
            | NotifyOutcome::Updated(id) => *id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    db: Db,
}

impl Notifier {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn notify(
        &self,
        severity: Severity,
        category: &str,
        code: &str,
        message: &str,
        details: serde_json::Value,
    ) -> Result<NotifyOutcome, DbError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let now = to_sql_u64(now_ms());
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, message FROM notifications
                 WHERE code = ?1 AND category = ?2 AND acknowledged = 0
                 ORDER BY id DESC LIMIT 1",
                params![code, category],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            Some((id, current)) if current == message => NotifyOutcome::Duplicate(id),
            Some((id, _)) => {
                tx.execute(
                    "UPDATE notifications
                     SET message = ?1, details = ?2, severity = ?3, updated_at_ms = ?4
                     WHERE id = ?5",
                    params![message, details.to_string(), severity.as_str(), now, id],
                )?;
                NotifyOutcome::Updated(id)
            }
            None => {
                tx.execute(
                    "INSERT INTO notifications
                         (severity, category, code, message, details, created_at_ms, updated_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        severity.as_str(),
                        category,
                        code,
                        message,
                        details.to_string(),
                        now
                    ],
                )?;
                NotifyOutcome::Inserted(tx.last_insert_rowid())
            }
        };
        tx.commit()?;
        match outcome {
            NotifyOutcome::Duplicate(_) => {
                tracing::debug!(code, category, "notification unchanged")
            }
            _ => tracing::info!(code, category, severity = severity.as_str(), "{message}"),
        }
        Ok(outcome)
    }

    /// Acknowledge the open record for a condition that has cleared.
    pub fn resolve(&self, category: &str, code: &str) -> Result<bool, DbError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE notifications SET acknowledged = 1, updated_at_ms = ?1
             WHERE code = ?2 AND category = ?3 AND acknowledged = 0",
            params![to_sql_u64(now_ms()), code, category],
        )?;
        Ok(changed > 0)
    }

    pub fn acknowledge(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE notifications SET acknowledged = 1, updated_at_ms = ?1
             WHERE id = ?2 AND acknowledged = 0",
            params![to_sql_u64(now_ms()), id],
        )?;
        Ok(changed > 0)
    }

    /// Delete acknowledged records last touched more than `max_age_ms` ago.
    /// Open records are kept regardless of age.
    pub fn prune_acknowledged(&self, max_age_ms: u64) -> Result<usize, DbError> {
        let cutoff = now_ms().saturating_sub(max_age_ms);
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM notifications WHERE acknowledged = 1 AND updated_at_ms < ?1",
            params![to_sql_u64(cutoff)],
        )?;
        Ok(removed)
    }

    /// Newest first.
    pub fn list(&self, include_acknowledged: bool) -> Result<Vec<NotificationView>, DbError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, severity, category, code, message, details,
                    created_at_ms, updated_at_ms, acknowledged
             FROM notifications
             WHERE ?1 OR acknowledged = 0
             ORDER BY updated_at_ms DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![include_acknowledged], |row| {
            let severity: String = row.get(1)?;
            let details: String = row.get(5)?;
            Ok(NotificationView {
                id: row.get(0)?,
                severity: severity.parse().unwrap_or(Severity::Warning),
                category: row.get(2)?,
                code: row.get(3)?,
                message: row.get(4)?,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                created_at_ms: from_sql_u64(row.get(6)?),
                updated_at_ms: from_sql_u64(row.get(7)?),
                acknowledged: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
