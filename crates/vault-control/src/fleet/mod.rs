//! Known fleet nodes and their last-polled per-kind status.

pub mod poller;

use std::path::Path;

use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};
use vault_protocol::{ConfigKind, KindHealth};

use crate::db::{Db, DbError, from_sql_u64, to_sql_u64};

/// A remote process that applies artifacts and self-reports its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetNode {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub region: String,
    pub health_url: String,
}

/// JSON file listing the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetManifest {
    pub nodes: Vec<FleetNode>,
}

impl FleetManifest {
    pub fn load(path: &Path) -> Result<Self, FleetManifestError> {
        let bytes = std::fs::read(path).map_err(|source| FleetManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Self =
            serde_json::from_slice(&bytes).map_err(|source| FleetManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let mut seen = std::collections::BTreeSet::new();
        for node in &manifest.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(FleetManifestError::DuplicateNode(node.id.clone()));
            }
        }
        Ok(manifest)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FleetManifestError {
    #[error("reading fleet manifest {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing fleet manifest {path:?}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("fleet manifest lists node '{0}' twice")]
    DuplicateNode(String),
}

/// One `(node, kind)` status as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetStatusRow {
    pub node_id: String,
    pub kind: ConfigKind,
    pub applied_seq: Option<u64>,
    pub applied_at_ms: Option<u64>,
    pub processing_seq: Option<u64>,
    pub processing_started_at_ms: Option<u64>,
    pub last_error: Option<String>,
    pub entry_count: u64,
    pub last_seen_at_ms: u64,
}

impl FleetStatusRow {
    pub fn from_health(
        node_id: &str,
        kind: ConfigKind,
        health: &KindHealth,
        seen_at_ms: u64,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            kind,
            applied_seq: health.applied_seq(),
            applied_at_ms: health.applied.map(|a| a.at_ms),
            processing_seq: health.processing_seq(),
            processing_started_at_ms: health
                .processing
                .as_ref()
                .filter(|p| p.error.is_none())
                .map(|p| p.started_at_ms),
            last_error: health.last_error().map(str::to_string),
            entry_count: health.entries,
            last_seen_at_ms: seen_at_ms,
        }
    }
}

/// Node registry row plus poll bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub node: FleetNode,
    pub last_attempt_at_ms: Option<u64>,
    pub last_seen_at_ms: Option<u64>,
    pub last_poll_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FleetStore {
    db: Db,
}

impl FleetStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Make the registry match `nodes`. Nodes no longer listed are removed with
    /// their status rows; poll bookkeeping of the others is kept.
    pub fn sync_nodes(&self, nodes: &[FleetNode]) -> Result<(), DbError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let existing: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM fleet_nodes")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        for id in existing {
            if !nodes.iter().any(|n| n.id == id) {
                tx.execute("DELETE FROM fleet_status WHERE node_id = ?1", params![id])?;
                tx.execute("DELETE FROM fleet_nodes WHERE id = ?1", params![id])?;
            }
        }
        for node in nodes {
            tx.execute(
                "INSERT INTO fleet_nodes (id, name, host, region, health_url)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name, host = excluded.host,
                     region = excluded.region, health_url = excluded.health_url",
                params![node.id, node.name, node.host, node.region, node.health_url],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn nodes(&self) -> Result<Vec<NodeRecord>, DbError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, host, region, health_url,
                    last_attempt_at_ms, last_seen_at_ms, last_poll_error
             FROM fleet_nodes ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(NodeRecord {
                node: FleetNode {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    host: row.get(2)?,
                    region: row.get(3)?,
                    health_url: row.get(4)?,
                },
                last_attempt_at_ms: row.get::<_, Option<i64>>(5)?.map(from_sql_u64),
                last_seen_at_ms: row.get::<_, Option<i64>>(6)?.map(from_sql_u64),
                last_poll_error: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Record a poll attempt. `error` is `None` on success, which also
    /// refreshes the node's last-seen time.
    pub fn record_attempt(
        &self,
        node_id: &str,
        at_ms: u64,
        error: Option<&str>,
    ) -> Result<(), DbError> {
        let conn = self.db.lock()?;
        match error {
            None => conn.execute(
                "UPDATE fleet_nodes
                 SET last_attempt_at_ms = ?1, last_seen_at_ms = ?1, last_poll_error = NULL
                 WHERE id = ?2",
                params![to_sql_u64(at_ms), node_id],
            )?,
            Some(message) => conn.execute(
                "UPDATE fleet_nodes SET last_attempt_at_ms = ?1, last_poll_error = ?2
                 WHERE id = ?3",
                params![to_sql_u64(at_ms), message, node_id],
            )?,
        };
        Ok(())
    }

    pub fn upsert_status(&self, row: &FleetStatusRow) -> Result<(), DbError> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO fleet_status
                 (node_id, kind, applied_seq, applied_at_ms, processing_seq,
                  processing_started_at_ms, last_error, entry_count, last_seen_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(node_id, kind) DO UPDATE SET
                 applied_seq = excluded.applied_seq,
                 applied_at_ms = excluded.applied_at_ms,
                 processing_seq = excluded.processing_seq,
                 processing_started_at_ms = excluded.processing_started_at_ms,
                 last_error = excluded.last_error,
                 entry_count = excluded.entry_count,
                 last_seen_at_ms = excluded.last_seen_at_ms",
            params![
                row.node_id,
                row.kind.as_str(),
                row.applied_seq.map(to_sql_u64),
                row.applied_at_ms.map(to_sql_u64),
                row.processing_seq.map(to_sql_u64),
                row.processing_started_at_ms.map(to_sql_u64),
                row.last_error,
                to_sql_u64(row.entry_count),
                to_sql_u64(row.last_seen_at_ms),
            ],
        )?;
        Ok(())
    }

    pub fn status_rows(&self) -> Result<Vec<FleetStatusRow>, DbError> {
        self.query_status("ORDER BY node_id, kind", None)
    }

    pub fn status_rows_for(&self, kind: &ConfigKind) -> Result<Vec<FleetStatusRow>, DbError> {
        self.query_status("WHERE kind = ?1 ORDER BY node_id", Some(kind.as_str()))
    }

    fn query_status(&self, tail: &str, kind: Option<&str>) -> Result<Vec<FleetStatusRow>, DbError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT node_id, kind, applied_seq, applied_at_ms, processing_seq,
                    processing_started_at_ms, last_error, entry_count, last_seen_at_ms
             FROM fleet_status {tail}"
        ))?;
        let raws = match kind {
            Some(kind) => stmt
                .query_map(params![kind], read_status)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], read_status)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        // Rows with a kind name that no longer parses are skipped.
        Ok(raws.into_iter().flatten().collect())
    }

    /// Drop every status row. Part of drift recovery.
    pub fn clear_status(&self) -> Result<usize, DbError> {
        let conn = self.db.lock()?;
        Ok(conn.execute("DELETE FROM fleet_status", [])?)
    }
}

fn read_status(row: &Row<'_>) -> rusqlite::Result<Option<FleetStatusRow>> {
    let kind: String = row.get(1)?;
    let Ok(kind) = ConfigKind::new(kind) else {
        return Ok(None);
    };
    Ok(Some(FleetStatusRow {
        node_id: row.get(0)?,
        kind,
        applied_seq: row.get::<_, Option<i64>>(2)?.map(from_sql_u64),
        applied_at_ms: row.get::<_, Option<i64>>(3)?.map(from_sql_u64),
        processing_seq: row.get::<_, Option<i64>>(4)?.map(from_sql_u64),
        processing_started_at_ms: row.get::<_, Option<i64>>(5)?.map(from_sql_u64),
        last_error: row.get(6)?,
        entry_count: from_sql_u64(row.get(7)?),
        last_seen_at_ms: from_sql_u64(row.get(8)?),
    }))
}
