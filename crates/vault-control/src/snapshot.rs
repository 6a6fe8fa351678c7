//! Snapshot builder contract and the bundled JSON directory builder.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vault_protocol::ConfigKind;

/// Authoritative content of one kind at one moment.
///
/// Entries are keyed and ordered, so canonical encoding does not depend on
/// how the builder assembled them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: BTreeMap<String, serde_json::Value>,
}

impl Snapshot {
    pub fn new(entries: BTreeMap<String, serde_json::Value>) -> Self {
        Self { entries }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot source unavailable: {0}")]
    Unavailable(String),
}

/// Assembles the current authoritative state for a kind from upstream data.
#[async_trait]
pub trait SnapshotBuilder: Send + Sync {
    async fn build(&self, kind: &ConfigKind) -> Result<Snapshot, SnapshotError>;

    /// Kinds whose content depends on `tenant`. Builders that cannot tell
    /// report every kind.
    async fn kinds_for_tenant(
        &self,
        _tenant: &str,
        all_kinds: &[ConfigKind],
    ) -> Result<Vec<ConfigKind>, SnapshotError> {
        Ok(all_kinds.to_vec())
    }
}

/// Reads `<root>/<kind>.json`, a JSON object of entries. A missing file is an
/// empty snapshot.
#[derive(Debug, Clone)]
pub struct JsonDirSnapshotBuilder {
    root: PathBuf,
}

impl JsonDirSnapshotBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, kind: &ConfigKind) -> PathBuf {
        self.root.join(format!("{kind}.json"))
    }

    fn read(path: &Path) -> Result<Snapshot, SnapshotError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Snapshot::default()),
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let entries = serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Snapshot { entries })
    }
}

#[async_trait]
impl SnapshotBuilder for JsonDirSnapshotBuilder {
    async fn build(&self, kind: &ConfigKind) -> Result<Snapshot, SnapshotError> {
        let path = self.path_for(kind);
        tokio::task::spawn_blocking(move || Self::read(&path))
            .await
            .map_err(|e| SnapshotError::Unavailable(e.to_string()))?
    }
}
