//! Versioned, content-addressed artifact storage plus filesystem and in-memory backends.
//!
//! An artifact is the snapshot of one configuration kind at one sequence
//! number. Its content lives in a blob addressed by SHA-256; a small header
//! per `(kind, seq)` points at that blob. Headers and blobs are written once
//! and never mutated, so retrying a write with the same inputs is a no-op.

mod artifact;
mod fs_store;
pub mod hash;
mod mem_store;

pub use artifact::{ARTIFACT_SCHEMA, Artifact, ArtifactHeader, PruneReport, PutOutcome};
pub use fs_store::FsArtifactStore;
pub use hash::{ContentHash, HashParseError, to_canonical_cbor};
pub use mem_store::MemArtifactStore;

use std::{io, path::PathBuf, sync::Arc};

use vault_protocol::ConfigKind;

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynArtifactStore = Arc<dyn ArtifactStore>;

/// Trait implemented by all artifact stores.
pub trait ArtifactStore: Send + Sync {
    /// Write an artifact. Idempotent for identical content; a different content
    /// hash under an existing `(kind, seq)` is an [`StoreError::ArtifactConflict`].
    fn put_artifact(&self, artifact: &Artifact) -> StoreResult<PutOutcome>;

    /// Write content ahead of its header and return its hash. Nothing
    /// references it yet, so a prune may sweep it; `put_artifact` writes it
    /// again in that case.
    fn stage_content(&self, content: &[u8]) -> StoreResult<ContentHash>;

    fn get_artifact(&self, kind: &ConfigKind, seq: u64) -> StoreResult<Option<Artifact>>;

    fn get_header(&self, kind: &ConfigKind, seq: u64) -> StoreResult<Option<ArtifactHeader>>;

    /// Retained sequence numbers for `kind`, ascending.
    fn list_seqs(&self, kind: &ConfigKind) -> StoreResult<Vec<u64>>;

    fn has_content(&self, hash: ContentHash) -> StoreResult<bool>;

    /// Keep the newest `keep` headers of `kind` (at least one) and drop content
    /// no retained header of any kind references.
    fn prune(&self, kind: &ConfigKind, keep: usize) -> StoreResult<PruneReport>;

    /// Remove every header and blob. Only the operator service calls this.
    fn clear(&self) -> StoreResult<()>;

    fn latest_header(&self, kind: &ConfigKind) -> StoreResult<Option<ArtifactHeader>> {
        match self.list_seqs(kind)?.last() {
            Some(seq) => self.get_header(kind, *seq),
            None => Ok(None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error(
        "artifact {kind}@{seq} already exists with content {existing}, refusing to overwrite with {incoming}"
    )]
    ArtifactConflict {
        kind: ConfigKind,
        seq: u64,
        existing: ContentHash,
        incoming: ContentHash,
    },
    #[error("artifact {kind}@{seq} references missing content {hash}")]
    MissingContent {
        kind: ConfigKind,
        seq: u64,
        hash: ContentHash,
    },
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}
