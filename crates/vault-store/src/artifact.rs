use serde::{Deserialize, Serialize};
use vault_protocol::ConfigKind;

use crate::ContentHash;

pub const ARTIFACT_SCHEMA: &str = "vault/Artifact@1";

/// Pointer from `(kind, seq)` to a content blob.
///
/// Carries no timestamps: re-running a publish with the same inputs must
/// reproduce the header byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub schema: String,
    pub kind: ConfigKind,
    pub seq: u64,
    pub content_hash: ContentHash,
    pub entry_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub header: ArtifactHeader,
    pub content: Vec<u8>,
}

impl Artifact {
    pub fn new(kind: ConfigKind, seq: u64, content: Vec<u8>, entry_count: u64) -> Self {
        let content_hash = ContentHash::of_bytes(&content);
        Self {
            header: ArtifactHeader {
                schema: ARTIFACT_SCHEMA.to_string(),
                kind,
                seq,
                content_hash,
                entry_count,
            },
            content,
        }
    }

    pub fn kind(&self) -> &ConfigKind {
        &self.header.kind
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    pub fn content_hash(&self) -> ContentHash {
        self.header.content_hash
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOutcome {
    /// False when the blob already existed (unchanged snapshot or retry).
    pub content_written: bool,
    /// False when the header for `(kind, seq)` already existed (retry).
    pub header_written: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub headers_removed: Vec<u64>,
    pub blobs_removed: usize,
}
