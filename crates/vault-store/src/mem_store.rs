use crate::{
    Artifact, ArtifactHeader, ArtifactStore, ContentHash, PruneReport, PutOutcome, StoreError,
    StoreResult,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, RwLock},
};
use vault_protocol::ConfigKind;

#[derive(Default)]
struct Inner {
    blobs: HashMap<ContentHash, Vec<u8>>,
    headers: BTreeMap<(ConfigKind, u64), ArtifactHeader>,
}

#[derive(Clone, Default)]
pub struct MemArtifactStore {
    inner: Arc<RwLock<Inner>>,
}

impl std::fmt::Debug for MemArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("MemArtifactStore")
            .field("blobs", &inner.blobs.len())
            .field("headers", &inner.headers.len())
            .finish()
    }
}

impl MemArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.inner.read().unwrap().blobs.len()
    }
}

impl ArtifactStore for MemArtifactStore {
    fn put_artifact(&self, artifact: &Artifact) -> StoreResult<PutOutcome> {
        let header = &artifact.header;
        let actual = ContentHash::of_bytes(&artifact.content);
        if actual != header.content_hash {
            return Err(StoreError::HashMismatch {
                expected: header.content_hash,
                actual,
            });
        }
        let mut inner = self.inner.write().unwrap();
        let key = (header.kind.clone(), header.seq);
        if let Some(existing) = inner.headers.get(&key) {
            if existing.content_hash != header.content_hash {
                return Err(StoreError::ArtifactConflict {
                    kind: header.kind.clone(),
                    seq: header.seq,
                    existing: existing.content_hash,
                    incoming: header.content_hash,
                });
            }
        }
        let content_written = !inner.blobs.contains_key(&header.content_hash);
        if content_written {
            inner
                .blobs
                .insert(header.content_hash, artifact.content.clone());
        }
        let header_written = !inner.headers.contains_key(&key);
        if header_written {
            inner.headers.insert(key, header.clone());
        }
        Ok(PutOutcome {
            content_written,
            header_written,
        })
    }

    fn stage_content(&self, content: &[u8]) -> StoreResult<ContentHash> {
        let hash = ContentHash::of_bytes(content);
        self.inner
            .write()
            .unwrap()
            .blobs
            .entry(hash)
            .or_insert_with(|| content.to_vec());
        Ok(hash)
    }

    fn get_artifact(&self, kind: &ConfigKind, seq: u64) -> StoreResult<Option<Artifact>> {
        let inner = self.inner.read().unwrap();
        let Some(header) = inner.headers.get(&(kind.clone(), seq)) else {
            return Ok(None);
        };
        let content = inner
            .blobs
            .get(&header.content_hash)
            .cloned()
            .ok_or_else(|| StoreError::MissingContent {
                kind: kind.clone(),
                seq,
                hash: header.content_hash,
            })?;
        Ok(Some(Artifact {
            header: header.clone(),
            content,
        }))
    }

    fn get_header(&self, kind: &ConfigKind, seq: u64) -> StoreResult<Option<ArtifactHeader>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.headers.get(&(kind.clone(), seq)).cloned())
    }

    fn list_seqs(&self, kind: &ConfigKind) -> StoreResult<Vec<u64>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .headers
            .keys()
            .filter(|(k, _)| k == kind)
            .map(|(_, seq)| *seq)
            .collect())
    }

    fn has_content(&self, hash: ContentHash) -> StoreResult<bool> {
        Ok(self.inner.read().unwrap().blobs.contains_key(&hash))
    }

    fn prune(&self, kind: &ConfigKind, keep: usize) -> StoreResult<PruneReport> {
        let keep = keep.max(1);
        let seqs = self.list_seqs(kind)?;
        let mut inner = self.inner.write().unwrap();
        let mut report = PruneReport::default();
        if seqs.len() > keep {
            for seq in &seqs[..seqs.len() - keep] {
                inner.headers.remove(&(kind.clone(), *seq));
                report.headers_removed.push(*seq);
            }
        }
        let referenced: BTreeSet<ContentHash> =
            inner.headers.values().map(|h| h.content_hash).collect();
        let before = inner.blobs.len();
        inner.blobs.retain(|hash, _| referenced.contains(hash));
        report.blobs_removed = before - inner.blobs.len();
        Ok(report)
    }

    fn clear(&self) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.blobs.clear();
        inner.headers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_header_tracks_highest_seq() {
        let store = MemArtifactStore::new();
        let kind = ConfigKind::new("keyserver-clients").unwrap();
        for seq in [2, 9, 4] {
            store
                .put_artifact(&Artifact::new(kind.clone(), seq, vec![seq as u8], 1))
                .expect("put");
        }
        assert_eq!(store.list_seqs(&kind).unwrap(), vec![2, 4, 9]);
        assert_eq!(store.latest_header(&kind).unwrap().unwrap().seq, 9);
    }

    #[test]
    fn conflicting_rewrite_is_rejected() {
        let store = MemArtifactStore::new();
        let kind = ConfigKind::new("proxy-auth").unwrap();
        store
            .put_artifact(&Artifact::new(kind.clone(), 1, b"a".to_vec(), 1))
            .expect("put");
        let err = store
            .put_artifact(&Artifact::new(kind, 1, b"b".to_vec(), 1))
            .expect_err("conflict");
        assert!(matches!(err, StoreError::ArtifactConflict { seq: 1, .. }));
    }
}
