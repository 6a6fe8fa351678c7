use crate::{
    Artifact, ArtifactHeader, ArtifactStore, ContentHash, PruneReport, PutOutcome, StoreError,
    StoreResult, io_error, to_canonical_cbor,
};
use std::{
    collections::BTreeSet,
    fmt, fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use vault_protocol::ConfigKind;

const HEADER_EXT: &str = "cbor";

/// Filesystem-backed store rooted at `<root>`:
///
/// ```text
/// <root>/blobs/sha256/<hex>          content, canonical CBOR
/// <root>/kinds/<kind>/<seq>.cbor     header, seq zero-padded to 20 digits
/// ```
///
/// Header writes, pruning and clearing serialize on one lock, so a prune
/// never sweeps content whose header is being written for another kind.
#[derive(Clone)]
pub struct FsArtifactStore {
    blobs_dir: PathBuf,
    kinds_dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl fmt::Debug for FsArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsArtifactStore")
            .field("blobs_dir", &self.blobs_dir)
            .field("kinds_dir", &self.kinds_dir)
            .finish()
    }
}

impl FsArtifactStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        let blobs_dir = root.join("blobs").join("sha256");
        let kinds_dir = root.join("kinds");
        fs::create_dir_all(&blobs_dir).map_err(|e| io_error(&blobs_dir, e))?;
        fs::create_dir_all(&kinds_dir).map_err(|e| io_error(&kinds_dir, e))?;
        Ok(Self {
            blobs_dir,
            kinds_dir,
            lock: Arc::new(Mutex::new(())),
        })
    }

    fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `bytes` to `path` unless it already exists. The file appears
    /// atomically; readers never see a partial write.
    fn write_once(path: &Path, bytes: &[u8]) -> StoreResult<bool> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        if path.exists() {
            return Ok(false);
        }
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| io_error(parent, e))?;
        tmp.write_all(bytes).map_err(|e| io_error(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| io_error(tmp.path(), e))?;
        match tmp.persist_noclobber(path) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(io_error(path, err.error)),
        }
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.blobs_dir.join(hash.hex_digest())
    }

    fn kind_dir(&self, kind: &ConfigKind) -> PathBuf {
        self.kinds_dir.join(kind.as_str())
    }

    fn header_path(&self, kind: &ConfigKind, seq: u64) -> PathBuf {
        self.kind_dir(kind).join(format!("{seq:020}.{HEADER_EXT}"))
    }

    fn read_header_at(path: &Path) -> StoreResult<Option<ArtifactHeader>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_cbor::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    fn read_blob(&self, header: &ArtifactHeader) -> StoreResult<Vec<u8>> {
        let path = self.blob_path(&header.content_hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::MissingContent {
                    kind: header.kind.clone(),
                    seq: header.seq,
                    hash: header.content_hash,
                });
            }
            Err(err) => return Err(io_error(path, err)),
        };
        let actual = ContentHash::of_bytes(&bytes);
        if actual != header.content_hash {
            return Err(StoreError::HashMismatch {
                expected: header.content_hash,
                actual,
            });
        }
        Ok(bytes)
    }

    fn check_conflict(existing: &ArtifactHeader, incoming: &ArtifactHeader) -> StoreResult<()> {
        if existing.content_hash != incoming.content_hash {
            return Err(StoreError::ArtifactConflict {
                kind: incoming.kind.clone(),
                seq: incoming.seq,
                existing: existing.content_hash,
                incoming: incoming.content_hash,
            });
        }
        Ok(())
    }

    fn stored_kinds(&self) -> StoreResult<Vec<ConfigKind>> {
        let entries = fs::read_dir(&self.kinds_dir).map_err(|e| io_error(&self.kinds_dir, e))?;
        let mut kinds = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.kinds_dir, e))?;
            if let Some(kind) = entry
                .file_name()
                .to_str()
                .and_then(|name| ConfigKind::new(name).ok())
            {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put_artifact(&self, artifact: &Artifact) -> StoreResult<PutOutcome> {
        let header = &artifact.header;
        let actual = ContentHash::of_bytes(&artifact.content);
        if actual != header.content_hash {
            return Err(StoreError::HashMismatch {
                expected: header.content_hash,
                actual,
            });
        }
        let path = self.header_path(&header.kind, header.seq);
        let _guard = self.exclusive();
        if let Some(existing) = Self::read_header_at(&path)? {
            Self::check_conflict(&existing, header)?;
        }

        // Content first so a header never points at a missing blob.
        let content_written =
            Self::write_once(&self.blob_path(&header.content_hash), &artifact.content)?;
        let header_bytes = to_canonical_cbor(header)?;
        let header_written = Self::write_once(&path, &header_bytes)?;
        if !header_written {
            if let Some(existing) = Self::read_header_at(&path)? {
                Self::check_conflict(&existing, header)?;
            }
        }
        Ok(PutOutcome {
            content_written,
            header_written,
        })
    }

    fn stage_content(&self, content: &[u8]) -> StoreResult<ContentHash> {
        let hash = ContentHash::of_bytes(content);
        Self::write_once(&self.blob_path(&hash), content)?;
        Ok(hash)
    }

    fn get_artifact(&self, kind: &ConfigKind, seq: u64) -> StoreResult<Option<Artifact>> {
        let Some(header) = self.get_header(kind, seq)? else {
            return Ok(None);
        };
        let content = self.read_blob(&header)?;
        Ok(Some(Artifact { header, content }))
    }

    fn get_header(&self, kind: &ConfigKind, seq: u64) -> StoreResult<Option<ArtifactHeader>> {
        Self::read_header_at(&self.header_path(kind, seq))
    }

    fn list_seqs(&self, kind: &ConfigKind) -> StoreResult<Vec<u64>> {
        let dir = self.kind_dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&dir, err)),
        };
        let mut seqs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(HEADER_EXT) {
                continue;
            }
            if let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    fn has_content(&self, hash: ContentHash) -> StoreResult<bool> {
        Ok(self.blob_path(&hash).exists())
    }

    fn prune(&self, kind: &ConfigKind, keep: usize) -> StoreResult<PruneReport> {
        let keep = keep.max(1);
        let _guard = self.exclusive();
        let seqs = self.list_seqs(kind)?;
        let mut report = PruneReport::default();
        if seqs.len() > keep {
            for seq in &seqs[..seqs.len() - keep] {
                let path = self.header_path(kind, *seq);
                match fs::remove_file(&path) {
                    Ok(()) => report.headers_removed.push(*seq),
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(io_error(path, err)),
                }
            }
        }

        let mut referenced = BTreeSet::new();
        for stored in self.stored_kinds()? {
            for seq in self.list_seqs(&stored)? {
                if let Some(header) = self.get_header(&stored, seq)? {
                    referenced.insert(header.content_hash.hex_digest());
                }
            }
        }
        let entries = fs::read_dir(&self.blobs_dir).map_err(|e| io_error(&self.blobs_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.blobs_dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() == 64 && !referenced.contains(name) {
                let path = entry.path();
                fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
                report.blobs_removed += 1;
            }
        }
        Ok(report)
    }

    fn clear(&self) -> StoreResult<()> {
        let _guard = self.exclusive();
        for dir in [&self.blobs_dir, &self.kinds_dir] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(dir, err)),
            }
            fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        tracing::info!(root = ?self.kinds_dir.parent(), "artifact storage cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn kind() -> ConfigKind {
        ConfigKind::new("proxy-auth").unwrap()
    }

    fn artifact(seq: u64, body: &[u8]) -> Artifact {
        Artifact::new(kind(), seq, body.to_vec(), 1)
    }

    #[test]
    fn artifact_round_trip() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        let art = artifact(3, b"content-v3");
        let outcome = store.put_artifact(&art).expect("put");
        assert!(outcome.content_written && outcome.header_written);
        let loaded = store.get_artifact(&kind(), 3).expect("get").expect("present");
        assert_eq!(loaded, art);
        assert_eq!(store.list_seqs(&kind()).expect("list"), vec![3]);
        assert_eq!(store.get_artifact(&kind(), 4).expect("get"), None);
    }

    #[test]
    fn rewriting_same_artifact_is_a_no_op() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        let art = artifact(1, b"same");
        store.put_artifact(&art).expect("first");
        let again = store.put_artifact(&art).expect("retry");
        assert_eq!(again, PutOutcome::default());
    }

    #[test]
    fn unchanged_content_shares_one_blob() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        store.put_artifact(&artifact(1, b"same")).expect("seq 1");
        let outcome = store.put_artifact(&artifact(2, b"same")).expect("seq 2");
        assert!(!outcome.content_written);
        assert!(outcome.header_written);
        let blobs = fs::read_dir(dir.path().join("blobs/sha256")).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[test]
    fn different_content_under_existing_seq_conflicts() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        store.put_artifact(&artifact(7, b"old world")).expect("put");
        let err = store
            .put_artifact(&artifact(7, b"new world"))
            .expect_err("conflict");
        match err {
            StoreError::ArtifactConflict { seq, .. } => assert_eq!(seq, 7),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn tampered_blob_is_detected() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        let art = artifact(1, b"original");
        store.put_artifact(&art).expect("put");
        fs::write(store.blob_path(&art.content_hash()), b"tampered").expect("tamper");
        let err = store.get_artifact(&kind(), 1).expect_err("should fail");
        assert!(matches!(err, StoreError::HashMismatch { .. }));
    }

    #[test]
    fn prune_keeps_window_and_drops_orphan_blobs() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        for seq in 1..=5 {
            store
                .put_artifact(&artifact(seq, format!("v{seq}").as_bytes()))
                .expect("put");
        }
        let report = store.prune(&kind(), 2).expect("prune");
        assert_eq!(report.headers_removed, vec![1, 2, 3]);
        assert_eq!(report.blobs_removed, 3);
        assert_eq!(store.list_seqs(&kind()).unwrap(), vec![4, 5]);
        assert!(store.get_artifact(&kind(), 5).unwrap().is_some());
    }

    #[test]
    fn prune_keeps_blobs_shared_with_other_kinds() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        let other = ConfigKind::new("keyserver-clients").unwrap();
        store.put_artifact(&artifact(1, b"shared")).expect("put");
        store.put_artifact(&artifact(2, b"newer")).expect("put");
        store
            .put_artifact(&Artifact::new(other.clone(), 1, b"shared".to_vec(), 1))
            .expect("put other");
        let report = store.prune(&kind(), 1).expect("prune");
        assert_eq!(report.headers_removed, vec![1]);
        assert_eq!(report.blobs_removed, 0);
        assert!(store.get_artifact(&other, 1).unwrap().is_some());
    }

    #[test]
    fn prune_of_one_kind_never_strands_another_kinds_header() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        let other = ConfigKind::new("keyserver-clients").unwrap();
        store
            .put_artifact(&Artifact::new(other.clone(), 1, b"clients".to_vec(), 1))
            .expect("put other");
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for seq in 1..=300u64 {
                    store
                        .put_artifact(&artifact(seq, format!("auth-{seq}").as_bytes()))
                        .expect("put");
                }
                done.store(true, std::sync::atomic::Ordering::SeqCst);
            });
            scope.spawn(|| {
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    store.prune(&other, 1).expect("prune");
                }
            });
        });

        let seqs = store.list_seqs(&kind()).unwrap();
        assert_eq!(seqs.len(), 300);
        for seq in seqs {
            assert!(
                store.get_artifact(&kind(), seq).expect("content present").is_some(),
                "seq {seq}"
            );
        }
    }

    #[test]
    fn staged_content_is_reused_by_the_header_write() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        let art = artifact(1, b"staged");
        assert_eq!(store.stage_content(&art.content).unwrap(), art.content_hash());
        let outcome = store.put_artifact(&art).expect("put");
        assert!(!outcome.content_written);
        assert!(outcome.header_written);
    }

    #[test]
    fn swept_staged_content_is_rewritten() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        let art = artifact(1, b"staged then swept");
        store.stage_content(&art.content).unwrap();
        let report = store.prune(&kind(), 1).expect("prune");
        assert_eq!(report.blobs_removed, 1);
        let outcome = store.put_artifact(&art).expect("put");
        assert!(outcome.content_written);
        assert!(store.get_artifact(&kind(), 1).unwrap().is_some());
    }

    #[test]
    fn clear_removes_everything() {
        let dir = TempDir::new().expect("tmp");
        let store = FsArtifactStore::open(dir.path()).expect("open");
        store.put_artifact(&artifact(9, b"stale")).expect("put");
        store.clear().expect("clear");
        assert!(store.list_seqs(&kind()).unwrap().is_empty());
        assert_eq!(store.latest_header(&kind()).unwrap(), None);
        store.put_artifact(&artifact(9, b"fresh")).expect("no conflict after clear");
    }
}
