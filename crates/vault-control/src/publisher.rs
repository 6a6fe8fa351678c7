use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use vault_protocol::ConfigKind;
use vault_protocol::api::{PublishOutcome, PublishSummary};
use vault_store::{Artifact, DynArtifactStore, StoreError, to_canonical_cbor};

use crate::ledger::{LedgerError, LedgerRow, PublishCommit, SequenceLedger};
use crate::snapshot::{SnapshotBuilder, SnapshotError};

/// Upper bound on build/commit rounds in one execution. Requests that keep
/// arriving past this are left for the next tick.
const MAX_ROUNDS: usize = 8;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("snapshot build for {kind} failed: {source}")]
    Build {
        kind: ConfigKind,
        #[source]
        source: SnapshotError,
    },
    #[error("snapshot build for {kind} exceeded {timeout:?}")]
    BuildTimeout { kind: ConfigKind, timeout: Duration },
    #[error("encoding snapshot for {kind}: {source}")]
    Encode {
        kind: ConfigKind,
        #[source]
        source: serde_cbor::Error,
    },
    #[error("staging content for {kind} failed: {source}")]
    Stage {
        kind: ConfigKind,
        #[source]
        source: StoreError,
    },
    #[error("publish worker for {kind} stopped: {message}")]
    Worker { kind: ConfigKind, message: String },
}

impl PublishError {
    /// A header for the target sequence already exists with other content:
    /// artifacts outlived a ledger reset.
    pub fn is_artifact_conflict(&self) -> bool {
        matches!(
            self,
            PublishError::Ledger(LedgerError::Artifact {
                source: StoreError::ArtifactConflict { .. },
                ..
            })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub outcome: PublishOutcome,
    /// Ledger row after the execution.
    pub row: LedgerRow,
    /// False when every round reproduced the previous content.
    pub content_changed: bool,
    pub rounds: usize,
}

impl PublishResult {
    pub fn summary(&self) -> PublishSummary {
        PublishSummary {
            kind: self.row.kind.clone(),
            outcome: self.outcome,
            published_seq: self.row.published_seq,
            content_changed: self.content_changed,
            content_hash: self.row.content_hash.map(|h| h.to_hex()),
            entry_count: self.row.entry_count,
        }
    }
}

/// Turns pending change requests into published artifacts.
#[derive(Clone)]
pub struct Publisher {
    ledger: SequenceLedger,
    store: DynArtifactStore,
    builder: Arc<dyn SnapshotBuilder>,
    /// Shared with drift recovery, which takes it exclusively.
    gate: Arc<RwLock<()>>,
    build_timeout: Duration,
    retention: usize,
}

impl Publisher {
    pub fn new(
        ledger: SequenceLedger,
        store: DynArtifactStore,
        builder: Arc<dyn SnapshotBuilder>,
        gate: Arc<RwLock<()>>,
        build_timeout: Duration,
        retention: usize,
    ) -> Self {
        Self {
            ledger,
            store,
            builder,
            gate,
            build_timeout,
            retention,
        }
    }

    /// Publish `kind` if its ledger row has a pending request.
    ///
    /// With nothing pending this reads the row and returns
    /// [`PublishOutcome::Unchanged`] without building or writing anything.
    pub async fn publish(&self, kind: &ConfigKind) -> Result<PublishResult, PublishError> {
        let _gate = self.gate.read().await;
        let mut row = self.ledger.get_or_zero(kind)?;
        let mut rounds = 0;
        let mut content_changed = false;

        while row.has_pending() && rounds < MAX_ROUNDS {
            rounds += 1;
            let (next, changed) = self.publish_round(kind, &row).await?;
            content_changed |= changed;
            row = next;
        }

        if rounds == 0 {
            tracing::debug!(%kind, published_seq = row.published_seq, "nothing pending");
            return Ok(PublishResult {
                outcome: PublishOutcome::Unchanged,
                row,
                content_changed: false,
                rounds,
            });
        }
        if row.has_pending() {
            tracing::debug!(
                %kind,
                requested_seq = row.requested_seq,
                "requests still pending after {MAX_ROUNDS} rounds"
            );
        }

        self.prune(kind).await;
        Ok(PublishResult {
            outcome: PublishOutcome::Published,
            row,
            content_changed,
            rounds,
        })
    }

    async fn publish_round(
        &self,
        kind: &ConfigKind,
        row: &LedgerRow,
    ) -> Result<(LedgerRow, bool), PublishError> {
        let snapshot = tokio::time::timeout(self.build_timeout, self.builder.build(kind))
            .await
            .map_err(|_| PublishError::BuildTimeout {
                kind: kind.clone(),
                timeout: self.build_timeout,
            })?
            .map_err(|source| PublishError::Build {
                kind: kind.clone(),
                source,
            })?;
        let content = to_canonical_cbor(&snapshot).map_err(|source| PublishError::Encode {
            kind: kind.clone(),
            source,
        })?;

        let new_seq = row.requested_seq;
        let artifact = Artifact::new(kind.clone(), new_seq, content, snapshot.entry_count());
        let commit = PublishCommit {
            expected_published: row.published_seq,
            new_seq,
            content_hash: artifact.content_hash(),
            entry_count: artifact.header.entry_count,
        };
        let changed = row.content_hash != Some(commit.content_hash);

        let ledger = self.ledger.clone();
        let store = self.store.clone();
        let task_kind = kind.clone();
        // The blob is written outside the ledger lock; only the header
        // write and the row update run inside the transaction.
        let next = tokio::task::spawn_blocking(move || {
            store
                .stage_content(&artifact.content)
                .map_err(|source| PublishError::Stage {
                    kind: task_kind.clone(),
                    source,
                })?;
            ledger
                .commit_publish(&task_kind, commit, || {
                    store.put_artifact(&artifact).map(|_| ())
                })
                .map_err(PublishError::from)
        })
        .await
        .map_err(|e| PublishError::Worker {
            kind: kind.clone(),
            message: e.to_string(),
        })??;

        tracing::info!(
            %kind,
            from = row.published_seq,
            to = next.published_seq,
            entries = next.entry_count,
            content_changed = changed,
            "published"
        );
        Ok((next, changed))
    }

    async fn prune(&self, kind: &ConfigKind) {
        let store = self.store.clone();
        let task_kind = kind.clone();
        let keep = self.retention;
        match tokio::task::spawn_blocking(move || store.prune(&task_kind, keep)).await {
            Ok(Ok(report)) if !report.headers_removed.is_empty() => tracing::debug!(
                %kind,
                headers = report.headers_removed.len(),
                blobs = report.blobs_removed,
                "pruned old artifacts"
            ),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::warn!(%kind, "artifact pruning failed: {err}"),
            Err(err) => tracing::warn!(%kind, "artifact pruning worker failed: {err}"),
        }
    }
}
