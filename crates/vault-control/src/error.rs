use std::time::Duration;

use thiserror::Error;
use vault_protocol::InvalidKind;
use vault_store::StoreError;

use crate::db::DbError;
use crate::drift::RecoveryError;
use crate::ledger::LedgerError;
use crate::publisher::PublishError;
use crate::scheduler::TaskError;
use crate::snapshot::SnapshotError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("invalid kind: {0}")]
    InvalidKind(#[from] InvalidKind),
    #[error("kind '{0}' is not configured")]
    UnknownKind(String),
    #[error("notification {0} does not exist or is already acknowledged")]
    UnknownNotification(i64),
    /// Drift recovery failed earlier; fleet state is not trustworthy.
    #[error("drift recovery failed: {0}")]
    RecoveryFailed(String),
    #[error("fleet did not converge within {0:?}")]
    NotConverged(Duration),
}
