//! Drift detection and the disruptive reset that clears it.
//!
//! Drift is a node reporting an applied sequence above the ledger's published
//! sequence. Nodes only apply what the ledger published, so this means
//! artifacts outlived a ledger reset. Liveness is ignored here: a stale node
//! that is ahead is exactly the symptom.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use vault_client::{ClientError, OperatorClient};
use vault_protocol::{ConfigKind, OperatorHealth};

use crate::config::ControlConfig;
use crate::db::DbError;
use crate::fleet::{FleetStatusRow, FleetStore};
use crate::ledger::{LedgerError, LedgerRow, SequenceLedger};

pub const DRIFT_CATEGORY: &str = "fleet";
pub const DRIFT_DETECTED: &str = "DRIFT_DETECTED";
pub const DRIFT_RECOVERED: &str = "DRIFT_RECOVERED";
pub const DRIFT_RECOVERY_FAILED: &str = "DRIFT_RECOVERY_FAILED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftFinding {
    pub kind: ConfigKind,
    pub published_seq: u64,
    pub max_applied_seq: u64,
    /// Nodes whose applied sequence is ahead of the ledger.
    pub node_ids: Vec<String>,
}

pub fn detect(ledgers: &[LedgerRow], rows: &[FleetStatusRow]) -> Vec<DriftFinding> {
    ledgers
        .iter()
        .filter_map(|ledger| {
            let ahead: Vec<_> = rows
                .iter()
                .filter(|r| r.kind == ledger.kind)
                .filter(|r| r.applied_seq.is_some_and(|seq| seq > ledger.published_seq))
                .collect();
            let max_applied_seq = ahead.iter().filter_map(|r| r.applied_seq).max()?;
            Some(DriftFinding {
                kind: ledger.kind.clone(),
                published_seq: ledger.published_seq,
                max_applied_seq,
                node_ids: ahead.iter().map(|r| r.node_id.clone()).collect(),
            })
        })
        .collect()
}

/// The privileged operator service. It alone stops processes, clears
/// artifact storage and restarts services.
#[async_trait]
pub trait RecoveryService: Send + Sync {
    async fn reset(&self) -> Result<(), ClientError>;
    async fn health(&self) -> Result<OperatorHealth, ClientError>;
}

#[async_trait]
impl RecoveryService for OperatorClient {
    async fn reset(&self) -> Result<(), ClientError> {
        OperatorClient::reset(self).await
    }

    async fn health(&self) -> Result<OperatorHealth, ClientError> {
        OperatorClient::health(self).await
    }
}

/// Operator client for `config`: the reset may take the whole recovery
/// budget, health probes get the poll timeout.
pub fn operator_client(
    config: &ControlConfig,
    base_url: &str,
    token: Option<String>,
) -> Result<OperatorClient, ClientError> {
    Ok(OperatorClient::new(base_url, token, config.recovery_timeout)?
        .with_health_timeout(config.poll_timeout))
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("drift recovery is disabled: {0}")]
    Disabled(&'static str),
    #[error("operator reset failed: {0}")]
    Reset(#[source] ClientError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("services did not report healthy within {timeout:?}: {last}")]
    Unhealthy { timeout: Duration, last: String },
    #[error("republish after reset failed: {0}")]
    Republish(String),
    #[error("drift persists after recovery on {0:?}")]
    DriftPersists(Vec<ConfigKind>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Ledger rows observed after the reset, before anything republished.
    pub ledger_after_reset: Vec<LedgerRow>,
    pub elapsed: Duration,
}

pub struct DriftGuard {
    ledger: SequenceLedger,
    fleet: FleetStore,
    service: Option<Arc<dyn RecoveryService>>,
    /// Held exclusively for the whole reset so no publish interleaves.
    gate: Arc<RwLock<()>>,
    allowed: bool,
    timeout: Duration,
    probe_interval: Duration,
}

impl DriftGuard {
    pub fn new(
        ledger: SequenceLedger,
        fleet: FleetStore,
        service: Option<Arc<dyn RecoveryService>>,
        gate: Arc<RwLock<()>>,
        allowed: bool,
        timeout: Duration,
        probe_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            fleet,
            service,
            gate,
            allowed,
            timeout,
            probe_interval,
        }
    }

    pub fn recovery_enabled(&self) -> bool {
        self.allowed && self.service.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reset the fleet through the operator service, zero the ledger, and
    /// wait for services to come back healthy.
    ///
    /// Bounded by the recovery timeout. Once started it runs to completion or
    /// failure; callers must not retry on failure.
    pub async fn reset_fleet(&self) -> Result<RecoveryReport, RecoveryError> {
        if !self.allowed {
            return Err(RecoveryError::Disabled("not allowed in this environment"));
        }
        let Some(service) = self.service.as_ref() else {
            return Err(RecoveryError::Disabled("no operator service configured"));
        };
        let started = Instant::now();
        let deadline = started + self.timeout;

        let _exclusive = self.gate.write().await;
        tracing::warn!("drift recovery: requesting operator reset");
        tokio::time::timeout_at(deadline.into(), service.reset())
            .await
            .map_err(|_| RecoveryError::Unhealthy {
                timeout: self.timeout,
                last: "operator reset did not return".into(),
            })?
            .map_err(RecoveryError::Reset)?;

        let zeroed = self.ledger.reset_all()?;
        let cleared = self.fleet.clear_status()?;
        let ledger_after_reset = self.ledger.list()?;
        tracing::warn!(zeroed, cleared, "drift recovery: ledger reset");

        self.wait_healthy(service.as_ref(), deadline).await?;
        let elapsed = started.elapsed();
        tracing::info!(?elapsed, "drift recovery: services healthy");
        Ok(RecoveryReport {
            ledger_after_reset,
            elapsed,
        })
    }

    async fn wait_healthy(
        &self,
        service: &dyn RecoveryService,
        deadline: Instant,
    ) -> Result<(), RecoveryError> {
        let mut last = String::from("no health response yet");
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RecoveryError::Unhealthy {
                    timeout: self.timeout,
                    last,
                });
            }
            match tokio::time::timeout(remaining, service.health()).await {
                Ok(Ok(health)) if health.all_healthy() => return Ok(()),
                Ok(Ok(health)) => {
                    let down: Vec<_> = health
                        .services
                        .iter()
                        .filter(|s| !s.healthy)
                        .map(|s| s.name.as_str())
                        .collect();
                    last = if down.is_empty() {
                        "no services reported".into()
                    } else {
                        format!("waiting on {}", down.join(", "))
                    };
                }
                Ok(Err(err)) => last = err.to_string(),
                Err(_) => last = "health probe timed out".into(),
            }
            tracing::debug!("drift recovery: {last}");
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.probe_interval.min(remaining)).await;
        }
    }
}
