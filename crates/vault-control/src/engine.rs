use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use vault_protocol::ConfigKind;
use vault_protocol::api::{RecoverySummary, Severity, TaskSource};
use vault_store::DynArtifactStore;

use crate::config::ControlConfig;
use crate::db::DbError;
use crate::drift::{
    self, DRIFT_CATEGORY, DRIFT_DETECTED, DRIFT_RECOVERED, DRIFT_RECOVERY_FAILED, DriftFinding,
    DriftGuard, RecoveryError, RecoveryReport, RecoveryService,
};
use crate::fleet::FleetStore;
use crate::fleet::poller::{FleetPoller, NodeProbe, PollReport};
use crate::ledger::{LedgerError, LedgerRow, SequenceLedger};
use crate::notify::Notifier;
use crate::publisher::{PublishResult, Publisher};
use crate::scheduler::{Task, TaskError, TaskExecutor, TaskOutput, TaskResult, TaskScheduler};
use crate::snapshot::SnapshotBuilder;

pub const ARTIFACT_CONFLICT: &str = "ARTIFACT_CONFLICT";

/// Attempts made to get one publish past a required sequence.
const PUBLISH_ATTEMPTS: usize = 3;

/// External dependencies the control plane is wired with.
pub struct Collaborators {
    pub store: DynArtifactStore,
    pub builder: Arc<dyn SnapshotBuilder>,
    pub probe: Arc<dyn NodeProbe>,
    pub recovery: Option<Arc<dyn RecoveryService>>,
}

#[derive(Debug, Clone)]
pub struct PollCycle {
    pub report: PollReport,
    /// Drift observed by this cycle, before any recovery.
    pub drift: Vec<DriftFinding>,
    pub recovery: Option<RecoveryOutcome>,
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub reset: RecoveryReport,
    pub republished: Vec<PublishResult>,
    pub ledger_after_resweep: Vec<LedgerRow>,
}

impl RecoveryOutcome {
    pub fn summary(&self) -> RecoverySummary {
        RecoverySummary {
            ledger_after_reset: health_rows(&self.reset.ledger_after_reset),
            ledger_after_resweep: health_rows(&self.ledger_after_resweep),
            republished: self.republished.iter().map(PublishResult::summary).collect(),
            elapsed_ms: self.reset.elapsed.as_millis() as u64,
        }
    }
}

/// Executes scheduler tasks against the ledger, publisher, poller and drift guard.
pub struct Engine {
    pub(crate) config: ControlConfig,
    pub(crate) ledger: SequenceLedger,
    pub(crate) fleet: FleetStore,
    pub(crate) notifier: Notifier,
    publisher: Publisher,
    poller: FleetPoller,
    guard: DriftGuard,
    builder: Arc<dyn SnapshotBuilder>,
    recovery_failure: std::sync::RwLock<Option<String>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ControlConfig,
        ledger: SequenceLedger,
        fleet: FleetStore,
        notifier: Notifier,
        publisher: Publisher,
        poller: FleetPoller,
        guard: DriftGuard,
        builder: Arc<dyn SnapshotBuilder>,
    ) -> Self {
        Self {
            config,
            ledger,
            fleet,
            notifier,
            publisher,
            poller,
            guard,
            builder,
            recovery_failure: std::sync::RwLock::new(None),
        }
    }

    pub fn recovery_enabled(&self) -> bool {
        self.guard.recovery_enabled()
    }

    /// Set after a drift recovery failed; cleared only by a later successful one.
    pub fn recovery_failure(&self) -> Option<String> {
        self.recovery_failure
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_recovery_failure(&self, failure: Option<String>) {
        *self
            .recovery_failure
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = failure;
    }

    pub fn detect_drift(&self) -> Result<Vec<DriftFinding>, LedgerError> {
        let ledgers = self.ledger.list()?;
        let rows = self.fleet.status_rows()?;
        Ok(drift::detect(&ledgers, &rows))
    }

    async fn publish_one(&self, kind: &ConfigKind) -> Result<PublishResult, TaskError> {
        self.publisher.publish(kind).await.map_err(|err| {
            if err.is_artifact_conflict() {
                recorded(
                    ARTIFACT_CONFLICT,
                    self.notifier.notify(
                        Severity::Critical,
                        kind.as_str(),
                        ARTIFACT_CONFLICT,
                        &err.to_string(),
                        json!({"kind": kind}),
                    ),
                );
            }
            TaskError::Failed(err.to_string())
        })
    }

    async fn publish_kinds(
        &self,
        kinds: &[ConfigKind],
        scheduler: &TaskScheduler,
    ) -> Result<Vec<PublishResult>, TaskError> {
        let mut targets = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let row = self.ledger.get_or_zero(kind).map_err(failed)?;
            targets.push((kind, row.requested_seq));
        }
        let outcomes = join_all(targets.into_iter().map(|(kind, required)| {
            publish_through(scheduler, kind, required, TaskSource::Internal)
        }))
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(err) => errors.push(err.to_string()),
            }
        }
        if errors.is_empty() {
            Ok(results)
        } else {
            Err(TaskError::Failed(format!(
                "{} of {} kinds failed to publish: {}",
                errors.len(),
                kinds.len(),
                errors.join("; ")
            )))
        }
    }

    async fn publish_for_tenant(
        &self,
        tenant: &str,
        scheduler: &TaskScheduler,
    ) -> Result<Vec<PublishResult>, TaskError> {
        let affected = self
            .builder
            .kinds_for_tenant(tenant, &self.config.kinds)
            .await
            .map_err(failed)?;
        let kinds: Vec<_> = affected
            .into_iter()
            .filter(|k| self.config.kinds.contains(k))
            .collect();
        for kind in &kinds {
            self.ledger.request_publish(kind).map_err(failed)?;
        }
        tracing::info!(tenant, kinds = kinds.len(), "publishing for tenant");
        self.publish_kinds(&kinds, scheduler).await
    }

    async fn poll_cycle(&self, scheduler: &TaskScheduler) -> Result<PollCycle, TaskError> {
        let report = self.poller.poll().await.map_err(failed)?;
        self.prune_notifications();
        let drift = self.detect_drift().map_err(failed)?;
        if drift.is_empty() {
            recorded(
                DRIFT_DETECTED,
                self.notifier.resolve(DRIFT_CATEGORY, DRIFT_DETECTED),
            );
            return Ok(PollCycle {
                report,
                drift,
                recovery: None,
            });
        }

        for finding in &drift {
            tracing::error!(
                kind = %finding.kind,
                published_seq = finding.published_seq,
                max_applied_seq = finding.max_applied_seq,
                nodes = ?finding.node_ids,
                "drift detected"
            );
        }
        let details: Vec<_> = drift
            .iter()
            .map(|f| {
                json!({
                    "kind": f.kind,
                    "published_seq": f.published_seq,
                    "max_applied_seq": f.max_applied_seq,
                    "nodes": f.node_ids,
                })
            })
            .collect();
        recorded(
            DRIFT_DETECTED,
            self.notifier.notify(
                Severity::Critical,
                DRIFT_CATEGORY,
                DRIFT_DETECTED,
                &drift_message(&drift),
                json!(details),
            ),
        );

        if !self.guard.recovery_enabled() {
            tracing::warn!("drift recovery disabled; operator intervention required");
            return Ok(PollCycle {
                report,
                drift,
                recovery: None,
            });
        }
        if let Some(previous) = self.recovery_failure() {
            tracing::error!("not retrying drift recovery after earlier failure");
            return Err(TaskError::Fatal(previous));
        }

        match self.recover(scheduler).await {
            Ok(outcome) => Ok(PollCycle {
                report,
                drift,
                recovery: Some(outcome),
            }),
            Err(err) => Err(TaskError::Fatal(err.to_string())),
        }
    }

    /// Full recovery: reset, republish every kind, re-poll and confirm the
    /// drift is gone. Records success or failure for operators.
    pub(crate) async fn recover(
        &self,
        scheduler: &TaskScheduler,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        match self.recover_inner(scheduler).await {
            Ok(outcome) => {
                self.set_recovery_failure(None);
                recorded(
                    DRIFT_DETECTED,
                    self.notifier.resolve(DRIFT_CATEGORY, DRIFT_DETECTED),
                );
                recorded(
                    DRIFT_RECOVERY_FAILED,
                    self.notifier.resolve(DRIFT_CATEGORY, DRIFT_RECOVERY_FAILED),
                );
                recorded(
                    DRIFT_RECOVERED,
                    self.notifier.notify(
                        Severity::Info,
                        DRIFT_CATEGORY,
                        DRIFT_RECOVERED,
                        &format!(
                            "drift recovered in {:?}; {} kinds republished",
                            outcome.reset.elapsed,
                            outcome.republished.len()
                        ),
                        json!({"elapsed_ms": outcome.reset.elapsed.as_millis() as u64}),
                    ),
                );
                tracing::info!("drift recovery complete");
                Ok(outcome)
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!("drift recovery failed: {message}");
                self.set_recovery_failure(Some(message.clone()));
                recorded(
                    DRIFT_RECOVERY_FAILED,
                    self.notifier.notify(
                        Severity::Critical,
                        DRIFT_CATEGORY,
                        DRIFT_RECOVERY_FAILED,
                        &message,
                        json!({}),
                    ),
                );
                Err(err)
            }
        }
    }

    fn prune_notifications(&self) {
        let max_age = self.config.notification_retention.as_millis() as u64;
        match self.notifier.prune_acknowledged(max_age) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "pruned acknowledged notifications"),
            Err(err) => tracing::warn!("notification pruning failed: {err}"),
        }
    }

    async fn recover_inner(
        &self,
        scheduler: &TaskScheduler,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let reset = self.guard.reset_fleet().await?;

        for kind in &self.config.kinds {
            self.ledger.request_publish(kind)?;
        }
        let republished = self
            .publish_kinds(&self.config.kinds, scheduler)
            .await
            .map_err(|err| RecoveryError::Republish(err.to_string()))?;
        let ledger_after_resweep = self.ledger.list()?;

        self.poller.poll().await?;
        let remaining = self.detect_drift()?;
        if !remaining.is_empty() {
            return Err(RecoveryError::DriftPersists(
                remaining.into_iter().map(|f| f.kind).collect(),
            ));
        }
        Ok(RecoveryOutcome {
            reset,
            republished,
            ledger_after_resweep,
        })
    }
}

#[async_trait::async_trait]
impl TaskExecutor for Engine {
    async fn execute(&self, task: Task, scheduler: TaskScheduler) -> TaskResult {
        match task {
            Task::Publish(kind) => self
                .publish_one(&kind)
                .await
                .map(|result| TaskOutput::Published(vec![result])),
            Task::PublishAll => self
                .publish_kinds(&self.config.kinds, &scheduler)
                .await
                .map(TaskOutput::Published),
            Task::PublishForTenant(tenant) => self
                .publish_for_tenant(&tenant, &scheduler)
                .await
                .map(TaskOutput::Published),
            Task::PollFleet => self
                .poll_cycle(&scheduler)
                .await
                .map(|cycle| TaskOutput::Polled(Box::new(cycle))),
        }
    }
}

/// Publish `kind` through the scheduler until its published sequence reaches
/// `required`.
///
/// Joining a publish already in flight may return a result that predates the
/// caller's request; in that case the publish is enqueued again.
pub(crate) async fn publish_through(
    scheduler: &TaskScheduler,
    kind: &ConfigKind,
    required: u64,
    source: TaskSource,
) -> Result<PublishResult, TaskError> {
    let mut last_seq = 0;
    for _ in 0..PUBLISH_ATTEMPTS {
        let output = scheduler
            .enqueue(Task::Publish(kind.clone()), source)
            .wait()
            .await?;
        let TaskOutput::Published(results) = output else {
            return Err(TaskError::Failed(format!(
                "publish of {kind} returned no result"
            )));
        };
        let Some(result) = results.into_iter().find(|r| &r.row.kind == kind) else {
            return Err(TaskError::Failed(format!(
                "publish of {kind} returned no result"
            )));
        };
        if result.row.published_seq >= required {
            return Ok(result);
        }
        last_seq = result.row.published_seq;
    }
    Err(TaskError::Failed(format!(
        "{kind} stayed at published_seq {last_seq}, below requested {required}"
    )))
}

/// Notification writes never fail the task that raised them. A failed write
/// is logged instead; returns whether it went through.
fn recorded<T>(code: &str, result: Result<T, DbError>) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => {
            tracing::error!(code, "failed to record notification: {err}");
            false
        }
    }
}

fn health_rows(rows: &[LedgerRow]) -> Vec<vault_protocol::api::LedgerHealth> {
    rows.iter().map(LedgerRow::health).collect()
}

fn failed(err: impl std::fmt::Display) -> TaskError {
    TaskError::Failed(err.to_string())
}

fn drift_message(drift: &[DriftFinding]) -> String {
    let parts: Vec<_> = drift
        .iter()
        .map(|f| {
            format!(
                "{}: nodes at {} above published {}",
                f.kind, f.max_applied_seq, f.published_seq
            )
        })
        .collect();
    format!("drift detected ({})", parts.join("; "))
}
