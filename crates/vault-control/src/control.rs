use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use vault_protocol::ConfigKind;
use vault_protocol::api::{
    FleetStatusReport, HealthReport, KindStatusDetail, KindSyncStatus, NodeStatusDetail,
    NotificationView, SyncOverview, TaskSource,
};

use crate::config::ControlConfig;
use crate::convergence;
use crate::db::{Db, now_ms};
use crate::drift::{DriftGuard, RecoveryError};
use crate::engine::{Collaborators, Engine, RecoveryOutcome, publish_through};
use crate::error::ControlError;
use crate::fleet::FleetStore;
use crate::fleet::poller::FleetPoller;
use crate::ledger::SequenceLedger;
use crate::notify::Notifier;
use crate::publisher::{PublishResult, Publisher};
use crate::scheduler::{Task, TaskError, TaskHandle, TaskOutput, TaskScheduler};

/// Entry point for business collaborators, the HTTP surface and the
/// periodic driver.
#[derive(Clone)]
pub struct ControlPlane {
    engine: Arc<Engine>,
    scheduler: TaskScheduler,
}

impl ControlPlane {
    pub fn new(
        config: ControlConfig,
        db: Db,
        collaborators: Collaborators,
    ) -> Result<Self, ControlError> {
        let ledger = SequenceLedger::new(db.clone());
        let fleet = FleetStore::new(db.clone());
        let notifier = Notifier::new(db);
        ledger.ensure_kinds(&config.kinds)?;
        fleet.sync_nodes(&config.fleet)?;

        let gate = Arc::new(RwLock::new(()));
        let publisher = Publisher::new(
            ledger.clone(),
            collaborators.store,
            collaborators.builder.clone(),
            gate.clone(),
            config.build_timeout,
            config.artifact_retention,
        );
        let poller = FleetPoller::new(
            fleet.clone(),
            notifier.clone(),
            collaborators.probe,
            config.kinds.clone(),
            config.poll_timeout,
        );
        let guard = DriftGuard::new(
            ledger.clone(),
            fleet.clone(),
            collaborators.recovery,
            gate,
            config.drift_recovery_enabled(),
            config.recovery_timeout,
            config.recovery_probe_interval,
        );
        let engine = Arc::new(Engine::new(
            config,
            ledger,
            fleet,
            notifier,
            publisher,
            poller,
            guard,
            collaborators.builder,
        ));
        let scheduler = TaskScheduler::new(engine.clone());
        tracing::info!(
            kinds = engine.config.kinds.len(),
            nodes = engine.config.fleet.len(),
            recovery = engine.recovery_enabled(),
            "control plane ready"
        );
        Ok(Self { engine, scheduler })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.engine.config
    }

    pub fn kinds(&self) -> &[ConfigKind] {
        &self.engine.config.kinds
    }

    /// Parse and check a kind name against the configured kinds.
    pub fn resolve_kind(&self, name: &str) -> Result<ConfigKind, ControlError> {
        let kind = ConfigKind::new(name)?;
        if self.kinds().contains(&kind) {
            Ok(kind)
        } else {
            Err(ControlError::UnknownKind(name.to_string()))
        }
    }

    fn ensure_configured(&self, kind: &ConfigKind) -> Result<(), ControlError> {
        if self.kinds().contains(kind) {
            Ok(())
        } else {
            Err(ControlError::UnknownKind(kind.to_string()))
        }
    }

    pub fn enqueue(&self, task: Task, source: TaskSource) -> TaskHandle {
        self.scheduler.enqueue(task, source)
    }

    /// Enqueue and wait for the (possibly shared) execution.
    pub async fn run(&self, task: Task, source: TaskSource) -> Result<TaskOutput, ControlError> {
        Ok(self.scheduler.enqueue(task, source).wait().await?)
    }

    /// Record a change for `kind` and start publishing it without waiting.
    pub fn request_publish(
        &self,
        kind: &ConfigKind,
        source: TaskSource,
    ) -> Result<TaskHandle, ControlError> {
        self.ensure_configured(kind)?;
        let requested = self.engine.ledger.request_publish(kind)?;
        tracing::debug!(%kind, requested, "publish requested");
        Ok(self.scheduler.enqueue(Task::Publish(kind.clone()), source))
    }

    /// Record a change for `kind` and wait until a publish covering it commits.
    pub async fn request_publish_await(
        &self,
        kind: &ConfigKind,
        source: TaskSource,
    ) -> Result<PublishResult, ControlError> {
        self.ensure_configured(kind)?;
        let requested = self.engine.ledger.request_publish(kind)?;
        Ok(publish_through(&self.scheduler, kind, requested, source).await?)
    }

    pub fn health_report(&self) -> Result<HealthReport, ControlError> {
        let mut kinds = Vec::with_capacity(self.kinds().len());
        for kind in self.kinds() {
            kinds.push(self.engine.ledger.get_or_zero(kind)?.health());
        }
        Ok(HealthReport { ok: true, kinds })
    }

    pub fn sync_status(&self, kind: &ConfigKind) -> Result<KindSyncStatus, ControlError> {
        self.ensure_configured(kind)?;
        let ledger = self.engine.ledger.get_or_zero(kind)?;
        let rows = self.engine.fleet.status_rows_for(kind)?;
        Ok(convergence::sync_status(
            &ledger,
            &rows,
            now_ms(),
            self.config().liveness_window,
        ))
    }

    /// Fleet-wide convergence plus per-node reachability.
    ///
    /// Fails with [`ControlError::RecoveryFailed`] while an unrecovered drift
    /// recovery failure is outstanding.
    pub fn sync_overview(&self) -> Result<SyncOverview, ControlError> {
        if let Some(failure) = self.engine.recovery_failure() {
            return Err(ControlError::RecoveryFailed(failure));
        }
        let now = now_ms();
        let liveness = self.config().liveness_window;
        let rows = self.engine.fleet.status_rows()?;
        let mut kinds = Vec::with_capacity(self.kinds().len());
        for kind in self.kinds() {
            let ledger = self.engine.ledger.get_or_zero(kind)?;
            kinds.push(convergence::sync_status(&ledger, &rows, now, liveness));
        }
        let drift_detected = !self.engine.detect_drift()?.is_empty();
        let nodes = convergence::reachability(&self.engine.fleet.nodes()?, now, liveness);
        Ok(SyncOverview {
            synced: !drift_detected && convergence::fleet_synced(&kinds),
            drift_detected,
            kinds,
            nodes,
        })
    }

    /// Raw last-polled detail per node.
    pub fn fleet_status(&self) -> Result<FleetStatusReport, ControlError> {
        let mut by_node: BTreeMap<String, Vec<KindStatusDetail>> = BTreeMap::new();
        for row in self.engine.fleet.status_rows()? {
            by_node
                .entry(row.node_id.clone())
                .or_default()
                .push(KindStatusDetail {
                    kind: row.kind,
                    applied_seq: row.applied_seq,
                    applied_at_ms: row.applied_at_ms,
                    processing_seq: row.processing_seq,
                    processing_started_at_ms: row.processing_started_at_ms,
                    last_error: row.last_error,
                    entry_count: row.entry_count,
                    last_seen_at_ms: row.last_seen_at_ms,
                });
        }
        let nodes = self
            .engine
            .fleet
            .nodes()?
            .into_iter()
            .map(|record| NodeStatusDetail {
                kinds: by_node.remove(&record.node.id).unwrap_or_default(),
                node_id: record.node.id,
                name: record.node.name,
                host: record.node.host,
                region: record.node.region,
                last_attempt_at_ms: record.last_attempt_at_ms,
                last_poll_error: record.last_poll_error,
            })
            .collect();
        Ok(FleetStatusReport { nodes })
    }

    /// Poll the fleet until every kind converges, or fail after `timeout`.
    pub async fn wait_until_synced(
        &self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<SyncOverview, ControlError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.run(Task::PollFleet, TaskSource::Internal).await?;
            let overview = self.sync_overview()?;
            if overview.synced {
                return Ok(overview);
            }
            if Instant::now() + interval > deadline {
                return Err(ControlError::NotConverged(timeout));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Run drift recovery on operator request, regardless of observed drift.
    /// A success clears an earlier recovery failure.
    ///
    /// The procedure runs on its own task, so dropping the returned future
    /// does not interrupt it.
    pub async fn recover_now(&self) -> Result<RecoveryOutcome, ControlError> {
        if !self.engine.recovery_enabled() {
            return Err(RecoveryError::Disabled("not enabled for this deployment").into());
        }
        let engine = self.engine.clone();
        let scheduler = self.scheduler.clone();
        let outcome = tokio::spawn(async move { engine.recover(&scheduler).await })
            .await
            .map_err(|_| TaskError::Aborted)??;
        Ok(outcome)
    }

    pub fn recovery_failure(&self) -> Option<String> {
        self.engine.recovery_failure()
    }

    pub fn notifications(
        &self,
        include_acknowledged: bool,
    ) -> Result<Vec<NotificationView>, ControlError> {
        Ok(self.engine.notifier.list(include_acknowledged)?)
    }

    pub fn acknowledge(&self, id: i64) -> Result<(), ControlError> {
        if self.engine.notifier.acknowledge(id)? {
            Ok(())
        } else {
            Err(ControlError::UnknownNotification(id))
        }
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.scheduler.in_flight()
    }
}
