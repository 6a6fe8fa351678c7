use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use vault_client::{ClientError, NodeClient};
use vault_protocol::api::Severity;
use vault_protocol::{ConfigKind, NodeHealth};

use crate::db::{DbError, now_ms};
use crate::fleet::{FleetNode, FleetStatusRow, FleetStore};
use crate::notify::Notifier;

pub const APPLY_FAILED: &str = "APPLY_FAILED";
pub const NODE_POLL_FAILED: &str = "NODE_POLL_FAILED";

/// Health query against one node.
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn query(&self, node: &FleetNode) -> Result<NodeHealth, ClientError>;
}

pub struct HttpNodeProbe {
    client: NodeClient,
}

impl HttpNodeProbe {
    pub fn new(client: NodeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeProbe for HttpNodeProbe {
    async fn query(&self, node: &FleetNode) -> Result<NodeHealth, ClientError> {
        self.client.health(&node.health_url).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollFailure {
    pub node_id: String,
    pub error: String,
    /// Timeouts and refused connections: recorded as staleness only.
    pub transient: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub reachable: Vec<String>,
    pub failures: Vec<PollFailure>,
    /// `(node_id, kind)` pairs reporting a failed apply.
    pub apply_failures: Vec<(String, ConfigKind)>,
}

pub struct FleetPoller {
    fleet: FleetStore,
    notifier: Notifier,
    probe: Arc<dyn NodeProbe>,
    kinds: Vec<ConfigKind>,
    timeout: Duration,
}

impl FleetPoller {
    pub fn new(
        fleet: FleetStore,
        notifier: Notifier,
        probe: Arc<dyn NodeProbe>,
        kinds: Vec<ConfigKind>,
        timeout: Duration,
    ) -> Self {
        Self {
            fleet,
            notifier,
            probe,
            kinds,
            timeout,
        }
    }

    /// Query every registered node concurrently and record what they report.
    ///
    /// A node that cannot be reached keeps its previous rows untouched; their
    /// ageing `last_seen_at_ms` is what marks it unreachable.
    pub async fn poll(&self) -> Result<PollReport, DbError> {
        let nodes = self.fleet.nodes()?;
        let queries = nodes.iter().map(|record| async move {
            let outcome = tokio::time::timeout(self.timeout, self.probe.query(&record.node)).await;
            (&record.node, outcome)
        });
        let results = join_all(queries).await;

        let mut report = PollReport::default();
        let now = now_ms();
        for (node, outcome) in results {
            let failure = match outcome {
                Ok(Ok(health)) if health.node_id != node.id => Some(PollFailure {
                    node_id: node.id.clone(),
                    error: format!("node reported id '{}'", health.node_id),
                    transient: false,
                }),
                Ok(Ok(health)) => {
                    self.record_health(node, &health, now, &mut report)?;
                    None
                }
                Ok(Err(err)) => Some(PollFailure {
                    node_id: node.id.clone(),
                    error: err.to_string(),
                    transient: err.is_transient(),
                }),
                Err(_) => Some(PollFailure {
                    node_id: node.id.clone(),
                    error: format!("health query timed out after {:?}", self.timeout),
                    transient: true,
                }),
            };
            if let Some(failure) = failure {
                self.record_failure(node, &failure, now)?;
                report.failures.push(failure);
            }
        }
        Ok(report)
    }

    fn record_health(
        &self,
        node: &FleetNode,
        health: &NodeHealth,
        now: u64,
        report: &mut PollReport,
    ) -> Result<(), DbError> {
        self.fleet.record_attempt(&node.id, now, None)?;
        self.notifier.resolve(&node.id, NODE_POLL_FAILED)?;
        for kind in &self.kinds {
            let Some(kind_health) = health.kinds.get(kind) else {
                continue;
            };
            let row = FleetStatusRow::from_health(&node.id, kind.clone(), kind_health, now);
            self.fleet.upsert_status(&row)?;
            let category = format!("{}/{kind}", node.id);
            match kind_health.processing.as_ref().and_then(|p| {
                p.error.as_deref().map(|e| (p.seq, e))
            }) {
                Some((seq, error)) => {
                    tracing::warn!(node = %node.id, %kind, seq, "apply failed: {error}");
                    self.notifier.notify(
                        Severity::Warning,
                        &category,
                        APPLY_FAILED,
                        &format!("{} failed to apply {kind}@{seq}: {error}", node.name),
                        json!({"node_id": node.id, "kind": kind, "seq": seq}),
                    )?;
                    report.apply_failures.push((node.id.clone(), kind.clone()));
                }
                None => {
                    self.notifier.resolve(&category, APPLY_FAILED)?;
                }
            }
        }
        for kind in health.kinds.keys() {
            if !self.kinds.contains(kind) {
                tracing::debug!(node = %node.id, %kind, "ignoring unconfigured kind");
            }
        }
        report.reachable.push(node.id.clone());
        Ok(())
    }

    fn record_failure(
        &self,
        node: &FleetNode,
        failure: &PollFailure,
        now: u64,
    ) -> Result<(), DbError> {
        self.fleet.record_attempt(&node.id, now, Some(&failure.error))?;
        tracing::warn!(
            node = %node.id,
            transient = failure.transient,
            "poll failed: {}",
            failure.error
        );
        if !failure.transient {
            self.notifier.notify(
                Severity::Warning,
                &node.id,
                NODE_POLL_FAILED,
                &format!("{} health query failed: {}", node.name, failure.error),
                json!({"node_id": node.id, "host": node.host}),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use std::collections::{BTreeMap, HashMap};
    use vault_protocol::{AppliedState, KindHealth, ProcessingState};

    enum Reply {
        Health(NodeHealth),
        Unreachable,
        BadStatus,
        Hang,
    }

    struct FakeProbe {
        replies: HashMap<String, Reply>,
    }

    #[async_trait]
    impl NodeProbe for FakeProbe {
        async fn query(&self, node: &FleetNode) -> Result<NodeHealth, ClientError> {
            match self.replies.get(&node.id) {
                Some(Reply::Health(h)) => Ok(h.clone()),
                Some(Reply::BadStatus) => Err(ClientError::Status {
                    url: node.health_url.clone(),
                    status: 500,
                    body: "oops".into(),
                }),
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Err(ClientError::Timeout {
                        url: node.health_url.clone(),
                    })
                }
                Some(Reply::Unreachable) | None => Err(ClientError::Timeout {
                    url: node.health_url.clone(),
                }),
            }
        }
    }

    fn node(id: &str) -> FleetNode {
        FleetNode {
            id: id.into(),
            name: id.to_uppercase(),
            host: format!("{id}.internal"),
            region: "us-east".into(),
            health_url: format!("http://{id}.internal/health"),
        }
    }

    fn kind() -> ConfigKind {
        ConfigKind::new("proxy-auth").unwrap()
    }

    fn applied(node_id: &str, seq: u64) -> NodeHealth {
        NodeHealth {
            node_id: node_id.into(),
            kinds: BTreeMap::from([(
                kind(),
                KindHealth {
                    applied: Some(AppliedState { seq, at_ms: 1 }),
                    processing: None,
                    entries: 4,
                },
            )]),
        }
    }

    fn setup(replies: Vec<(&str, Reply)>) -> (FleetPoller, FleetStore, Notifier) {
        let db = Db::open_in_memory().unwrap();
        let fleet = FleetStore::new(db.clone());
        let notifier = Notifier::new(db);
        let nodes: Vec<_> = replies.iter().map(|(id, _)| node(id)).collect();
        fleet.sync_nodes(&nodes).unwrap();
        let probe = FakeProbe {
            replies: replies
                .into_iter()
                .map(|(id, r)| (id.to_string(), r))
                .collect(),
        };
        let poller = FleetPoller::new(
            fleet.clone(),
            notifier.clone(),
            Arc::new(probe),
            vec![kind()],
            Duration::from_millis(100),
        );
        (poller, fleet, notifier)
    }

    #[tokio::test]
    async fn records_reported_state() {
        let (poller, fleet, _) = setup(vec![("a", Reply::Health(applied("a", 5)))]);
        let report = poller.poll().await.unwrap();
        assert_eq!(report.reachable, vec!["a"]);
        let rows = fleet.status_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].applied_seq, Some(5));
        assert_eq!(rows[0].entry_count, 4);
    }

    #[tokio::test]
    async fn unreachable_node_keeps_stale_row_without_notification() {
        let (poller, fleet, notifier) = setup(vec![("a", Reply::Unreachable), ("b", Reply::Hang)]);
        let seeded = FleetStatusRow::from_health("a", kind(), &applied("a", 3).kinds[&kind()], 7);
        fleet.upsert_status(&seeded).unwrap();

        let report = poller.poll().await.unwrap();
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.transient));
        assert_eq!(fleet.status_rows().unwrap(), vec![seeded]);
        assert!(notifier.list(false).unwrap().is_empty());
        let records = fleet.nodes().unwrap();
        assert!(records.iter().all(|r| r.last_seen_at_ms.is_none()));
        assert!(records.iter().all(|r| r.last_poll_error.is_some()));
    }

    #[tokio::test]
    async fn non_transient_failure_is_notified_once() {
        let (poller, _, notifier) = setup(vec![("a", Reply::BadStatus)]);
        poller.poll().await.unwrap();
        poller.poll().await.unwrap();
        let open = notifier.list(false).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].code, NODE_POLL_FAILED);
    }

    #[tokio::test]
    async fn apply_failure_is_recorded_and_notified() {
        let mut health = applied("a", 5);
        if let Some(k) = health.kinds.get_mut(&kind()) {
            k.processing = Some(ProcessingState {
                seq: 6,
                started_at_ms: 2,
                error: Some("config rejected".into()),
            });
        }
        let (poller, fleet, notifier) = setup(vec![("a", Reply::Health(health))]);
        let report = poller.poll().await.unwrap();
        assert_eq!(report.apply_failures, vec![("a".to_string(), kind())]);

        let row = &fleet.status_rows().unwrap()[0];
        assert_eq!(row.last_error.as_deref(), Some("config rejected"));
        assert_eq!(row.processing_seq, None);
        let open = notifier.list(false).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].category, "a/proxy-auth");
        assert_eq!(open[0].code, APPLY_FAILED);
    }

    #[tokio::test]
    async fn mismatched_node_id_is_rejected() {
        let (poller, fleet, _) = setup(vec![("a", Reply::Health(applied("imposter", 9)))]);
        let report = poller.poll().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(!report.failures[0].transient);
        assert!(fleet.status_rows().unwrap().is_empty());
    }
}
