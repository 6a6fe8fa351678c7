#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use vault_client::ClientError;
use vault_control::fleet::FleetNode;
use vault_control::{
    Collaborators, ControlConfig, ControlPlane, Db, Environment, NodeProbe, RecoveryService,
    Snapshot, SnapshotBuilder, SnapshotError,
};
use vault_protocol::{
    AppliedState, ConfigKind, KindHealth, NodeHealth, OperatorHealth, ProcessingState,
    ServiceHealth,
};
use vault_store::{ArtifactStore, FsArtifactStore, MemArtifactStore};

pub fn auth() -> ConfigKind {
    ConfigKind::new("proxy-auth").unwrap()
}

pub fn clients() -> ConfigKind {
    ConfigKind::new("keyserver-clients").unwrap()
}

pub fn node(id: &str) -> FleetNode {
    FleetNode {
        id: id.into(),
        name: format!("node {id}"),
        host: format!("{id}.internal"),
        region: "eu-west".into(),
        health_url: format!("http://{id}.internal/health"),
    }
}

#[derive(Debug, Clone, Default)]
struct SimNode {
    reachable: bool,
    applied: BTreeMap<ConfigKind, u64>,
    errors: BTreeMap<ConfigKind, (u64, String)>,
}

/// In-process stand-in for the remote fleet. Nodes report whatever the
/// test told them they applied.
#[derive(Default)]
pub struct SimFleet {
    nodes: Mutex<HashMap<String, SimNode>>,
    kinds: Vec<ConfigKind>,
}

impl SimFleet {
    pub fn new(ids: &[&str], kinds: Vec<ConfigKind>) -> Self {
        let nodes = ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    SimNode {
                        reachable: true,
                        ..SimNode::default()
                    },
                )
            })
            .collect();
        Self {
            nodes: Mutex::new(nodes),
            kinds,
        }
    }

    pub fn set_applied(&self, id: &str, kind: &ConfigKind, seq: u64) {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(id).expect("known node");
        node.applied.insert(kind.clone(), seq);
        node.errors.remove(kind);
    }

    /// Every node applies `seq` for `kind`.
    pub fn apply_all(&self, kind: &ConfigKind, seq: u64) {
        let ids: Vec<_> = self.nodes.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.set_applied(&id, kind, seq);
        }
    }

    pub fn fail_apply(&self, id: &str, kind: &ConfigKind, seq: u64, error: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(id).expect("known node");
        node.errors.insert(kind.clone(), (seq, error.to_string()));
    }

    pub fn set_reachable(&self, id: &str, reachable: bool) {
        self.nodes.lock().unwrap().get_mut(id).expect("known node").reachable = reachable;
    }

    /// What a fleet restart with cleared artifact storage looks like.
    pub fn wipe(&self) {
        for node in self.nodes.lock().unwrap().values_mut() {
            node.applied.clear();
            node.errors.clear();
        }
    }
}

#[async_trait]
impl NodeProbe for SimFleet {
    async fn query(&self, node: &FleetNode) -> Result<NodeHealth, ClientError> {
        let nodes = self.nodes.lock().unwrap();
        let Some(sim) = nodes.get(&node.id).filter(|n| n.reachable) else {
            return Err(ClientError::Timeout {
                url: node.health_url.clone(),
            });
        };
        let kinds = self
            .kinds
            .iter()
            .map(|kind| {
                let health = KindHealth {
                    applied: sim.applied.get(kind).map(|&seq| AppliedState { seq, at_ms: 1 }),
                    processing: sim.errors.get(kind).map(|(seq, error)| ProcessingState {
                        seq: *seq,
                        started_at_ms: 1,
                        error: Some(error.clone()),
                    }),
                    entries: 0,
                };
                (kind.clone(), health)
            })
            .collect();
        Ok(NodeHealth {
            node_id: node.id.clone(),
            kinds,
        })
    }
}

/// Snapshot source backed by a map; counts builds and can be slowed down.
#[derive(Default)]
pub struct FakeBuilder {
    entries: Mutex<HashMap<ConfigKind, BTreeMap<String, Value>>>,
    pub builds: AtomicUsize,
    delay: Mutex<Duration>,
}

impl FakeBuilder {
    pub fn set_entry(&self, kind: &ConfigKind, key: &str, value: Value) {
        self.entries
            .lock()
            .unwrap()
            .entry(kind.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotBuilder for FakeBuilder {
    async fn build(&self, kind: &ConfigKind) -> Result<Snapshot, SnapshotError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let entries = self
            .entries
            .lock()
            .unwrap()
            .get(kind)
            .cloned()
            .unwrap_or_default();
        Ok(Snapshot::new(entries))
    }
}

/// Operator service that wipes the simulated fleet and artifact storage on
/// reset.
pub struct FakeOperator {
    fleet: Arc<SimFleet>,
    store: Arc<dyn ArtifactStore>,
    pub resets: AtomicUsize,
    pub fail_reset: AtomicBool,
    pub healthy: AtomicBool,
}

impl FakeOperator {
    pub fn new(fleet: Arc<SimFleet>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            fleet,
            store,
            resets: AtomicUsize::new(0),
            fail_reset: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecoveryService for FakeOperator {
    async fn reset(&self) -> Result<(), ClientError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(ClientError::Status {
                url: "http://operator/reset".into(),
                status: 500,
                body: "reset refused".into(),
            });
        }
        self.fleet.wipe();
        self.store.clear().map_err(|err| ClientError::Status {
            url: "http://operator/reset".into(),
            status: 500,
            body: err.to_string(),
        })
    }

    async fn health(&self) -> Result<OperatorHealth, ClientError> {
        Ok(OperatorHealth {
            services: vec![ServiceHealth {
                name: "keyserver".into(),
                healthy: self.healthy.load(Ordering::SeqCst),
                detail: None,
            }],
        })
    }
}

pub struct Harness<S = MemArtifactStore> {
    pub control: ControlPlane,
    pub fleet: Arc<SimFleet>,
    pub builder: Arc<FakeBuilder>,
    pub operator: Arc<FakeOperator>,
    pub store: Arc<S>,
}

pub struct HarnessOptions {
    pub environment: Environment,
    pub allow_drift_recovery: bool,
    pub liveness_window: Duration,
    pub artifact_retention: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            environment: Environment::Test,
            allow_drift_recovery: true,
            liveness_window: Duration::from_secs(60),
            artifact_retention: 10,
        }
    }
}

impl Harness {
    pub fn new(ids: &[&str]) -> Self {
        Self::with_options(ids, HarnessOptions::default())
    }

    pub fn with_options(ids: &[&str], options: HarnessOptions) -> Self {
        Self::with_store(ids, options, Arc::new(MemArtifactStore::new()))
    }
}

impl Harness<FsArtifactStore> {
    /// Same wiring, with artifacts on disk under `root`.
    pub fn on_disk(ids: &[&str], options: HarnessOptions, root: &Path) -> Self {
        let store = FsArtifactStore::open(root).expect("open artifact store");
        Self::with_store(ids, options, Arc::new(store))
    }
}

impl<S: ArtifactStore + 'static> Harness<S> {
    pub fn with_store(ids: &[&str], options: HarnessOptions, store: Arc<S>) -> Self {
        let mut config = ControlConfig::for_environment(options.environment);
        config.kinds = vec![auth(), clients()];
        config.fleet = ids.iter().map(|id| node(id)).collect();
        config.liveness_window = options.liveness_window;
        config.poll_timeout = Duration::from_millis(500);
        config.recovery_timeout = Duration::from_secs(2);
        config.recovery_probe_interval = Duration::from_millis(10);
        config.allow_drift_recovery = options.allow_drift_recovery;
        config.artifact_retention = options.artifact_retention;

        let fleet = Arc::new(SimFleet::new(ids, config.kinds.clone()));
        let builder = Arc::new(FakeBuilder::default());
        let operator = Arc::new(FakeOperator::new(fleet.clone(), store.clone()));
        let collaborators = Collaborators {
            store: store.clone(),
            builder: builder.clone(),
            probe: fleet.clone(),
            recovery: Some(operator.clone() as Arc<dyn RecoveryService>),
        };
        let control = ControlPlane::new(config, Db::open_in_memory().unwrap(), collaborators)
            .expect("control plane");
        Self {
            control,
            fleet,
            builder,
            operator,
            store,
        }
    }

    /// Publish `kind` `times` times, one change request each.
    pub async fn publish_n(&self, kind: &ConfigKind, times: usize) -> u64 {
        let mut seq = 0;
        for i in 0..times {
            self.builder.set_entry(kind, "rev", Value::from(i as u64));
            let result = self
                .control
                .request_publish_await(kind, vault_protocol::api::TaskSource::Internal)
                .await
                .expect("publish");
            seq = result.row.published_seq;
        }
        seq
    }
}
