//! Control plane for versioned configuration vaults.
//!
//! Tracks a sequence per configuration kind, turns change requests into
//! content-addressed artifacts, polls the fleet for what each node applied,
//! and decides whether the fleet converged. A node ahead of the ledger is
//! drift; outside production it is repaired by a full reset through the
//! operator service.

pub mod config;
pub mod control;
pub mod convergence;
pub mod db;
pub mod drift;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod http;
pub mod ledger;
pub mod notify;
pub mod periodic;
pub mod publisher;
pub mod scheduler;
pub mod snapshot;

pub use config::{ControlConfig, Environment, HttpServerConfig};
pub use control::ControlPlane;
pub use db::Db;
pub use drift::{RecoveryError, RecoveryService, operator_client};
pub use engine::{Collaborators, PollCycle, RecoveryOutcome};
pub use error::ControlError;
pub use fleet::poller::{HttpNodeProbe, NodeProbe};
pub use fleet::{FleetManifest, FleetNode};
pub use ledger::{LedgerRow, SequenceLedger};
pub use publisher::PublishResult;
pub use scheduler::{Task, TaskError, TaskHandle, TaskOutput};
pub use snapshot::{JsonDirSnapshotBuilder, Snapshot, SnapshotBuilder, SnapshotError};
