//! JSON bodies of the control plane's operational HTTP surface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::ConfigKind;

/// Who asked for a task. Carried for logging and for the sync-all response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Interactive,
    Periodic,
    Internal,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Interactive => "interactive",
            TaskSource::Periodic => "periodic",
            TaskSource::Internal => "internal",
        }
    }
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" | "api" => Ok(TaskSource::Interactive),
            "periodic" | "timer" => Ok(TaskSource::Periodic),
            "internal" => Ok(TaskSource::Internal),
            other => Err(format!(
                "unknown source '{other}' (expected interactive, periodic or internal)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LedgerHealth {
    pub kind: ConfigKind,
    pub published_seq: u64,
    pub requested_seq: u64,
    pub has_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub ok: bool,
    pub kinds: Vec<LedgerHealth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Unchanged,
    Published,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PublishSummary {
    pub kind: ConfigKind,
    pub outcome: PublishOutcome,
    pub published_seq: u64,
    pub content_changed: bool,
    pub content_hash: Option<String>,
    pub entry_count: u64,
}

/// Response to an enqueue request. `results` is only present when the caller
/// waited for the task to finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueueResponse {
    pub task: String,
    pub source: TaskSource,
    /// False when the request joined a task that was already pending or running.
    pub created: bool,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<PublishSummary>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct KindSyncStatus {
    pub kind: ConfigKind,
    pub current_seq: u64,
    pub min_applied_seq: Option<u64>,
    pub synced: bool,
    /// Live, healthy nodes that took part in the calculation.
    pub participating_nodes: u64,
    /// Largest applied sequence seen on any node, live or not.
    pub max_applied_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct NodeReachability {
    pub node_id: String,
    pub name: String,
    pub region: String,
    pub reachable: bool,
    pub last_seen_at_ms: Option<u64>,
    pub last_poll_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SyncOverview {
    pub synced: bool,
    pub drift_detected: bool,
    pub kinds: Vec<KindSyncStatus>,
    pub nodes: Vec<NodeReachability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct KindStatusDetail {
    pub kind: ConfigKind,
    pub applied_seq: Option<u64>,
    pub applied_at_ms: Option<u64>,
    pub processing_seq: Option<u64>,
    pub processing_started_at_ms: Option<u64>,
    pub last_error: Option<String>,
    pub entry_count: u64,
    pub last_seen_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct NodeStatusDetail {
    pub node_id: String,
    pub name: String,
    pub host: String,
    pub region: String,
    pub last_attempt_at_ms: Option<u64>,
    pub last_poll_error: Option<String>,
    pub kinds: Vec<KindStatusDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FleetStatusReport {
    pub nodes: Vec<NodeStatusDetail>,
}

/// Outcome of a completed drift recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RecoverySummary {
    /// Ledger as observed right after the reset, before any republish.
    pub ledger_after_reset: Vec<LedgerHealth>,
    pub ledger_after_resweep: Vec<LedgerHealth>,
    pub republished: Vec<PublishSummary>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct NotificationView {
    pub id: i64,
    pub severity: Severity,
    pub category: String,
    pub code: String,
    pub message: String,
    #[schema(value_type = Object)]
    pub details: serde_json::Value,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}
