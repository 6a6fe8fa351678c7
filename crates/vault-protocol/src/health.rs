//! Self-reported fleet node health.
//!
//! Nodes answer the control plane's health query with a tagged envelope. The
//! `schema` tag versions the body so the poller can decode old and new nodes
//! side by side; everything past the poller works with the latest shape only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ConfigKind;

pub const NODE_HEALTH_SCHEMA_V1: &str = "vault/NodeHealth@1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schema")]
pub enum NodeHealthEnvelope {
    #[serde(rename = "vault/NodeHealth@1")]
    V1(NodeHealth),
}

impl NodeHealthEnvelope {
    pub fn v1(health: NodeHealth) -> Self {
        NodeHealthEnvelope::V1(health)
    }

    /// Normalize any supported schema version into the current shape.
    pub fn into_latest(self) -> NodeHealth {
        match self {
            NodeHealthEnvelope::V1(health) => health,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node_id: String,
    #[serde(default)]
    pub kinds: BTreeMap<ConfigKind, KindHealth>,
}

/// Per-kind apply state as reported by one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindHealth {
    #[serde(default)]
    pub applied: Option<AppliedState>,
    #[serde(default)]
    pub processing: Option<ProcessingState>,
    #[serde(default)]
    pub entries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    pub seq: u64,
    pub at_ms: u64,
}

/// An apply attempt. With `error` set the attempt failed and the node is idle
/// again; without it the node is still working on `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub seq: u64,
    pub started_at_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl KindHealth {
    pub fn applied_seq(&self) -> Option<u64> {
        self.applied.map(|a| a.seq)
    }

    /// Sequence currently being applied; `None` when idle or when the last
    /// attempt failed.
    pub fn processing_seq(&self) -> Option<u64> {
        self.processing
            .as_ref()
            .filter(|p| p.error.is_none())
            .map(|p| p.seq)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.processing.as_ref().and_then(|p| p.error.as_deref())
    }
}
