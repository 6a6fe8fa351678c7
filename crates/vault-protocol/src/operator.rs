//! Health shape returned by the privileged operator service.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorHealth {
    #[serde(default)]
    pub services: Vec<ServiceHealth>,
}

impl OperatorHealth {
    /// True once at least one service is reported and every reported service is up.
    pub fn all_healthy(&self) -> bool {
        !self.services.is_empty() && self.services.iter().all(|s| s.healthy)
    }
}
