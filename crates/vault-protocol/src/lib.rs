//! Wire types shared by the control plane, fleet nodes and the operator service.
//!
//! Everything here is plain data: the versioned node health envelope that fleet
//! nodes self-report, the operator service's health shape, and the JSON bodies of
//! the control plane's operational HTTP surface.

pub mod api;
pub mod health;
mod kind;
pub mod operator;

pub use health::{
    AppliedState, KindHealth, NODE_HEALTH_SCHEMA_V1, NodeHealth, NodeHealthEnvelope,
    ProcessingState,
};
pub use kind::{ConfigKind, InvalidKind};
pub use operator::{OperatorHealth, ServiceHealth};
