//! Convergence evaluation over ledger rows and last-polled fleet status.
//!
//! A row participates when it was refreshed within the liveness window and
//! reports no apply error. A kind is synced once every participating row has
//! applied at least the published sequence; with no participants it is not
//! synced. Any row ahead of the published sequence is drift, and a drifted
//! kind is never synced. Kinds never published are left out of the
//! fleet-wide rollup.

use std::time::Duration;

use vault_protocol::api::{KindSyncStatus, NodeReachability};

use crate::fleet::{FleetStatusRow, NodeRecord};
use crate::ledger::LedgerRow;

pub fn is_live(last_seen_at_ms: u64, now_ms: u64, liveness: Duration) -> bool {
    now_ms.saturating_sub(last_seen_at_ms) <= liveness.as_millis() as u64
}

fn participates(row: &FleetStatusRow, now_ms: u64, liveness: Duration) -> bool {
    row.last_error.is_none() && is_live(row.last_seen_at_ms, now_ms, liveness)
}

/// Sync status of one kind. Rows for other kinds are ignored.
pub fn sync_status(
    ledger: &LedgerRow,
    rows: &[FleetStatusRow],
    now_ms: u64,
    liveness: Duration,
) -> KindSyncStatus {
    let rows: Vec<_> = rows.iter().filter(|r| r.kind == ledger.kind).collect();
    let participants: Vec<_> = rows
        .iter()
        .filter(|r| participates(r, now_ms, liveness))
        .collect();
    // A live node that has applied nothing yet counts as sequence 0.
    let min_applied_seq = participants
        .iter()
        .map(|r| r.applied_seq.unwrap_or(0))
        .min();
    let max_applied_seq = rows.iter().filter_map(|r| r.applied_seq).max();
    let drifted = max_applied_seq.is_some_and(|max| max > ledger.published_seq);
    KindSyncStatus {
        kind: ledger.kind.clone(),
        current_seq: ledger.published_seq,
        min_applied_seq,
        synced: !drifted && min_applied_seq.is_some_and(|min| min >= ledger.published_seq),
        participating_nodes: participants.len() as u64,
        max_applied_seq,
    }
}

pub fn fleet_synced(kinds: &[KindSyncStatus]) -> bool {
    kinds
        .iter()
        .filter(|k| k.current_seq > 0)
        .all(|k| k.synced)
}

pub fn reachability(
    records: &[NodeRecord],
    now_ms: u64,
    liveness: Duration,
) -> Vec<NodeReachability> {
    records
        .iter()
        .map(|record| NodeReachability {
            node_id: record.node.id.clone(),
            name: record.node.name.clone(),
            region: record.node.region.clone(),
            reachable: record
                .last_seen_at_ms
                .is_some_and(|seen| is_live(seen, now_ms, liveness)),
            last_seen_at_ms: record.last_seen_at_ms,
            last_poll_error: record.last_poll_error.clone(),
        })
        .collect()
}
