//! Periodic driver: re-enqueues the fleet poll and the publish sweep on a
//! fixed interval until shutdown.
//!
//! Ticks use the same dedup keys as on-demand triggers, so a tick that lands
//! while an API-triggered task runs joins it.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use vault_protocol::api::TaskSource;

use crate::control::ControlPlane;
use crate::scheduler::Task;

pub fn spawn_periodic(
    control: ControlPlane,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(?interval, "periodic driver started");
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(&control),
                _ = shutdown_rx.recv() => {
                    tracing::info!("periodic driver stopping");
                    break;
                }
            }
        }
    })
}

fn tick(control: &ControlPlane) {
    let poll = control.enqueue(Task::PollFleet, TaskSource::Periodic);
    let sweep = control.enqueue(Task::PublishAll, TaskSource::Periodic);
    tracing::trace!(
        poll_joined = !poll.created,
        sweep_joined = !sweep.created,
        "periodic tick"
    );
}
