use crate::conductor::{Command, Core, FailureStreak, lifecycle};
use crate::events::EventKind;
use crate::types::{NodeHealth, NodeKind};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, warn};

/// Consecutive failed probes before a healthy node is marked unhealthy.
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// Periodically probe every node and feed the outcomes through the ingress.
///
/// Probes run in parallel, capped so a large fleet cannot starve the blocking
/// thread pool; each probe must answer within half the tick interval.
pub async fn run_health_loop(
    core: Arc<Core>,
    ingress_tx: mpsc::Sender<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Small start offset so a fleet of restarts does not probe in lockstep.
    let jitter = rand::thread_rng().gen_range(0..1000);
    tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;

    let mut ticker = tokio::time::interval(core.config.health_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let concurrency = num_cpus::get().max(4);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut streak = FailureStreak::new("health probe round");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if probe_round(&core, &ingress_tx, &semaphore).await {
                    streak.success();
                } else {
                    streak.failure(&"ingress unavailable");
                    return;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// One probe pass over the fleet. Returns false when the ingress is gone.
async fn probe_round(
    core: &Arc<Core>,
    ingress_tx: &mpsc::Sender<Command>,
    semaphore: &Arc<Semaphore>,
) -> bool {
    let nodes = core.registry.snapshot();
    let deadline = core.config.probe_timeout();

    let probes = nodes.into_iter().filter(|n| n.health != NodeHealth::Gone).map(|node| {
        let core = core.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let ok = tokio::time::timeout(deadline, core.docker.probe(&node))
                .await
                .unwrap_or(false);
            (node.node_id, ok)
        }
    });

    let outcomes = futures::future::join_all(probes).await;
    for (node_id, ok) in outcomes {
        if ingress_tx
            .send(Command::ProbeOutcome { node_id, ok })
            .await
            .is_err()
        {
            return false;
        }
    }
    true
}

/// Apply one probe outcome. Runs on the ingress so health transitions are
/// serialised with every other mutation.
pub async fn apply_probe(core: &Arc<Core>, node_id: &str, ok: bool) {
    let record = match core.registry.record_probe(node_id, ok) {
        Ok(record) => record,
        Err(err) => {
            debug!("probe result for unknown node {}: {}", node_id, err);
            return;
        }
    };

    if ok {
        if record.previous != record.health {
            core.events
                .publish_node(EventKind::NodeHealthChanged, node_id, Some("healthy"));
        }
        return;
    }

    let kind = core
        .registry
        .get_node(node_id)
        .map(|n| n.kind)
        .unwrap_or(NodeKind::CloudVm);

    if record.health == NodeHealth::Healthy
        && record.consecutive_failures >= UNHEALTHY_AFTER_FAILURES
    {
        warn!(
            "node {} unreachable for {} probes, marking unhealthy",
            node_id, record.consecutive_failures
        );
        let _ = core.registry.set_health(node_id, NodeHealth::Unhealthy);
        core.events
            .publish_node(EventKind::NodeHealthChanged, node_id, Some("unhealthy"));
        return;
    }

    if record.health == NodeHealth::Unhealthy
        && record.consecutive_failures >= core.config.unhealthy_evict_probes
    {
        // The control plane is never evicted, however long it flaps.
        if kind == NodeKind::ControlPlane {
            warn!(
                "control-plane node {} still unreachable after {} probes",
                node_id, record.consecutive_failures
            );
            return;
        }
        let _ = core.registry.set_health(node_id, NodeHealth::Draining);
        core.events
            .publish_node(EventKind::NodeHealthChanged, node_id, Some("draining"));
        lifecycle::evict_unreachable(core, node_id).await;
    }
}
