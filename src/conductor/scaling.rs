use crate::cloud::{self, CloudProvider};
use crate::conductor::{Command, Core, FailureStreak};
use crate::types::{Node, NodeHealth, NodeKind, Workload};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Headroom multiplier over the worst pending requirement when choosing an
/// instance class (RAM × 1.25).
const OVERHEAD_NUM: u64 = 5;
const OVERHEAD_DEN: u64 = 4;

/// Fleet sizing: provision when the queue cannot drain, drain idle cloud
/// nodes, destroy drained ones, optionally consolidate onto cheaper nodes.
/// Runs only when a cloud provider is configured.
pub async fn run_scaling_loop(
    core: Arc<Core>,
    ingress_tx: mpsc::Sender<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Some(cloud) = core.cloud.clone() else {
        info!("no cloud credential, scaling loop idle");
        return;
    };

    let mut ticker = tokio::time::interval(core.config.scale_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut streak = FailureStreak::new("scaling tick");
    let mut destroyed = HashSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tick(&core, &cloud, &ingress_tx, &mut destroyed).await {
                    Ok(()) => streak.success(),
                    Err(err) => streak.failure(&err),
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

/// One scaling pass. `destroyed` remembers VMs already destroyed so a slow
/// ingress cannot cause a second destroy for the same node.
pub async fn tick(
    core: &Arc<Core>,
    cloud: &Arc<dyn CloudProvider>,
    ingress_tx: &mpsc::Sender<Command>,
    destroyed: &mut HashSet<String>,
) -> crate::error::Result<()> {
    let nodes = core.registry.snapshot();
    let queued = core.store.queued_in_order().await?;

    if core.config.scaling_enabled {
        scale_up(core, cloud, ingress_tx, &nodes, &queued).await?;
    }
    drain_idle(core, ingress_tx, &nodes).await;
    destroy_drained(core, cloud, ingress_tx, &nodes, destroyed).await;
    if core.config.cost_optimisation_enabled {
        consolidate(core, ingress_tx, &nodes).await?;
    }
    Ok(())
}

/// Provision at most one node per tick when some queued workload fits no
/// healthy node's free capacity.
async fn scale_up(
    core: &Arc<Core>,
    cloud: &Arc<dyn CloudProvider>,
    ingress_tx: &mpsc::Sender<Command>,
    nodes: &[Node],
    queued: &[Workload],
) -> crate::error::Result<()> {
    let unfit_ram = queued
        .iter()
        .filter(|w| !fits_somewhere(nodes, w.ram_mb, w.cpu_share))
        .map(|w| w.ram_mb)
        .max();
    let Some(worst) = unfit_ram else {
        return Ok(());
    };

    // A VM that is still warming up counts as capacity on the way; never
    // stack a second provision behind it.
    let warming = nodes
        .iter()
        .any(|n| n.kind == NodeKind::CloudVm && n.health == NodeHealth::Unknown);
    if warming {
        debug!("provision pending, skipping up-scale this tick");
        return Ok(());
    }

    let target_ram = worst * OVERHEAD_NUM / OVERHEAD_DEN;
    let Some(class) = cloud::cheapest_class_for(target_ram) else {
        core.alert(&format!(
            "no instance class satisfies {target_ram} MB, queue is stuck"
        ));
        return Ok(());
    };

    info!(
        "📈 queue pressure ({} MB unfit), provisioning class {}",
        worst, class.name
    );
    let handle = cloud.create_node(&class, &core.config.ssh_key_id).await?;
    let _ = ingress_tx
        .send(Command::AdoptProvisionedNode { handle })
        .await;
    Ok(())
}

fn fits_somewhere(nodes: &[Node], ram_mb: u64, cpu_share: u32) -> bool {
    nodes.iter().any(|n| {
        n.health == NodeHealth::Healthy && n.free_ram_mb() >= ram_mb && n.free_cpu() >= cpu_share
    })
}

/// Healthy cloud nodes with no reservations for longer than the cooldown get
/// drained. The control plane is never a candidate.
async fn drain_idle(core: &Arc<Core>, ingress_tx: &mpsc::Sender<Command>, nodes: &[Node]) {
    let cooldown = chrono::Duration::from_std(core.config.idle_cooldown()).unwrap_or_default();
    for node in nodes {
        if node.kind != NodeKind::CloudVm || node.health != NodeHealth::Healthy {
            continue;
        }
        if node.reserved_ram_mb > 0 {
            continue;
        }
        let Some(idle_since) = node.idle_since else {
            continue;
        };
        if Utc::now() - idle_since >= cooldown {
            let _ = ingress_tx
                .send(Command::DrainNode {
                    node_id: node.node_id.clone(),
                    reason: "idle past cooldown".to_string(),
                })
                .await;
        }
    }
}

/// Draining cloud nodes with no remaining slots: destroy the VM, then tell
/// the ingress to drop the record. Destroy-then-remove means a failed destroy
/// is retried on the next tick, and a 404 from the provider counts as done.
async fn destroy_drained(
    core: &Arc<Core>,
    cloud: &Arc<dyn CloudProvider>,
    ingress_tx: &mpsc::Sender<Command>,
    nodes: &[Node],
    destroyed: &mut HashSet<String>,
) {
    for node in nodes {
        if node.kind != NodeKind::CloudVm || node.health != NodeHealth::Draining {
            continue;
        }
        if destroyed.contains(&node.node_id) {
            continue;
        }
        let slots_left = core
            .registry
            .slots_on(&node.node_id)
            .map(|s| s.len())
            .unwrap_or(0);
        if slots_left > 0 {
            continue;
        }
        let Some(origin) = node.origin.as_deref() else {
            // Nothing to destroy at the provider; just drop the record.
            destroyed.insert(node.node_id.clone());
            let _ = ingress_tx
                .send(Command::NodeGone {
                    node_id: node.node_id.clone(),
                })
                .await;
            continue;
        };
        match cloud.destroy(origin).await {
            Ok(()) => {
                destroyed.insert(node.node_id.clone());
                let _ = ingress_tx
                    .send(Command::NodeGone {
                        node_id: node.node_id.clone(),
                    })
                    .await;
            }
            Err(err) => {
                debug!("destroy of {} deferred: {}", node.node_id, err);
            }
        }
    }
}

/// Consolidation: at most one relocation per tick, moving the smallest
/// running workload from a pricey node onto a strictly cheaper one that can
/// hold it.
async fn consolidate(
    core: &Arc<Core>,
    ingress_tx: &mpsc::Sender<Command>,
    nodes: &[Node],
) -> crate::error::Result<()> {
    let running = core
        .store
        .list_by_status(crate::types::WorkloadStatus::Running)
        .await?;

    let mut best: Option<(Workload, String)> = None;
    for workload in running {
        let Some(from_id) = workload.node_id.as_deref() else {
            continue;
        };
        let Some(from) = nodes.iter().find(|n| n.node_id == from_id) else {
            continue;
        };
        let target = nodes
            .iter()
            .filter(|n| {
                n.health == NodeHealth::Healthy
                    && n.hourly_price_milli < from.hourly_price_milli
                    && n.free_ram_mb() >= workload.ram_mb
                    && n.free_cpu() >= workload.cpu_share
            })
            .min_by_key(|n| (n.hourly_price_milli, n.node_id.clone()));
        if let Some(target) = target {
            let candidate = (workload, target.node_id.clone());
            let better = match &best {
                Some((current, _)) => candidate.0.ram_mb < current.ram_mb,
                None => true,
            };
            if better {
                best = Some(candidate);
            }
        }
    }

    if let Some((workload, to_node)) = best {
        info!(
            "💸 consolidating {} onto cheaper node {}",
            workload.id, to_node
        );
        let _ = ingress_tx
            .send(Command::RelocateWorkload {
                id: workload.id,
                to_node,
            })
            .await;
    }
    Ok(())
}
