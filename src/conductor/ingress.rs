use crate::cloud::NodeHandle;
use crate::conductor::{Core, health, lifecycle};
use crate::error::Result;
use crate::events::EventKind;
use crate::types::{NodeHealth, Workload};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A mutation request. Everything that changes Conductor state arrives here;
/// the ingress task applies them one at a time, so no two mutations ever
/// interleave.
pub enum Command {
    CreateWorkload {
        ram_mb: u64,
        cpu_share: u32,
        reply: oneshot::Sender<Result<Workload>>,
    },
    StopWorkload {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteWorkload {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    RetryWorkload {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Register an externally managed (dedicated) worker
    AddNode {
        node: crate::types::Node,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Remove a node that holds no placements
    RemoveNode {
        node_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Try to place and start queued workloads until capacity runs out
    StartNext,
    /// One probe result from the health loop
    ProbeOutcome { node_id: String, ok: bool },
    /// A freshly provisioned VM, reported by the scaling loop
    AdoptProvisionedNode { handle: NodeHandle },
    /// Begin draining a node (idle down-scale or operator action)
    DrainNode { node_id: String, reason: String },
    /// The scaling loop destroyed the backing VM; drop the node record
    NodeGone { node_id: String },
    /// Reconcile proxy routes against the set of running workloads
    ResyncProxy,
    /// Move one workload to a cheaper node (consolidation pass)
    RelocateWorkload { id: Uuid, to_node: String },
    Shutdown,
}

/// The serialising ingress. Single consumer of the command channel; the only
/// place that calls the proxy's write endpoints or mutates workload rows.
pub async fn run_ingress(
    core: Arc<Core>,
    mut rx: mpsc::Receiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!("ingress ready");
    loop {
        let command = tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        match command {
            Command::CreateWorkload {
                ram_mb,
                cpu_share,
                reply,
            } => {
                let result = lifecycle::admit(&core, ram_mb, cpu_share).await;
                if result.is_ok() {
                    lifecycle::drain_queue(&core).await;
                }
                let _ = reply.send(result);
            }
            Command::StopWorkload { id, reply } => {
                let _ = reply.send(lifecycle::stop(&core, id, false).await);
            }
            Command::DeleteWorkload { id, reply } => {
                let _ = reply.send(lifecycle::delete(&core, id).await);
            }
            Command::RetryWorkload { id, reply } => {
                let result = lifecycle::retry(&core, id).await;
                if result.is_ok() {
                    lifecycle::drain_queue(&core).await;
                }
                let _ = reply.send(result);
            }
            Command::AddNode { node, reply } => {
                let node_id = node.node_id.clone();
                let result = if core.registry.add_node(node) {
                    core.events
                        .publish_node(EventKind::NodeAdded, &node_id, Some("dedicated"));
                    lifecycle::drain_queue(&core).await;
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("node {node_id} already registered").into())
                };
                let _ = reply.send(result);
            }
            Command::RemoveNode { node_id, reply } => {
                let result = remove_node(&core, &node_id);
                let _ = reply.send(result);
            }
            Command::StartNext => {
                lifecycle::drain_queue(&core).await;
            }
            Command::ProbeOutcome { node_id, ok } => {
                health::apply_probe(&core, &node_id, ok).await;
            }
            Command::AdoptProvisionedNode { handle } => {
                adopt_provisioned_node(&core, handle);
            }
            Command::DrainNode { node_id, reason } => {
                drain_node(&core, &node_id, &reason);
            }
            Command::NodeGone { node_id } => {
                node_gone(&core, &node_id);
            }
            Command::ResyncProxy => {
                lifecycle::resync_proxy(&core).await;
            }
            Command::RelocateWorkload { id, to_node } => {
                if let Err(err) = lifecycle::relocate(&core, id, &to_node).await {
                    warn!("relocation of {} to {} failed: {}", id, to_node, err);
                }
            }
            Command::Shutdown => break,
        }
    }
    debug!("ingress drained");
}

fn adopt_provisioned_node(core: &Arc<Core>, handle: NodeHandle) {
    let Some(class) = crate::cloud::class_by_name(&handle.class) else {
        core.alert(&format!(
            "provisioned node {} has unknown class {}",
            handle.name, handle.class
        ));
        return;
    };
    let node = crate::types::Node {
        node_id: handle.name.clone(),
        kind: crate::types::NodeKind::CloudVm,
        addr: handle.ip,
        ssh_user: Some(core.config.ssh_user.clone()),
        total_ram_mb: class.ram_mb,
        total_cpu: class.cpu,
        reserved_ram_mb: 0,
        reserved_cpu: 0,
        health: NodeHealth::Unknown,
        last_probe_at: None,
        consecutive_failures: 0,
        hourly_price_milli: class.hourly_price_milli,
        created_at: chrono::Utc::now(),
        origin: Some(handle.origin_id),
        // Cooldown starts at birth so a VM nothing lands on is reclaimed.
        idle_since: Some(chrono::Utc::now()),
    };
    if core.registry.add_node(node) {
        core.events
            .publish_node(EventKind::NodeAdded, &handle.name, Some(&handle.class));
    }
}

fn drain_node(core: &Arc<Core>, node_id: &str, reason: &str) {
    let Ok(node) = core.registry.get_node(node_id) else {
        debug!("drain requested for unknown node {}", node_id);
        return;
    };
    // The control-plane node is never drained or scaled away.
    if node.kind == crate::types::NodeKind::ControlPlane {
        warn!("refusing to drain control-plane node {}", node_id);
        return;
    }
    if matches!(node.health, NodeHealth::Draining | NodeHealth::Gone) {
        return;
    }
    info!("🪣 draining node {} ({})", node_id, reason);
    let _ = core.registry.set_health(node_id, NodeHealth::Draining);
    core.events
        .publish_node(EventKind::NodeHealthChanged, node_id, Some("draining"));
}

fn remove_node(core: &Arc<Core>, node_id: &str) -> Result<()> {
    let node = core.registry.get_node(node_id)?;
    if node.kind == crate::types::NodeKind::ControlPlane {
        return Err(anyhow::anyhow!("the control-plane node cannot be removed").into());
    }
    core.registry.remove_node(node_id)?;
    core.events
        .publish_node(EventKind::NodeRemoved, node_id, None);
    Ok(())
}

fn node_gone(core: &Arc<Core>, node_id: &str) {
    match core.registry.remove_node(node_id) {
        Ok(_) => {
            core.events
                .publish_node(EventKind::NodeRemoved, node_id, None);
        }
        Err(err) => {
            core.alert(&format!(
                "destroyed node {node_id} could not be removed: {err}"
            ));
        }
    }
}
