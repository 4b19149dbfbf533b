use crate::cloud;
use crate::conductor::Core;
use crate::error::Result;
use crate::events::EventKind;
use crate::types::{Node, NodeHealth, NodeKind, QueueEntry, Workload, WorkloadStatus};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Startup (and on-demand) sync of in-memory state with the store, the
/// container runtime on every node, and the proxy.
///
/// Order is mandatory: adopt local containers, rebuild the queue, restore
/// cloud nodes, adopt remote containers, then re-register with the proxy.
/// Running it again with no state change is a no-op.
pub async fn run(core: &Arc<Core>) -> Result<()> {
    info!("🔎 reconciliation starting");
    adopt_node_containers(core, &core.control_plane_node_id()).await?;
    restore_queue(core).await?;
    restore_cloud_nodes(core).await;
    adopt_remote_containers(core).await?;
    orphan_rows_without_node(core).await?;
    reregister_proxy(core).await;
    info!(
        "reconciliation done: {} node(s), {} workload(s) queued",
        core.registry.node_count(),
        core.queue.depth()
    );
    Ok(())
}

/// Steps 1 and 4: list `mc-*` containers on one node, match them to store
/// rows, take a placement slot for each match and mark the row running.
/// Containers without a row are logged and left untouched; rows that claim
/// to run here with no container go to errored.
async fn adopt_node_containers(core: &Arc<Core>, node_id: &str) -> Result<()> {
    let Ok(node) = core.registry.get_node(node_id) else {
        return Ok(());
    };

    let containers = match core.docker.list_workload_containers(&node).await {
        Ok(containers) => containers,
        Err(err) => {
            // Unreachable node: leave it to the health loop, do not error
            // rows yet since the containers may be fine.
            warn!("container listing on {} failed: {}", node_id, err);
            return Ok(());
        }
    };

    for container in &containers {
        let Some(mut workload) = core.store.get_workload(container.workload_id).await? else {
            info!(
                "orphan container {} on {} (no workload row), leaving it",
                container.name, node_id
            );
            continue;
        };
        if !matches!(
            workload.status,
            WorkloadStatus::Running | WorkloadStatus::Starting
        ) {
            debug!(
                "container {} present but row says {}, leaving both",
                container.name, workload.status
            );
            continue;
        }
        if core.registry.has_slot(node_id, workload.id) {
            continue;
        }
        match core
            .registry
            .adopt_slot(node_id, workload.id, workload.ram_mb, workload.cpu_share)
        {
            Ok(_slot) => {
                workload.status = WorkloadStatus::Running;
                workload.node_id = Some(node_id.to_string());
                workload.container_id = Some(container.container_id.clone());
                workload.enqueued_at = None;
                core.store.update_workload(&workload).await?;
                info!("🧲 adopted {} on {}", workload.id, node_id);
            }
            Err(err) => {
                core.alert(&format!(
                    "cannot adopt {} on {node_id}: {err}",
                    workload.id
                ));
            }
        }
    }

    // Rows that claim this node but whose container was not observed.
    for workload in core.store.list_by_status(WorkloadStatus::Running).await? {
        if workload.node_id.as_deref() != Some(node_id) {
            continue;
        }
        let observed = containers.iter().any(|c| c.workload_id == workload.id);
        if !observed {
            warn!(
                "store says {} runs on {} but no container found",
                workload.id, node_id
            );
            error_row(core, workload).await?;
        }
    }
    Ok(())
}

/// Step 2: rebuild the start queue from `status='queued'` rows, oldest first.
async fn restore_queue(core: &Arc<Core>) -> Result<()> {
    for workload in core.store.queued_in_order().await? {
        core.queue.restore(QueueEntry {
            workload_id: workload.id,
            enqueued_at: workload.enqueued_at.unwrap_or(workload.created_at),
            attempts: 0,
        });
    }
    if core.queue.depth() > 0 {
        info!("restored {} queued workload(s)", core.queue.depth());
    }
    Ok(())
}

/// Step 3: enumerate cloud VMs matching the fleet naming convention and
/// re-insert node records with health unknown.
async fn restore_cloud_nodes(core: &Arc<Core>) {
    let Some(cloud) = core.cloud.clone() else {
        return;
    };
    let handles = match cloud.list_nodes().await {
        Ok(handles) => handles,
        Err(err) => {
            warn!("cloud node listing failed, skipping restore: {}", err);
            return;
        }
    };

    for handle in handles {
        let Some(class) = cloud::class_by_name(&handle.class) else {
            warn!(
                "cloud server {} has unknown class {}, not adopting",
                handle.name, handle.class
            );
            continue;
        };
        let node = Node {
            node_id: handle.name.clone(),
            kind: NodeKind::CloudVm,
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
            created_at: Utc::now(),
            origin: Some(handle.origin_id),
            idle_since: Some(Utc::now()),
        };
        if core.registry.add_node(node) {
            core.events
                .publish_node(EventKind::NodeAdded, &handle.name, Some("restored"));
        }
    }
}

/// Step 4 over every non-control-plane node.
async fn adopt_remote_containers(core: &Arc<Core>) -> Result<()> {
    let control_plane = core.control_plane_node_id();
    for node in core.registry.snapshot() {
        if node.node_id == control_plane {
            continue;
        }
        adopt_node_containers(core, &node.node_id).await?;
    }
    Ok(())
}

/// Rows that claim to run on a node the registry does not know at all.
async fn orphan_rows_without_node(core: &Arc<Core>) -> Result<()> {
    let mut rows = core.store.list_by_status(WorkloadStatus::Running).await?;
    rows.extend(core.store.list_by_status(WorkloadStatus::Starting).await?);
    for workload in rows {
        let known = workload
            .node_id
            .as_deref()
            .map(|id| core.registry.get_node(id).is_ok())
            .unwrap_or(false);
        if !known {
            warn!(
                "workload {} references unknown node {:?}",
                workload.id, workload.node_id
            );
            error_row(core, workload).await?;
        }
    }
    Ok(())
}

/// Step 5: re-register every running workload with the proxy. Failures are
/// logged; the proxy monitor retries on its next tick.
async fn reregister_proxy(core: &Arc<Core>) {
    use crate::registry::RemoteNodeLookup;

    let running = match core.store.list_by_status(WorkloadStatus::Running).await {
        Ok(running) => running,
        Err(err) => {
            warn!("proxy re-registration skipped: {}", err);
            return;
        }
    };
    for workload in running {
        let Some(node_id) = workload.node_id.as_deref() else {
            continue;
        };
        let Some(ip) = core.registry.node_ip(node_id) else {
            continue;
        };
        let address = format!("{}:{}", ip, workload.port);
        if let Err(err) = core.proxy.register(&workload.name(), &address).await {
            warn!("proxy re-register of {} failed: {}", workload.id, err);
        }
    }
}

async fn error_row(core: &Arc<Core>, mut workload: Workload) -> Result<()> {
    if let Some(slot) = core.registry.find_slot(workload.id) {
        core.registry.release(&slot);
    }
    workload.status = WorkloadStatus::Errored;
    workload.container_id = None;
    core.store.update_workload(&workload).await?;
    core.events
        .publish_workload(EventKind::WorkloadErrored, workload.id);
    Ok(())
}
