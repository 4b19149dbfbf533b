use crate::conductor::Core;
use crate::error::{ContractError, Result};
use crate::events::EventKind;
use crate::placement::{self, PlacementPreference};
use crate::types::{QueueEntry, WORKLOAD_PREFIX, Workload, WorkloadStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Grace period handed to `docker stop` before the runtime kills the process.
const STOP_GRACE_SECS: u32 = 30;

/// Admit a new workload: allocate a port, persist it queued, enqueue it.
pub async fn admit(core: &Arc<Core>, ram_mb: u64, cpu_share: u32) -> Result<Workload> {
    let port = core.allocate_port().await?;
    let now = Utc::now();
    let workload = Workload {
        id: Uuid::new_v4(),
        ram_mb,
        cpu_share,
        port,
        node_id: None,
        container_id: None,
        status: WorkloadStatus::Queued,
        created_at: now,
        last_started_at: None,
        last_stopped_at: None,
        enqueued_at: Some(now),
    };
    core.store.insert_workload(&workload).await?;
    core.queue.enqueue(workload.id);
    core.events
        .publish_workload(EventKind::WorkloadQueued, workload.id);
    info!(
        "📥 workload {} admitted ({} MB / {} CPU, port {})",
        workload.id, ram_mb, cpu_share, port
    );
    Ok(workload)
}

/// Outcome of one start attempt, used by the queue-drain loop.
enum StartOutcome {
    Started,
    /// No node fits right now; the entry went back to the head of the queue
    NoCapacity,
    /// The workload left the queue by other means (errored, stale entry)
    Skipped,
}

/// Pull queued workloads and start them until the first capacity miss.
/// FIFO: a workload that does not fit blocks smaller ones behind it, which
/// keeps admission fair and makes the scaling signal honest.
pub async fn drain_queue(core: &Arc<Core>) {
    while let Some(entry) = core.queue.dequeue() {
        match start_one(core, entry, PlacementPreference::Any).await {
            StartOutcome::Started | StartOutcome::Skipped => continue,
            StartOutcome::NoCapacity => break,
        }
    }
}

async fn start_one(
    core: &Arc<Core>,
    entry: QueueEntry,
    preference: PlacementPreference,
) -> StartOutcome {
    let workload = match core.store.get_workload(entry.workload_id).await {
        Ok(Some(w)) => w,
        Ok(None) => {
            debug!("queued workload {} no longer exists", entry.workload_id);
            return StartOutcome::Skipped;
        }
        Err(err) => {
            warn!("store read for {} failed: {}", entry.workload_id, err);
            core.queue.requeue_front(entry);
            return StartOutcome::NoCapacity;
        }
    };
    if workload.status != WorkloadStatus::Queued {
        debug!(
            "dropping stale queue entry for {} ({})",
            workload.id, workload.status
        );
        return StartOutcome::Skipped;
    }

    let slot = match placement::place(
        &core.registry,
        workload.id,
        workload.ram_mb,
        workload.cpu_share,
        &preference,
    ) {
        Ok(slot) => slot,
        Err(err) if err.is_capacity() => {
            debug!("no capacity for {}: {}", workload.id, err);
            core.queue.requeue_front(entry);
            return StartOutcome::NoCapacity;
        }
        Err(err) => {
            warn!("placement of {} failed: {}", workload.id, err);
            core.queue.requeue_front(entry);
            return StartOutcome::NoCapacity;
        }
    };

    // Reservation and the starting row commit together; a crash between the
    // two is healed by reconciliation trusting observed containers.
    let mut workload = workload;
    workload.status = WorkloadStatus::Starting;
    workload.node_id = Some(slot.node_id.clone());
    workload.enqueued_at = None;
    if let Err(err) = core.store.update_workload(&workload).await {
        warn!("persisting placement of {} failed: {}", workload.id, err);
        core.registry.release(&slot);
        core.queue.requeue_front(entry);
        return StartOutcome::NoCapacity;
    }
    core.events.publish(
        EventKind::WorkloadPlaced,
        serde_json::json!({ "workload_id": workload.id, "node_id": slot.node_id }),
    );

    let node = match core.registry.get_node(&slot.node_id) {
        Ok(node) => node,
        Err(err) => {
            warn!("placed node vanished under {}: {}", workload.id, err);
            core.registry.release(&slot);
            return fail_or_requeue(core, workload, entry).await;
        }
    };

    match core
        .docker
        .run_workload(&node, &workload, &core.config.workload_image)
        .await
    {
        Ok(container_id) => {
            workload.status = WorkloadStatus::Running;
            workload.container_id = Some(container_id);
            workload.last_started_at = Some(Utc::now());
            if let Err(err) = core.store.update_workload(&workload).await {
                warn!("persisting running state of {} failed: {}", workload.id, err);
            }
            register_route(core, &workload, node.addr).await;
            core.events
                .publish_workload(EventKind::WorkloadStarted, workload.id);
            info!("✅ workload {} running on {}", workload.id, node.node_id);
            StartOutcome::Started
        }
        Err(err) => {
            warn!("container start for {} failed: {}", workload.id, err);
            core.registry.release(&slot);
            fail_or_requeue(core, workload, entry).await
        }
    }
}

/// Failed-start policy: re-enqueue once, then park the workload as errored.
async fn fail_or_requeue(
    core: &Arc<Core>,
    mut workload: Workload,
    mut entry: QueueEntry,
) -> StartOutcome {
    if entry.attempts == 0 {
        entry.attempts += 1;
        workload.status = WorkloadStatus::Queued;
        workload.node_id = None;
        workload.enqueued_at = Some(entry.enqueued_at);
        if let Err(err) = core.store.update_workload(&workload).await {
            warn!("re-queue of {} failed to persist: {}", workload.id, err);
        }
        core.queue.requeue_front(entry);
        info!("🔁 workload {} re-queued after failed start", workload.id);
        StartOutcome::Skipped
    } else {
        mark_errored(core, workload).await;
        StartOutcome::Skipped
    }
}

pub async fn mark_errored(core: &Arc<Core>, mut workload: Workload) {
    if let Some(slot) = core.registry.find_slot(workload.id) {
        core.registry.release(&slot);
    }
    workload.status = WorkloadStatus::Errored;
    workload.container_id = None;
    if let Err(err) = core.store.update_workload(&workload).await {
        warn!("persisting errored state of {} failed: {}", workload.id, err);
    }
    if let Err(err) = core.proxy.unregister(&workload.name()).await {
        debug!("proxy unregister for errored {}: {}", workload.id, err);
    }
    core.events
        .publish_workload(EventKind::WorkloadErrored, workload.id);
    warn!("💥 workload {} errored", workload.id);
}

/// Stop a workload. Queued workloads are simply withdrawn; running and
/// starting ones get a graceful `docker stop` followed by `docker rm`.
pub async fn stop(core: &Arc<Core>, id: Uuid, force: bool) -> Result<()> {
    let mut workload = core
        .store
        .get_workload(id)
        .await?
        .ok_or_else(|| ContractError::WorkloadNotFound {
            workload_id: id.to_string(),
        })?;

    match workload.status {
        WorkloadStatus::Queued => {
            core.queue.remove(id);
            workload.status = WorkloadStatus::Stopped;
            workload.enqueued_at = None;
            workload.last_stopped_at = Some(Utc::now());
            core.store.update_workload(&workload).await?;
            core.events
                .publish_workload(EventKind::WorkloadStopped, id);
            return Ok(());
        }
        WorkloadStatus::Running | WorkloadStatus::Starting => {}
        WorkloadStatus::Stopping => return Ok(()),
        WorkloadStatus::Stopped | WorkloadStatus::Errored => {
            return Err(ContractError::InvalidTransition {
                workload_id: id.to_string(),
                from: workload.status.to_string(),
                to: WorkloadStatus::Stopping.to_string(),
            }
            .into());
        }
    }

    workload.status = WorkloadStatus::Stopping;
    core.store.update_workload(&workload).await?;

    let name = workload.name();
    let node = workload
        .node_id
        .as_deref()
        .and_then(|node_id| core.registry.get_node(node_id).ok());

    let container_result = match &node {
        Some(node) => {
            let stopped = core.docker.stop_container(node, &name, STOP_GRACE_SECS).await;
            match stopped {
                Ok(()) => core.docker.remove_container(node, &name, force).await,
                Err(err) if force => {
                    debug!("graceful stop of {} failed ({}), forcing", id, err);
                    core.docker.remove_container(node, &name, true).await
                }
                Err(err) => Err(err),
            }
        }
        // Node record is gone; nothing left to stop.
        None => Ok(()),
    };

    match container_result {
        Ok(()) => {
            if let Some(slot) = core.registry.find_slot(id) {
                core.registry.release(&slot);
            }
            workload.status = WorkloadStatus::Stopped;
            workload.container_id = None;
            workload.last_stopped_at = Some(Utc::now());
            core.store.update_workload(&workload).await?;
            if let Err(err) = core.proxy.unregister(&name).await {
                debug!("proxy unregister for {}: {}", id, err);
            }
            core.events
                .publish_workload(EventKind::WorkloadStopped, id);
            info!("🧯 workload {} stopped", id);
            Ok(())
        }
        Err(err) => {
            warn!("stop of {} failed: {}", id, err);
            mark_errored(core, workload).await;
            Err(err)
        }
    }
}

/// Remove a workload entirely: stop whatever is running, drop the row.
pub async fn delete(core: &Arc<Core>, id: Uuid) -> Result<()> {
    let workload = core
        .store
        .get_workload(id)
        .await?
        .ok_or_else(|| ContractError::WorkloadNotFound {
            workload_id: id.to_string(),
        })?;

    core.queue.remove(id);
    if matches!(
        workload.status,
        WorkloadStatus::Running | WorkloadStatus::Starting | WorkloadStatus::Stopping
    ) {
        if let Err(err) = stop(core, id, true).await {
            warn!("stop during delete of {}: {}", id, err);
        }
    }
    if let Some(slot) = core.registry.find_slot(id) {
        core.registry.release(&slot);
    }
    if let Err(err) = core.proxy.unregister(&workload.name()).await {
        debug!("proxy unregister during delete of {}: {}", id, err);
    }
    core.store.delete_workload(id).await?;
    info!("🗑️  workload {} deleted", id);
    Ok(())
}

/// Re-admit an errored workload into the queue.
pub async fn retry(core: &Arc<Core>, id: Uuid) -> Result<()> {
    let mut workload = core
        .store
        .get_workload(id)
        .await?
        .ok_or_else(|| ContractError::WorkloadNotFound {
            workload_id: id.to_string(),
        })?;

    if workload.status != WorkloadStatus::Errored {
        return Err(ContractError::InvalidTransition {
            workload_id: id.to_string(),
            from: workload.status.to_string(),
            to: WorkloadStatus::Queued.to_string(),
        }
        .into());
    }

    workload.status = WorkloadStatus::Queued;
    workload.node_id = None;
    workload.container_id = None;
    workload.enqueued_at = Some(Utc::now());
    core.store.update_workload(&workload).await?;
    core.queue.enqueue(id);
    core.events.publish_workload(EventKind::WorkloadQueued, id);
    info!("♻️  workload {} re-admitted", id);
    Ok(())
}

/// A draining node's workloads: any container that can no longer be observed
/// is transitioned to errored so its slot frees and the node can be
/// destroyed.
pub async fn evict_unreachable(core: &Arc<Core>, node_id: &str) {
    let Ok(node) = core.registry.get_node(node_id) else {
        return;
    };
    let Ok(slots) = core.registry.slots_on(node_id) else {
        return;
    };

    for slot in slots {
        let workload = match core.store.get_workload(slot.workload_id).await {
            Ok(Some(w)) => w,
            _ => continue,
        };
        match core.docker.inspect_status(&node, &workload.name()).await {
            Ok(Some(state)) if state == "running" => {
                debug!(
                    "container for {} still observable on draining {}",
                    workload.id, node_id
                );
            }
            _ => {
                info!(
                    "workload {} unreachable on draining node {}",
                    workload.id, node_id
                );
                mark_errored(core, workload).await;
            }
        }
    }
}

/// Move one running workload to a specific cheaper node: graceful stop on the
/// old host, immediate restart with a node preference. On any failure the
/// workload falls back into the normal queue/retry path.
pub async fn relocate(core: &Arc<Core>, id: Uuid, to_node: &str) -> Result<()> {
    let workload = core
        .store
        .get_workload(id)
        .await?
        .ok_or_else(|| ContractError::WorkloadNotFound {
            workload_id: id.to_string(),
        })?;
    if workload.status != WorkloadStatus::Running {
        return Err(ContractError::InvalidTransition {
            workload_id: id.to_string(),
            from: workload.status.to_string(),
            to: "relocating".to_string(),
        }
        .into());
    }

    info!("📦 relocating {} to {}", id, to_node);
    stop(core, id, false).await?;

    let mut moved = core
        .store
        .get_workload(id)
        .await?
        .ok_or_else(|| ContractError::WorkloadNotFound {
            workload_id: id.to_string(),
        })?;
    moved.status = WorkloadStatus::Queued;
    moved.enqueued_at = Some(Utc::now());
    core.store.update_workload(&moved).await?;

    let entry = QueueEntry {
        workload_id: id,
        enqueued_at: Utc::now(),
        attempts: 0,
    };
    match start_one(core, entry, PlacementPreference::Node(to_node.to_string())).await {
        StartOutcome::Started => Ok(()),
        // Back in the queue; the pump picks it up on the next tick.
        StartOutcome::NoCapacity | StartOutcome::Skipped => Ok(()),
    }
}

/// Make the proxy's route table equal `{mc-<id> -> node:port}` over running
/// workloads: register what is missing, drop stale platform routes.
pub async fn resync_proxy(core: &Arc<Core>) {
    use crate::registry::RemoteNodeLookup;

    let running = match core.store.list_by_status(WorkloadStatus::Running).await {
        Ok(running) => running,
        Err(err) => {
            warn!("proxy resync skipped, store unavailable: {}", err);
            return;
        }
    };

    let mut desired: HashMap<String, String> = HashMap::new();
    for workload in &running {
        let Some(node_id) = workload.node_id.as_deref() else {
            continue;
        };
        let Some(ip) = core.registry.node_ip(node_id) else {
            debug!("no address for {} (node {})", workload.id, node_id);
            continue;
        };
        desired.insert(workload.name(), format!("{}:{}", ip, workload.port));
    }

    let actual = match core.proxy.list().await {
        Ok(servers) => servers,
        Err(err) => {
            warn!("proxy resync aborted, list failed: {}", err);
            return;
        }
    };

    let mut synced = 0usize;
    for server in &actual {
        let wanted = desired.get(&server.name).cloned();
        match wanted {
            Some(address) if address == server.address => {
                desired.remove(&server.name);
            }
            // Wrong address: leave it in `desired` so the re-register
            // below overwrites the route.
            Some(_) => {}
            None if server.name.starts_with(WORKLOAD_PREFIX) => {
                if let Err(err) = core.proxy.unregister(&server.name).await {
                    warn!("stale route {} not removed: {}", server.name, err);
                }
            }
            None => {}
        }
    }
    for (name, address) in &desired {
        match core.proxy.register(name, address).await {
            Ok(()) => synced += 1,
            Err(err) => warn!("route {} not registered: {}", name, err),
        }
    }
    if synced > 0 {
        info!("🔄 proxy resync registered {} route(s)", synced);
    }
}

async fn register_route(core: &Arc<Core>, workload: &Workload, ip: std::net::Ipv4Addr) {
    let address = format!("{}:{}", ip, workload.port);
    if let Err(err) = core.proxy.register(&workload.name(), &address).await {
        // The proxy monitor resyncs the route table on its next tick.
        warn!("proxy register for {} failed: {}", workload.id, err);
    }
}
