mod common;

use chrono::Utc;
use common::*;
use conductor::api::*;
use conductor::conductor::reconcile;
use conductor::types::{NodeHealth, workload_name};
use pretty_assertions::assert_eq;
use std::time::Duration;
use uuid::Uuid;

fn running_row(node_id: &str, port: u16) -> Workload {
    Workload {
        id: Uuid::new_v4(),
        ram_mb: 2048,
        cpu_share: 1,
        port,
        node_id: Some(node_id.to_string()),
        container_id: Some("stale".to_string()),
        status: WorkloadStatus::Running,
        created_at: Utc::now(),
        last_started_at: Some(Utc::now()),
        last_stopped_at: None,
        enqueued_at: None,
    }
}

fn queued_row(port: u16, enqueued_offset_secs: i64) -> Workload {
    Workload {
        id: Uuid::new_v4(),
        ram_mb: 1024,
        cpu_share: 1,
        port,
        node_id: None,
        container_id: None,
        status: WorkloadStatus::Queued,
        created_at: Utc::now(),
        last_started_at: None,
        last_stopped_at: None,
        enqueued_at: Some(Utc::now() + chrono::Duration::seconds(enqueued_offset_secs)),
    }
}

/// Restart adoption: rows running on two nodes, containers observable on
/// both, cloud node restored from the provider; after startup the registry,
/// slots and proxy routes all match.
#[tokio::test(flavor = "multi_thread")]
async fn restart_adopts_containers_nodes_and_routes() {
    let harness = Harness::new();
    harness.runner.add_host("mc-worker-1", 8192, 4);
    harness
        .cloud
        .seed_server("mc-worker-1", "10.1.0.5".parse().unwrap(), "w-medium");

    let local = running_row("local-node", 25600);
    let remote_a = running_row("mc-worker-1", 25601);
    let remote_b = running_row("mc-worker-1", 25602);
    for w in [&local, &remote_a, &remote_b] {
        harness.store.insert_workload(w).await.unwrap();
        let node = w.node_id.as_deref().unwrap();
        harness.runner.plant_container(node, &workload_name(&w.id));
    }

    let mut config = test_config();
    config.cloud_token = Some("test-token".to_string());
    let conductor = harness.start(config).await.unwrap();
    let core = conductor.core().clone();

    // Both nodes present; the restored VM starts unknown.
    assert_eq!(core.registry.node_count(), 2);
    assert_eq!(
        core.registry.get_node("mc-worker-1").unwrap().health,
        NodeHealth::Unknown
    );

    // Slots match the observed containers.
    assert!(core.registry.has_slot("local-node", local.id));
    assert!(core.registry.has_slot("mc-worker-1", remote_a.id));
    assert!(core.registry.has_slot("mc-worker-1", remote_b.id));
    let worker = core.registry.get_node("mc-worker-1").unwrap();
    assert_eq!(worker.reserved_ram_mb, 4096);

    // All three routes restored.
    assert_eq!(harness.proxy.route_count(), 3);
    assert_eq!(
        harness.proxy.route(&workload_name(&remote_a.id)).unwrap(),
        "10.1.0.5:25601"
    );

    conductor.shutdown().await;
}

/// A row that claims to run where no container exists is errored; a
/// container with no row is left untouched.
#[tokio::test(flavor = "multi_thread")]
async fn divergence_is_resolved_toward_observed_state() {
    let harness = Harness::new();

    let ghost = running_row("local-node", 25600);
    harness.store.insert_workload(&ghost).await.unwrap();
    let orphan_name = workload_name(&Uuid::new_v4());
    harness.runner.plant_container("local-node", &orphan_name);

    let conductor = harness.start(test_config()).await.unwrap();

    let row = conductor.get_workload(ghost.id).await.unwrap();
    assert_eq!(row.status, WorkloadStatus::Errored);
    assert!(conductor.core().registry.find_slot(ghost.id).is_none());

    // The orphan container (valid name, no row) survives reconciliation.
    assert!(harness
        .runner
        .container_names("local-node")
        .contains(&orphan_name));

    conductor.shutdown().await;
}

/// Queued rows are restored oldest-first and keep their order.
#[tokio::test(flavor = "multi_thread")]
async fn queued_rows_restore_in_enqueue_order() {
    let harness = Harness::new();
    let older = queued_row(25600, -120);
    let newer = queued_row(25601, -30);
    harness.store.insert_workload(&newer).await.unwrap();
    harness.store.insert_workload(&older).await.unwrap();

    // A tiny control plane keeps them queued instead of starting.
    let mut config = test_config();
    config.control_plane_ram_mb = 256;
    let conductor = harness.start(config).await.unwrap();

    let items = conductor.core().queue.items();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].workload_id, older.id);
    assert_eq!(items[1].workload_id, newer.id);

    conductor.shutdown().await;
}

/// Running reconciliation twice with no state change leaves the registry and
/// queue snapshots identical.
#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_is_idempotent() {
    let harness = Harness::new();
    harness.runner.add_host("mc-worker-1", 8192, 4);
    harness
        .cloud
        .seed_server("mc-worker-1", "10.1.0.5".parse().unwrap(), "w-medium");

    let running = running_row("mc-worker-1", 25600);
    harness.store.insert_workload(&running).await.unwrap();
    harness
        .runner
        .plant_container("mc-worker-1", &workload_name(&running.id));
    let queued = queued_row(25601, 0);
    harness.store.insert_workload(&queued).await.unwrap();

    let mut config = test_config();
    config.cloud_token = Some("test-token".to_string());
    config.control_plane_ram_mb = 256; // keep the queued row queued
    let conductor = harness.start(config).await.unwrap();
    let core = conductor.core().clone();

    let nodes_before: Vec<(String, u64, u32)> = core
        .registry
        .snapshot()
        .into_iter()
        .map(|n| (n.node_id, n.reserved_ram_mb, n.reserved_cpu))
        .collect();
    let queue_before: Vec<Uuid> = core.queue.items().iter().map(|e| e.workload_id).collect();

    reconcile::run(&core).await.unwrap();

    let nodes_after: Vec<(String, u64, u32)> = core
        .registry
        .snapshot()
        .into_iter()
        .map(|n| (n.node_id, n.reserved_ram_mb, n.reserved_cpu))
        .collect();
    let queue_after: Vec<Uuid> = core.queue.items().iter().map(|e| e.workload_id).collect();

    assert_eq!(nodes_before, nodes_after);
    assert_eq!(queue_before, queue_after);
    assert_eq!(
        conductor.get_workload(running.id).await.unwrap().status,
        WorkloadStatus::Running
    );

    conductor.shutdown().await;
}

/// Shutdown leaves running workloads alone; a fresh Conductor over the same
/// store and hosts re-adopts them with their original placement.
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_and_restart_preserve_running_workloads() {
    let harness = Harness::new();
    let conductor = harness.start(test_config()).await.unwrap();

    let workload = conductor.create_workload(2048, 1).await.unwrap();
    conductor.shutdown().await;

    // The container is still there after shutdown.
    assert!(harness
        .runner
        .container_names("local-node")
        .contains(&workload_name(&workload.id)));
    let row = harness
        .store
        .get_workload(workload.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, WorkloadStatus::Running);

    // Second generation re-adopts.
    let conductor = harness.start(test_config()).await.unwrap();
    let row = conductor.get_workload(workload.id).await.unwrap();
    assert_eq!(row.status, WorkloadStatus::Running);
    assert_eq!(row.node_id.as_deref(), Some("local-node"));
    assert!(conductor.core().registry.has_slot("local-node", workload.id));

    conductor.shutdown().await;
}

/// Reconciliation completes quickly against responsive hosts.
#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_is_fast_on_responsive_hosts() {
    let harness = Harness::new();
    for i in 0..5 {
        let w = running_row("local-node", 25600 + i);
        harness.store.insert_workload(&w).await.unwrap();
        harness
            .runner
            .plant_container("local-node", &workload_name(&w.id));
    }

    let started = std::time::Instant::now();
    let conductor = harness.start(test_config()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    conductor.shutdown().await;
}
