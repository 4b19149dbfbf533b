mod common;

use common::*;
use conductor::api::*;

/// Two healthy nodes, equal price and equal free RAM: placement always picks
/// the lexicographically smaller node id.
#[tokio::test(flavor = "multi_thread")]
async fn equal_candidates_resolve_deterministically() {
    let harness = Harness::new();
    harness.runner.add_host("worker-a", 8192, 4);
    harness.runner.add_host("worker-b", 8192, 4);

    // Control plane too small to compete; long cooldown so the scaler
    // leaves the hand-added nodes alone.
    let mut config = test_config();
    config.control_plane_ram_mb = 256;
    config.idle_cooldown_secs = 600;
    let conductor = harness.start(config).await.unwrap();

    let core = conductor.core().clone();
    core.registry
        .add_node(cloud_node("worker-b", "10.1.0.2".parse().unwrap(), 8192, 4, 100));
    core.registry
        .add_node(cloud_node("worker-a", "10.1.0.1".parse().unwrap(), 8192, 4, 100));

    for _ in 0..3 {
        let workload = conductor.create_workload(1024, 1).await.unwrap();
        let placed = conductor.get_workload(workload.id).await.unwrap();
        assert_eq!(placed.node_id.as_deref(), Some("worker-a"));
        conductor.stop_workload(workload.id).await.unwrap();
    }

    conductor.shutdown().await;
}

/// Cheap nodes saturate before expensive ones, so the costly node can be
/// reclaimed once traffic drops.
#[tokio::test(flavor = "multi_thread")]
async fn cheap_nodes_fill_first() {
    let harness = Harness::new();
    harness.runner.add_host("bargain", 4096, 4);
    harness.runner.add_host("premium", 16384, 8);

    let mut config = test_config();
    config.control_plane_ram_mb = 256;
    config.idle_cooldown_secs = 600;
    let conductor = harness.start(config).await.unwrap();

    let core = conductor.core().clone();
    core.registry
        .add_node(cloud_node("bargain", "10.1.0.3".parse().unwrap(), 4096, 4, 10));
    core.registry
        .add_node(cloud_node("premium", "10.1.0.4".parse().unwrap(), 16384, 8, 90));

    let first = conductor.create_workload(2048, 1).await.unwrap();
    let second = conductor.create_workload(2048, 1).await.unwrap();
    let third = conductor.create_workload(2048, 1).await.unwrap();

    assert_eq!(
        conductor
            .get_workload(first.id)
            .await
            .unwrap()
            .node_id
            .as_deref(),
        Some("bargain")
    );
    assert_eq!(
        conductor
            .get_workload(second.id)
            .await
            .unwrap()
            .node_id
            .as_deref(),
        Some("bargain")
    );
    // The cheap node is full (4096 of 4096); overflow goes to the big one.
    assert_eq!(
        conductor
            .get_workload(third.id)
            .await
            .unwrap()
            .node_id
            .as_deref(),
        Some("premium")
    );

    conductor.shutdown().await;
}
