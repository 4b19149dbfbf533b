use crate::error::{CapacityError, Result};
use crate::registry::NodeRegistry;
use crate::types::{Node, NodeHealth, PlacementSlot};
use tracing::debug;
use uuid::Uuid;

/// Placement hint for a workload being (re)started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementPreference {
    /// Prefer the control-plane node (cheapest, always present)
    ControlPlane,
    /// No preference
    Any,
    /// Restore onto a specific node from a prior placement
    Node(String),
}

/// First-fit-with-preference node selection.
///
/// Candidates are healthy, non-draining nodes ranked preferred-first, then by
/// ascending price class so cheap nodes saturate and expensive ones drain,
/// then by descending free RAM, with the node id as the final tie-break so
/// placement is deterministic. The first node whose `reserve` succeeds wins.
pub fn place(
    registry: &NodeRegistry,
    workload_id: Uuid,
    ram_mb: u64,
    cpu_share: u32,
    preference: &PlacementPreference,
) -> Result<PlacementSlot> {
    let mut candidates: Vec<Node> = registry
        .snapshot()
        .into_iter()
        .filter(|n| n.health == NodeHealth::Healthy)
        .collect();

    rank(&mut candidates, preference);

    for candidate in &candidates {
        match registry.reserve(&candidate.node_id, workload_id, ram_mb, cpu_share) {
            Ok(slot) => {
                debug!(
                    "placed {} on {} ({} MB / {} CPU)",
                    workload_id, candidate.node_id, ram_mb, cpu_share
                );
                return Ok(slot);
            }
            Err(err) if err.is_capacity() => continue,
            // Node vanished between snapshot and reserve; try the next one.
            Err(_) => continue,
        }
    }

    Err(CapacityError::NoCapacity { ram_mb, cpu_share }.into())
}

fn rank(candidates: &mut [Node], preference: &PlacementPreference) {
    candidates.sort_by(|a, b| {
        preference_rank(a, preference)
            .cmp(&preference_rank(b, preference))
            .then(a.hourly_price_milli.cmp(&b.hourly_price_milli))
            .then(b.free_ram_mb().cmp(&a.free_ram_mb()))
            .then(a.node_id.cmp(&b.node_id))
    });
}

fn preference_rank(node: &Node, preference: &PlacementPreference) -> u8 {
    match preference {
        PlacementPreference::ControlPlane => {
            if node.kind == crate::types::NodeKind::ControlPlane {
                0
            } else {
                1
            }
        }
        PlacementPreference::Any => 1,
        PlacementPreference::Node(id) => {
            if &node.node_id == id {
                0
            } else {
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Node, NodeKind};
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use test_case::test_case;

    fn node(id: &str, ram: u64, price: u64) -> Node {
        Node {
            node_id: id.to_string(),
            kind: NodeKind::CloudVm,
            addr: Ipv4Addr::new(10, 0, 0, 2),
            ssh_user: Some("root".to_string()),
            total_ram_mb: ram,
            total_cpu: 8,
            reserved_ram_mb: 0,
            reserved_cpu: 0,
            health: NodeHealth::Healthy,
            last_probe_at: None,
            consecutive_failures: 0,
            hourly_price_milli: price,
            created_at: Utc::now(),
            origin: None,
            idle_since: None,
        }
    }

    fn registry_with(nodes: Vec<Node>) -> NodeRegistry {
        let registry = NodeRegistry::new();
        for n in nodes {
            registry.add_node(n);
        }
        registry
    }

    #[test]
    fn cheapest_node_wins() {
        let registry = registry_with(vec![node("expensive", 8192, 500), node("cheap", 8192, 100)]);
        let slot = place(
            &registry,
            Uuid::new_v4(),
            1024,
            1,
            &PlacementPreference::Any,
        )
        .unwrap();
        assert_eq!(slot.node_id, "cheap");
    }

    // Equal price and equal free RAM: the lexicographically smaller id wins,
    // every time.
    #[test_case("alpha", "beta", "alpha")]
    #[test_case("node-b", "node-a", "node-a")]
    #[test_case("w1", "w10", "w1")]
    fn equal_nodes_tie_break_on_id(first: &str, second: &str, expected: &str) {
        let registry = registry_with(vec![node(first, 4096, 100), node(second, 4096, 100)]);
        let slot = place(
            &registry,
            Uuid::new_v4(),
            512,
            1,
            &PlacementPreference::Any,
        )
        .unwrap();
        assert_eq!(slot.node_id, expected);
    }

    #[test]
    fn preferred_node_outranks_cheaper_ones() {
        let registry = registry_with(vec![node("cheap", 8192, 10), node("prior", 8192, 900)]);
        let slot = place(
            &registry,
            Uuid::new_v4(),
            1024,
            1,
            &PlacementPreference::Node("prior".to_string()),
        )
        .unwrap();
        assert_eq!(slot.node_id, "prior");
    }

    #[test]
    fn full_preferred_node_falls_through() {
        let registry = registry_with(vec![node("tiny", 512, 10), node("big", 8192, 900)]);
        let slot = place(
            &registry,
            Uuid::new_v4(),
            1024,
            1,
            &PlacementPreference::Node("tiny".to_string()),
        )
        .unwrap();
        assert_eq!(slot.node_id, "big");
    }

    #[test]
    fn unhealthy_and_draining_nodes_are_skipped() {
        let mut sick = node("sick", 8192, 1);
        sick.health = NodeHealth::Unhealthy;
        let mut draining = node("draining", 8192, 1);
        draining.health = NodeHealth::Draining;
        let registry = registry_with(vec![sick, draining, node("ok", 8192, 999)]);

        let slot = place(
            &registry,
            Uuid::new_v4(),
            1024,
            1,
            &PlacementPreference::Any,
        )
        .unwrap();
        assert_eq!(slot.node_id, "ok");
    }

    #[test]
    fn no_fit_returns_no_capacity() {
        let registry = registry_with(vec![node("small", 1024, 1)]);
        let err = place(
            &registry,
            Uuid::new_v4(),
            4096,
            1,
            &PlacementPreference::Any,
        )
        .unwrap_err();
        assert!(err.is_capacity());
    }
}
