use crate::error::{CapacityError, ContractError, Result};
use crate::types::{Node, NodeHealth, PlacementSlot};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Health and failure counters observed for a node, as returned by
/// [`NodeRegistry::record_probe`]. Transition policy lives in the health loop.
#[derive(Debug, Clone, Copy)]
pub struct ProbeRecord {
    pub previous: NodeHealth,
    pub health: NodeHealth,
    pub consecutive_failures: u32,
}

struct NodeState {
    node: Node,
    slots: HashMap<Uuid, PlacementSlot>,
}

/// In-memory authoritative map of worker nodes with capacity accounting.
///
/// Node-set mutations take the registry lock; reservation math takes the
/// per-node lock. No lock is ever held across I/O; loops that probe or call
/// out work from [`NodeRegistry::snapshot`].
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<Mutex<NodeState>>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a node. Returns `false` (and leaves the record alone) when a
    /// node with the same id is already present, which keeps restore passes
    /// idempotent.
    pub fn add_node(&self, node: Node) -> bool {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&node.node_id) {
            debug!("node {} already registered", node.node_id);
            return false;
        }
        info!(
            "➕ node {} joined ({} MB RAM, {} CPU, {})",
            node.node_id, node.total_ram_mb, node.total_cpu, node.health
        );
        nodes.insert(
            node.node_id.clone(),
            Arc::new(Mutex::new(NodeState {
                node,
                slots: HashMap::new(),
            })),
        );
        true
    }

    /// Remove a node from the set. Refuses while any workload is placed on it.
    pub fn remove_node(&self, node_id: &str) -> Result<Node> {
        let mut nodes = self.nodes.write().unwrap();
        let entry = nodes
            .get(node_id)
            .ok_or_else(|| ContractError::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
        {
            let state = entry.lock().unwrap();
            if !state.slots.is_empty() {
                return Err(ContractError::NodeBusy {
                    node_id: node_id.to_string(),
                    remaining: state.slots.len(),
                }
                .into());
            }
        }
        let entry = nodes.remove(node_id).unwrap();
        let state = entry.lock().unwrap();
        info!("➖ node {} left the fleet", node_id);
        Ok(state.node.clone())
    }

    fn entry(&self, node_id: &str) -> Result<Arc<Mutex<NodeState>>> {
        let nodes = self.nodes.read().unwrap();
        nodes.get(node_id).cloned().ok_or_else(|| {
            ContractError::NodeNotFound {
                node_id: node_id.to_string(),
            }
            .into()
        })
    }

    pub fn get_node(&self, node_id: &str) -> Result<Node> {
        let entry = self.entry(node_id)?;
        let state = entry.lock().unwrap();
        Ok(state.node.clone())
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        let nodes = self.nodes.read().unwrap();
        nodes
            .values()
            .map(|entry| entry.lock().unwrap().node.clone())
            .collect()
    }

    /// Consistent copy sorted by node id, for loops that must not hold any
    /// registry lock while doing I/O.
    pub fn snapshot(&self) -> Vec<Node> {
        let mut nodes = self.list_nodes();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Reserve capacity for a workload on a specific node. Checks both
    /// dimensions and records the slot in one atomic step under the node lock.
    pub fn reserve(
        &self,
        node_id: &str,
        workload_id: Uuid,
        ram_mb: u64,
        cpu_share: u32,
    ) -> Result<PlacementSlot> {
        let entry = self.entry(node_id)?;
        let mut state = entry.lock().unwrap();

        if !state.node.health.accepts_placements() {
            return Err(CapacityError::NodeUnhealthy {
                node_id: node_id.to_string(),
                health: state.node.health.to_string(),
            }
            .into());
        }
        if state.node.free_ram_mb() < ram_mb || state.node.free_cpu() < cpu_share {
            return Err(CapacityError::InsufficientCapacity {
                node_id: node_id.to_string(),
                ram_mb,
                cpu_share,
            }
            .into());
        }
        if state.slots.contains_key(&workload_id) {
            // A workload never holds two slots; refuse the duplicate.
            error!(
                "workload {} already holds a slot on {}",
                workload_id, node_id
            );
            return Err(CapacityError::InsufficientCapacity {
                node_id: node_id.to_string(),
                ram_mb,
                cpu_share,
            }
            .into());
        }

        state.node.reserved_ram_mb += ram_mb;
        state.node.reserved_cpu += cpu_share;
        state.node.idle_since = None;
        let slot = PlacementSlot {
            node_id: node_id.to_string(),
            workload_id,
            ram_mb,
            cpu_share,
        };
        state.slots.insert(workload_id, slot.clone());
        debug!(
            "reserved {} MB / {} CPU on {} for {}",
            ram_mb, cpu_share, node_id, workload_id
        );
        Ok(slot)
    }

    /// Take a slot for a workload that is already running on the node,
    /// bypassing the health gate. Restore passes use this: a freshly
    /// restored node is still `Unknown` until the health loop probes it,
    /// but its containers are real and must be accounted for.
    pub fn adopt_slot(
        &self,
        node_id: &str,
        workload_id: Uuid,
        ram_mb: u64,
        cpu_share: u32,
    ) -> Result<PlacementSlot> {
        let entry = self.entry(node_id)?;
        let mut state = entry.lock().unwrap();

        if state.slots.contains_key(&workload_id) {
            return Ok(state.slots[&workload_id].clone());
        }
        if state.node.free_ram_mb() < ram_mb || state.node.free_cpu() < cpu_share {
            return Err(CapacityError::InsufficientCapacity {
                node_id: node_id.to_string(),
                ram_mb,
                cpu_share,
            }
            .into());
        }

        state.node.reserved_ram_mb += ram_mb;
        state.node.reserved_cpu += cpu_share;
        state.node.idle_since = None;
        let slot = PlacementSlot {
            node_id: node_id.to_string(),
            workload_id,
            ram_mb,
            cpu_share,
        };
        state.slots.insert(workload_id, slot.clone());
        Ok(slot)
    }

    /// Release a slot. Idempotent: releasing a slot that is no longer
    /// recorded is a no-op.
    pub fn release(&self, slot: &PlacementSlot) {
        let Ok(entry) = self.entry(&slot.node_id) else {
            debug!("release for vanished node {}", slot.node_id);
            return;
        };
        let mut state = entry.lock().unwrap();
        let Some(recorded) = state.slots.remove(&slot.workload_id) else {
            debug!(
                "slot for {} on {} already released",
                slot.workload_id, slot.node_id
            );
            return;
        };

        if state.node.reserved_ram_mb < recorded.ram_mb
            || state.node.reserved_cpu < recorded.cpu_share
        {
            // Accounting went negative; clamp rather than corrupt the registry.
            error!(
                "reservation underflow on {} releasing {}",
                slot.node_id, slot.workload_id
            );
        }
        state.node.reserved_ram_mb = state.node.reserved_ram_mb.saturating_sub(recorded.ram_mb);
        state.node.reserved_cpu = state.node.reserved_cpu.saturating_sub(recorded.cpu_share);
        if state.slots.is_empty() {
            state.node.idle_since = Some(Utc::now());
        }
        debug!(
            "released {} MB / {} CPU on {} from {}",
            recorded.ram_mb, recorded.cpu_share, slot.node_id, slot.workload_id
        );
    }

    pub fn set_health(&self, node_id: &str, health: NodeHealth) -> Result<NodeHealth> {
        let entry = self.entry(node_id)?;
        let mut state = entry.lock().unwrap();
        let previous = state.node.health;
        state.node.health = health;
        if previous != health {
            info!("node {} health {} -> {}", node_id, previous, health);
        }
        Ok(previous)
    }

    /// Record one probe result: updates `last_probe_at` and the consecutive
    /// failure counter, promotes to `Healthy` on success (unless the node is
    /// already draining or gone), and hands the counters back so the health
    /// loop can apply its eviction thresholds.
    pub fn record_probe(&self, node_id: &str, ok: bool) -> Result<ProbeRecord> {
        let entry = self.entry(node_id)?;
        let mut state = entry.lock().unwrap();
        state.node.last_probe_at = Some(Utc::now());
        let previous = state.node.health;
        if ok {
            state.node.consecutive_failures = 0;
            if matches!(
                state.node.health,
                NodeHealth::Unknown | NodeHealth::Unhealthy
            ) {
                state.node.health = NodeHealth::Healthy;
                info!("node {} health {} -> healthy", node_id, previous);
            }
        } else {
            state.node.consecutive_failures += 1;
        }
        Ok(ProbeRecord {
            previous,
            health: state.node.health,
            consecutive_failures: state.node.consecutive_failures,
        })
    }

    pub fn slots_on(&self, node_id: &str) -> Result<Vec<PlacementSlot>> {
        let entry = self.entry(node_id)?;
        let state = entry.lock().unwrap();
        Ok(state.slots.values().cloned().collect())
    }

    pub fn has_slot(&self, node_id: &str, workload_id: Uuid) -> bool {
        self.entry(node_id)
            .map(|entry| entry.lock().unwrap().slots.contains_key(&workload_id))
            .unwrap_or(false)
    }

    /// Locate the (single) slot held by a workload, if any.
    pub fn find_slot(&self, workload_id: Uuid) -> Option<PlacementSlot> {
        let nodes = self.nodes.read().unwrap();
        for entry in nodes.values() {
            let state = entry.lock().unwrap();
            if let Some(slot) = state.slots.get(&workload_id) {
                return Some(slot.clone());
            }
        }
        None
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Narrow capability for collaborators that only need to resolve a node's
/// address (proxy wiring), without seeing the rest of the registry.
pub trait RemoteNodeLookup: Send + Sync {
    fn node_ip(&self, node_id: &str) -> Option<std::net::Ipv4Addr>;
}

impl RemoteNodeLookup for NodeRegistry {
    fn node_ip(&self, node_id: &str) -> Option<std::net::Ipv4Addr> {
        self.get_node(node_id).ok().map(|n| n.addr)
    }
}
