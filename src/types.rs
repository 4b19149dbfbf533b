use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Name prefix shared by every workload container and proxy entry.
pub const WORKLOAD_PREFIX: &str = "mc-";

/// Derive the container / proxy name for a workload.
pub fn workload_name(id: &Uuid) -> String {
    format!("{WORKLOAD_PREFIX}{id}")
}

/// Parse a workload id back out of a container name. Returns `None` for
/// containers that do not belong to the platform.
pub fn parse_workload_name(name: &str) -> Option<Uuid> {
    name.strip_prefix(WORKLOAD_PREFIX)
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// What kind of host a node is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// The machine running the Conductor itself; also a worker
    ControlPlane,
    /// Dynamically provisioned cloud VM
    CloudVm,
    /// Externally managed bare-metal worker
    Dedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeHealth {
    Unknown,
    Healthy,
    Unhealthy,
    Draining,
    Gone,
}

impl NodeHealth {
    /// A node in this state may accept new placements.
    pub fn accepts_placements(&self) -> bool {
        matches!(self, NodeHealth::Healthy)
    }
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeHealth::Unknown => "unknown",
            NodeHealth::Healthy => "healthy",
            NodeHealth::Unhealthy => "unhealthy",
            NodeHealth::Draining => "draining",
            NodeHealth::Gone => "gone",
        };
        f.write_str(s)
    }
}

/// A worker capable of running workload containers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub kind: NodeKind,
    pub addr: Ipv4Addr,
    /// SSH login user; `None` on the control plane (local exec)
    pub ssh_user: Option<String>,
    pub total_ram_mb: u64,
    pub total_cpu: u32,
    pub reserved_ram_mb: u64,
    pub reserved_cpu: u32,
    pub health: NodeHealth,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Hourly price class used by the scaling heuristics; 0 for hosts the
    /// platform does not pay per hour
    pub hourly_price_milli: u64,
    pub created_at: DateTime<Utc>,
    /// Cloud-provider server id when the node was provisioned by scaling
    pub origin: Option<String>,
    /// Set when the node first reached zero reservations; cleared on placement
    pub idle_since: Option<DateTime<Utc>>,
}

impl Node {
    pub fn free_ram_mb(&self) -> u64 {
        self.total_ram_mb.saturating_sub(self.reserved_ram_mb)
    }

    pub fn free_cpu(&self) -> u32 {
        self.total_cpu.saturating_sub(self.reserved_cpu)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Queued,
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl WorkloadStatus {
    /// Terminal states hold no placement slot.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadStatus::Stopped | WorkloadStatus::Errored)
    }
}

impl std::fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkloadStatus::Queued => "queued",
            WorkloadStatus::Starting => "starting",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopping => "stopping",
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for WorkloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(WorkloadStatus::Queued),
            "starting" => Ok(WorkloadStatus::Starting),
            "running" => Ok(WorkloadStatus::Running),
            "stopping" => Ok(WorkloadStatus::Stopping),
            "stopped" => Ok(WorkloadStatus::Stopped),
            "errored" => Ok(WorkloadStatus::Errored),
            other => Err(format!("unknown workload status: {other}")),
        }
    }
}

/// A single rented game-server instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: Uuid,
    pub ram_mb: u64,
    pub cpu_share: u32,
    /// Host-side port the proxy forwards players to
    pub port: u16,
    /// `None` while queued
    pub node_id: Option<String>,
    /// Container id on the placed node, once started
    pub container_id: Option<String>,
    pub status: WorkloadStatus,
    pub created_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_stopped_at: Option<DateTime<Utc>>,
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl Workload {
    /// Name under which the container runs and the proxy routes.
    pub fn name(&self) -> String {
        workload_name(&self.id)
    }
}

/// Queue bookkeeping for a workload waiting on capacity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub workload_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Capacity reservation tying a workload to a node. Returned by a successful
/// `reserve`, handed back through `release` when the workload reaches a
/// terminal state or is relocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementSlot {
    pub node_id: String,
    pub workload_id: Uuid,
    pub ram_mb: u64,
    pub cpu_share: u32,
}
