//! Conductor - fleet orchestrator for rented game servers
//!
//! This crate hosts short-lived, resource-tagged game-server instances on a
//! heterogeneous fleet (a control-plane machine plus cloud VMs), places and
//! supervises their containers, scales the fleet to match queue pressure, and
//! keeps the front-end proxy's route table in sync with what is running.

pub mod cloud;
pub mod conductor;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod placement;
pub mod proxy;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod store;
pub mod types;

pub use conductor::Conductor;
pub use config::{ConductorConfig, create_example_config};
pub use error::{ConductorError, Result};

// Export main types at root level
pub use types::{Node, NodeHealth, NodeKind, PlacementSlot, Workload, WorkloadStatus};

// Re-export anyhow for compatibility
pub use anyhow;

/// Re-exports for easier API usage
pub mod api {
    pub use crate::cloud::{CloudProvider, InstanceClass, NodeHandle, instance_catalog};
    pub use crate::conductor::{Command, Conductor, Core};
    pub use crate::events::{Event, EventBus, EventKind};
    pub use crate::placement::PlacementPreference;
    pub use crate::proxy::{ProxyHealth, ProxyRegistrar, ProxyServer};
    pub use crate::registry::{NodeRegistry, RemoteNodeLookup};
    pub use crate::remote::{CommandOutput, CommandRunner};
    pub use crate::store::{MemoryStore, SqliteStore, Store};
    pub use crate::{ConductorConfig, Node, Workload, WorkloadStatus};
}
