use crate::error::Result;
use crate::events::Event;
use crate::types::{Workload, WorkloadStatus};
use async_trait::async_trait;
use uuid::Uuid;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Durable source of truth for workload rows and the append-only event log.
///
/// At runtime the in-memory structures are authoritative; the store is what
/// survives a restart and what reconciliation rebuilds from.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_workload(&self, workload: &Workload) -> Result<()>;
    async fn update_workload(&self, workload: &Workload) -> Result<()>;
    async fn get_workload(&self, id: Uuid) -> Result<Option<Workload>>;
    async fn list_workloads(&self) -> Result<Vec<Workload>>;
    async fn list_by_status(&self, status: WorkloadStatus) -> Result<Vec<Workload>>;
    async fn delete_workload(&self, id: Uuid) -> Result<()>;
    /// The queue mirror: `status='queued'` rows, oldest enqueue first.
    async fn queued_in_order(&self) -> Result<Vec<Workload>>;
    async fn append_event(&self, event: &Event) -> Result<()>;
}
