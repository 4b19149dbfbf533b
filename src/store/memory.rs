use crate::error::Result;
use crate::events::Event;
use crate::store::Store;
use crate::types::{Workload, WorkloadStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Map-backed store for tests and ephemeral runs. Same contract as the
/// SQLite store, nothing survives the process.
pub struct MemoryStore {
    workloads: RwLock<HashMap<Uuid, Workload>>,
    events: RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            workloads: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
        }
    }

    pub fn recorded_events(&self) -> Vec<Event> {
        self.events.read().unwrap().clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_workload(&self, workload: &Workload) -> Result<()> {
        self.workloads
            .write()
            .unwrap()
            .insert(workload.id, workload.clone());
        Ok(())
    }

    async fn update_workload(&self, workload: &Workload) -> Result<()> {
        self.workloads
            .write()
            .unwrap()
            .insert(workload.id, workload.clone());
        Ok(())
    }

    async fn get_workload(&self, id: Uuid) -> Result<Option<Workload>> {
        Ok(self.workloads.read().unwrap().get(&id).cloned())
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let mut all: Vec<Workload> = self.workloads.read().unwrap().values().cloned().collect();
        all.sort_by_key(|w| w.created_at);
        Ok(all)
    }

    async fn list_by_status(&self, status: WorkloadStatus) -> Result<Vec<Workload>> {
        let mut matching: Vec<Workload> = self
            .workloads
            .read()
            .unwrap()
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|w| w.created_at);
        Ok(matching)
    }

    async fn delete_workload(&self, id: Uuid) -> Result<()> {
        self.workloads.write().unwrap().remove(&id);
        Ok(())
    }

    async fn queued_in_order(&self) -> Result<Vec<Workload>> {
        let mut queued: Vec<Workload> = self
            .workloads
            .read()
            .unwrap()
            .values()
            .filter(|w| w.status == WorkloadStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|w| (w.enqueued_at, w.created_at));
        Ok(queued)
    }

    async fn append_event(&self, event: &Event) -> Result<()> {
        self.events.write().unwrap().push(event.clone());
        Ok(())
    }
}
