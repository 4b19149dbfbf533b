use crate::types::QueueEntry;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// FIFO queue of workloads waiting for capacity.
///
/// Authoritative at runtime; the store's `status='queued'` rows are the
/// mirror used to rebuild it after a restart. One mutex guards the whole
/// structure; operations are pointer-chasing only and never block on I/O.
pub struct StartQueue {
    inner: Mutex<VecDeque<QueueEntry>>,
}

impl StartQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a workload. Re-enqueueing an id already present keeps its
    /// original position and attempt count.
    pub fn enqueue(&self, workload_id: Uuid) -> QueueEntry {
        let mut queue = self.inner.lock().unwrap();
        if let Some(existing) = queue.iter().find(|e| e.workload_id == workload_id) {
            debug!("workload {} already queued", workload_id);
            return existing.clone();
        }
        let entry = QueueEntry {
            workload_id,
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        queue.push_back(entry.clone());
        entry
    }

    /// Restore an entry with its persisted enqueue time, preserving FIFO
    /// order across restarts. Caller feeds entries oldest-first.
    pub fn restore(&self, entry: QueueEntry) {
        let mut queue = self.inner.lock().unwrap();
        if queue.iter().any(|e| e.workload_id == entry.workload_id) {
            return;
        }
        queue.push_back(entry);
    }

    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Put an entry back at the head, preserving FIFO order. Used both for
    /// capacity misses (attempts untouched) and failed starts (caller bumps
    /// `attempts` first).
    pub fn requeue_front(&self, entry: QueueEntry) {
        let mut queue = self.inner.lock().unwrap();
        queue.retain(|e| e.workload_id != entry.workload_id);
        queue.push_front(entry);
    }

    pub fn remove(&self, workload_id: Uuid) -> bool {
        let mut queue = self.inner.lock().unwrap();
        let before = queue.len();
        queue.retain(|e| e.workload_id != workload_id);
        queue.len() != before
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn items(&self) -> Vec<QueueEntry> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    pub fn contains(&self, workload_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.workload_id == workload_id)
    }
}

impl Default for StartQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = StartQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        queue.enqueue(a);
        queue.enqueue(b);
        queue.enqueue(c);

        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.dequeue().unwrap().workload_id, a);
        assert_eq!(queue.dequeue().unwrap().workload_id, b);
        assert_eq!(queue.dequeue().unwrap().workload_id, c);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn double_enqueue_keeps_position_and_attempts() {
        let queue = StartQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.enqueue(a);
        queue.enqueue(b);
        queue.enqueue(a);

        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.dequeue().unwrap().workload_id, a);
    }

    #[test]
    fn requeue_front_goes_first() {
        let queue = StartQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.enqueue(b);

        let entry = QueueEntry {
            workload_id: a,
            enqueued_at: Utc::now(),
            attempts: 1,
        };
        queue.requeue_front(entry);
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.dequeue().unwrap().workload_id, a);
        assert_eq!(queue.dequeue().unwrap().workload_id, b);
    }

    #[test]
    fn remove_reports_membership() {
        let queue = StartQueue::new();
        let a = Uuid::new_v4();
        queue.enqueue(a);

        assert!(queue.contains(a));
        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert_eq!(queue.depth(), 0);
    }
}
