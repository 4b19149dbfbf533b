use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle transitions observable by in-process subscribers (billing,
/// dashboards, reconciliation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "workload.queued")]
    WorkloadQueued,
    #[serde(rename = "workload.placed")]
    WorkloadPlaced,
    #[serde(rename = "workload.started")]
    WorkloadStarted,
    #[serde(rename = "workload.stopped")]
    WorkloadStopped,
    #[serde(rename = "workload.errored")]
    WorkloadErrored,
    #[serde(rename = "node.added")]
    NodeAdded,
    #[serde(rename = "node.health_changed")]
    NodeHealthChanged,
    #[serde(rename = "node.removed")]
    NodeRemoved,
    /// Invariant violation; the process keeps running but operators page on it
    #[serde(rename = "conductor.alert")]
    ConductorAlert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkloadQueued => "workload.queued",
            EventKind::WorkloadPlaced => "workload.placed",
            EventKind::WorkloadStarted => "workload.started",
            EventKind::WorkloadStopped => "workload.stopped",
            EventKind::WorkloadErrored => "workload.errored",
            EventKind::NodeAdded => "node.added",
            EventKind::NodeHealthChanged => "node.health_changed",
            EventKind::NodeRemoved => "node.removed",
            EventKind::ConductorAlert => "conductor.alert",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic per-process sequence number
    pub seq: u64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Always carries `workload_id` or `node_id`
    pub payload: serde_json::Value,
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<Event>,
}

/// In-process fan-out publish/subscribe.
///
/// Delivery is best-effort and never blocks the publisher: a subscriber whose
/// buffer is full is dropped from the fan-out list.
pub struct EventBus {
    seq: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, name: &str, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.lock().unwrap().push(Subscriber {
            name: name.to_string(),
            tx,
        });
        debug!("event subscriber registered: {}", name);
        rx
    }

    /// Publish an event to all live subscribers. Returns the sequence number.
    pub fn publish(&self, kind: EventKind, payload: serde_json::Value) -> u64 {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            kind,
            timestamp: Utc::now(),
            payload,
        };

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("dropping blocked event subscriber: {}", sub.name);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event subscriber went away: {}", sub.name);
                false
            }
        });

        event.seq
    }

    pub fn publish_workload(&self, kind: EventKind, workload_id: Uuid) -> u64 {
        self.publish(kind, serde_json::json!({ "workload_id": workload_id }))
    }

    pub fn publish_node(&self, kind: EventKind, node_id: &str, detail: Option<&str>) -> u64 {
        let payload = match detail {
            Some(detail) => serde_json::json!({ "node_id": node_id, "detail": detail }),
            None => serde_json::json!({ "node_id": node_id }),
        };
        self.publish(kind, payload)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a subscription into the store's append-only event log. Used by
/// billing; store failures are logged and never back-pressure publishers.
pub fn spawn_persistence_sink(
    bus: &EventBus,
    store: std::sync::Arc<dyn crate::store::Store>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe("event-log", 256);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(err) = store.append_event(&event).await {
                            warn!("event log append failed (seq {}): {}", event.seq, err);
                        }
                    }
                    None => return,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_with_increasing_sequence() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("a", 8);
        let mut b = bus.subscribe("b", 8);

        let id = Uuid::new_v4();
        let first = bus.publish_workload(EventKind::WorkloadQueued, id);
        let second = bus.publish_workload(EventKind::WorkloadPlaced, id);
        assert!(second > first);

        let got = a.recv().await.unwrap();
        assert_eq!(got.kind, EventKind::WorkloadQueued);
        assert_eq!(got.payload["workload_id"], serde_json::json!(id));

        let got = b.recv().await.unwrap();
        assert_eq!(got.seq, first);
    }

    #[tokio::test]
    async fn full_subscriber_is_dropped_without_blocking() {
        let bus = EventBus::new();
        let _stuck = bus.subscribe("stuck", 1);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish_node(EventKind::NodeAdded, "n1", None);
        // Second publish finds the buffer full and evicts the subscriber.
        bus.publish_node(EventKind::NodeAdded, "n2", None);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
