use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

/// Parsed `/registry/<kind>/<namespace>/<name>` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey<'a> {
    pub kind: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
}

impl WatchEvent {
    pub fn resource(&self) -> Option<ResourceKey<'_>> {
        parse_registry_key(&self.key)
    }
}

pub fn parse_registry_key(key: &str) -> Option<ResourceKey<'_>> {
    let rest = key.strip_prefix("/registry/")?;
    let mut parts = rest.splitn(3, '/');
    let kind = parts.next()?;
    let namespace = parts.next()?;
    let name = parts.next()?;
    if kind.is_empty() || namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some(ResourceKey {
        kind,
        namespace,
        name,
    })
}

/// Publishes every state mutation, stamped with a monotonic sequence number,
/// to all current subscribers.
#[derive(Clone)]
pub struct EventLog {
    seq: Arc<Mutex<u64>>,
    sender: broadcast::Sender<WatchEvent>,
}

impl EventLog {
    /// Create an event log; a subscriber that falls more than `capacity`
    /// events behind sees `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            seq: Arc::new(Mutex::new(0)),
            sender,
        }
    }

    /// Record a new event. Called by StateStore on put/delete.
    pub async fn emit(&self, event_type: EventType, key: String, value: Option<Vec<u8>>) {
        let mut seq = self.seq.lock().await;
        *seq += 1;
        let event = WatchEvent {
            seq: *seq,
            event_type,
            key,
            value,
        };
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}
