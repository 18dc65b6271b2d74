use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

/// User-visible record of something the controller did or failed to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub metadata: ObjectMeta,
    pub involved_object: ObjectReference,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event about `object`. The event name is unique per call so
    /// repeated events are kept rather than overwritten.
    pub fn new(
        kind: &str,
        object: &ObjectMeta,
        event_type: EventType,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let name = format!(
            "{}.{:x}",
            object.name,
            now.timestamp_nanos_opt().unwrap_or_default()
        );
        Self {
            metadata: ObjectMeta::new(&object.namespace, &name),
            involved_object: ObjectReference {
                kind: kind.to_string(),
                namespace: object.namespace.clone(),
                name: object.name.clone(),
                uid: object.uid.clone(),
            },
            event_type,
            reason: reason.to_string(),
            message: message.into(),
            timestamp: now,
        }
    }
}
