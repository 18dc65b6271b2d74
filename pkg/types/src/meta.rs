use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- Owner reference ---

/// Reference from a dependent object to the object that manages it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    /// Only one owner per object may be the managing controller.
    #[serde(default)]
    pub controller: bool,
}

// --- Object metadata ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Bumped by the store on every write; updates carrying a stale value
    /// are rejected with a conflict.
    #[serde(default)]
    pub resource_version: u64,
    /// Monotonically increasing generation; bumped on spec changes
    #[serde(default)]
    pub generation: u64,
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: String::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner_references: Vec::new(),
            resource_version: 0,
            generation: 0,
            creation_timestamp: Utc::now(),
        }
    }

    /// `namespace/name`, the key used by the work queue and in log lines.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The owner reference flagged as managing controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    pub fn is_controlled_by(&self, uid: &str) -> bool {
        self.controller_ref().is_some_and(|r| r.uid == uid)
    }
}

/// Split a `namespace/name` queue key.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (ns, name) = key.split_once('/')?;
    if ns.is_empty() || name.is_empty() {
        return None;
    }
    Some((ns, name))
}
