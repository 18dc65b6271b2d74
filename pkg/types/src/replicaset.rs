use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::meta::ObjectMeta;
use crate::pod::PodTemplateSpec;

// --- ReplicaSet status ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default)]
    pub observed_generation: u64,
}

// --- ReplicaSet spec ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetSpec {
    pub replicas: i32,
    #[serde(default)]
    pub min_ready_seconds: i32,
    /// Label selector for matching pods
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    pub template: PodTemplateSpec,
}

// --- ReplicaSet ---

/// A fixed-template group of pod replicas owned by a Rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub metadata: ObjectMeta,
    pub spec: ReplicaSetSpec,
    #[serde(default)]
    pub status: ReplicaSetStatus,
}

impl ReplicaSet {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Value of `label` on the ReplicaSet, typically the pod-template-hash.
    pub fn label(&self, label: &str) -> Option<&str> {
        self.metadata.labels.get(label).map(String::as_str)
    }

    /// Replicas that are both desired and available: the capacity that is
    /// safe to count on when deciding how far another ReplicaSet may shrink.
    pub fn available_for_scale_down(&self) -> i32 {
        self.spec.replicas.min(self.status.available_replicas)
    }
}
