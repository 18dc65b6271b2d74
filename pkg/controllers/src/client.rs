use async_trait::async_trait;
use chrono::Utc;
use pkg_constants::rollout::{EVENT_KIND, REPLICASET_KIND, ROLLOUT_KIND, SERVICE_KIND};
use pkg_constants::state::{EVENTS_PREFIX, REPLICASETS_PREFIX, ROLLOUTS_PREFIX, SERVICES_PREFIX};
use pkg_state::client::StateStore;
use pkg_types::event::Event;
use pkg_types::meta::ObjectMeta;
use pkg_types::replicaset::ReplicaSet;
use pkg_types::rollout::Rollout;
use pkg_types::service::Service;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::patch::merge_patch;

/// Errors returned by the cluster API seam.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict {
        kind: &'static str,
        key: String,
        message: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }
}

/// A stored API object.
pub trait Resource: Serialize + DeserializeOwned + Send + Sync {
    const KIND: &'static str;
    const PREFIX: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn storage_key(&self) -> String {
        registry_key(Self::PREFIX, &self.meta().namespace, &self.meta().name)
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr, $prefix:expr) => {
        impl Resource for $ty {
            const KIND: &'static str = $kind;
            const PREFIX: &'static str = $prefix;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_resource!(Rollout, ROLLOUT_KIND, ROLLOUTS_PREFIX);
impl_resource!(ReplicaSet, REPLICASET_KIND, REPLICASETS_PREFIX);
impl_resource!(Service, SERVICE_KIND, SERVICES_PREFIX);
impl_resource!(Event, EVENT_KIND, EVENTS_PREFIX);

pub fn registry_key(prefix: &str, namespace: &str, name: &str) -> String {
    format!("{}{}/{}", prefix, namespace, name)
}

/// Everything the rollout engine reads from or writes to the cluster.
///
/// Reads may be stale. Updates carry the `resourceVersion` they were read at
/// and fail with [`ApiError::Conflict`] when the stored object moved on.
/// Merge patches are applied unconditionally.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_rollout(&self, namespace: &str, name: &str) -> Result<Rollout, ApiError>;
    async fn list_rollouts(&self) -> Result<Vec<Rollout>, ApiError>;
    async fn update_rollout(&self, rollout: &Rollout) -> Result<Rollout, ApiError>;
    async fn patch_rollout(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Rollout, ApiError>;

    async fn get_replicaset(&self, namespace: &str, name: &str) -> Result<ReplicaSet, ApiError>;
    async fn list_replicasets(&self, namespace: &str) -> Result<Vec<ReplicaSet>, ApiError>;
    async fn create_replicaset(&self, rs: &ReplicaSet) -> Result<ReplicaSet, ApiError>;
    async fn update_replicaset(&self, rs: &ReplicaSet) -> Result<ReplicaSet, ApiError>;
    async fn delete_replicaset(&self, namespace: &str, name: &str) -> Result<(), ApiError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ApiError>;
    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Service, ApiError>;

    async fn record_event(&self, event: &Event) -> Result<(), ApiError>;
}

// ─── StoreClient ───────────────────────────────────────────────────────────

/// [`ClusterClient`] over the SlateDB [`StateStore`].
///
/// Writes go through a single lock so the read-check-write needed for
/// conflict and already-exists detection is atomic within this process.
pub struct StoreClient {
    store: StateStore,
    write_lock: Mutex<()>,
}

impl StoreClient {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn close(self) -> anyhow::Result<()> {
        self.store.close().await
    }

    async fn read<T: Resource>(&self, namespace: &str, name: &str) -> Result<T, ApiError> {
        let key = registry_key(T::PREFIX, namespace, name);
        match self.store.get_json(&key).await {
            Ok(Some(obj)) => Ok(obj),
            Ok(None) => Err(ApiError::NotFound {
                kind: T::KIND,
                key: format!("{}/{}", namespace, name),
            }),
            Err(e) => Err(ApiError::Storage(e.to_string())),
        }
    }

    async fn list<T: Resource>(&self, prefix: &str) -> Result<Vec<T>, ApiError> {
        self.store
            .list_json(prefix)
            .await
            .map_err(|e| ApiError::Storage(e.to_string()))
    }

    async fn write<T: Resource>(&self, obj: &T) -> Result<(), ApiError> {
        self.store
            .put_json(&obj.storage_key(), obj)
            .await
            .map_err(|e| ApiError::Storage(e.to_string()))
    }

    async fn create<T: Resource + Clone>(&self, obj: &T) -> Result<T, ApiError> {
        let _guard = self.write_lock.lock().await;
        let meta = obj.meta();
        match self.read::<T>(&meta.namespace, &meta.name).await {
            Ok(_) => {
                return Err(ApiError::AlreadyExists {
                    kind: T::KIND,
                    key: meta.key(),
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let mut created = obj.clone();
        let meta = created.meta_mut();
        if meta.uid.is_empty() {
            meta.uid = Uuid::new_v4().to_string();
        }
        meta.resource_version = 1;
        meta.generation = 1;
        meta.creation_timestamp = Utc::now();
        self.write(&created).await?;
        debug!("created {} {}", T::KIND, created.meta().key());
        Ok(created)
    }

    async fn update<T: Resource + Clone>(&self, obj: &T) -> Result<T, ApiError> {
        let _guard = self.write_lock.lock().await;
        let meta = obj.meta();
        let current: T = self.read(&meta.namespace, &meta.name).await?;
        let stored_version = current.meta().resource_version;
        if stored_version != meta.resource_version {
            return Err(ApiError::Conflict {
                kind: T::KIND,
                key: meta.key(),
                message: format!(
                    "resourceVersion {} is stale (stored {})",
                    meta.resource_version, stored_version
                ),
            });
        }
        let mut updated = obj.clone();
        let meta = updated.meta_mut();
        meta.resource_version = stored_version + 1;
        meta.uid = current.meta().uid.clone();
        meta.creation_timestamp = current.meta().creation_timestamp;
        self.write(&updated).await?;
        Ok(updated)
    }

    async fn patch<T: Resource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<T, ApiError> {
        let _guard = self.write_lock.lock().await;
        let current: T = self.read(namespace, name).await?;
        let version = current.meta().resource_version;
        let mut doc = serde_json::to_value(&current)?;
        merge_patch(&mut doc, patch);
        let mut patched: T = serde_json::from_value(doc)?;
        patched.meta_mut().resource_version = version + 1;
        self.write(&patched).await?;
        Ok(patched)
    }
}

#[async_trait]
impl ClusterClient for StoreClient {
    async fn get_rollout(&self, namespace: &str, name: &str) -> Result<Rollout, ApiError> {
        self.read(namespace, name).await
    }

    async fn list_rollouts(&self) -> Result<Vec<Rollout>, ApiError> {
        self.list(ROLLOUTS_PREFIX).await
    }

    async fn update_rollout(&self, rollout: &Rollout) -> Result<Rollout, ApiError> {
        self.update(rollout).await
    }

    async fn patch_rollout(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Rollout, ApiError> {
        self.patch(namespace, name, patch).await
    }

    async fn get_replicaset(&self, namespace: &str, name: &str) -> Result<ReplicaSet, ApiError> {
        self.read(namespace, name).await
    }

    async fn list_replicasets(&self, namespace: &str) -> Result<Vec<ReplicaSet>, ApiError> {
        self.list(&format!("{}{}/", REPLICASETS_PREFIX, namespace))
            .await
    }

    async fn create_replicaset(&self, rs: &ReplicaSet) -> Result<ReplicaSet, ApiError> {
        self.create(rs).await
    }

    async fn update_replicaset(&self, rs: &ReplicaSet) -> Result<ReplicaSet, ApiError> {
        self.update(rs).await
    }

    async fn delete_replicaset(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let _guard = self.write_lock.lock().await;
        self.read::<ReplicaSet>(namespace, name).await?;
        self.store
            .delete(&registry_key(REPLICASETS_PREFIX, namespace, name))
            .await
            .map_err(|e| ApiError::Storage(e.to_string()))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ApiError> {
        self.read(namespace, name).await
    }

    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Service, ApiError> {
        self.patch(namespace, name, patch).await
    }

    async fn record_event(&self, event: &Event) -> Result<(), ApiError> {
        self.write(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::pod::PodTemplateSpec;
    use pkg_types::replicaset::ReplicaSetSpec;
    use serde_json::json;

    fn replicaset(name: &str, replicas: i32) -> ReplicaSet {
        ReplicaSet {
            metadata: ObjectMeta::new("default", name),
            spec: ReplicaSetSpec {
                replicas,
                min_ready_seconds: 0,
                selector: Default::default(),
                template: PodTemplateSpec::default(),
            },
            status: Default::default(),
        }
    }

    async fn client() -> (tempfile::TempDir, StoreClient) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_str().unwrap()).await.unwrap();
        (dir, StoreClient::new(store))
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let (_dir, client) = client().await;
        let created = client.create_replicaset(&replicaset("web-a", 1)).await.unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.resource_version, 1);

        let err = client
            .create_replicaset(&replicaset("web-a", 2))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let (_dir, client) = client().await;
        let created = client.create_replicaset(&replicaset("web-a", 1)).await.unwrap();

        let mut first = created.clone();
        first.spec.replicas = 3;
        let updated = client.update_replicaset(&first).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);

        let mut stale = created;
        stale.spec.replicas = 5;
        let err = client.update_replicaset(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = client.get_replicaset("default", "web-a").await.unwrap();
        assert_eq!(stored.spec.replicas, 3);
    }

    #[tokio::test]
    async fn patch_merges_and_missing_objects_are_not_found() {
        let (_dir, client) = client().await;
        let svc = Service {
            metadata: ObjectMeta::new("default", "web-active"),
            spec: Default::default(),
        };
        client.write(&svc).await.unwrap();

        let patched = client
            .patch_service(
                "default",
                "web-active",
                &json!({"spec": {"selector": {"rollouts-pod-template-hash": "abc"}}}),
            )
            .await
            .unwrap();
        assert_eq!(
            patched.selector_value("rollouts-pod-template-hash"),
            Some("abc")
        );

        let err = client.get_service("default", "missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = client.delete_replicaset("default", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn listing_reports_undecodable_entries() {
        let (_dir, client) = client().await;
        client.create_replicaset(&replicaset("web-a", 1)).await.unwrap();
        client.create_replicaset(&replicaset("web-b", 2)).await.unwrap();
        let listed = client.list_replicasets("default").await.unwrap();
        assert_eq!(listed.len(), 2);

        let broken = registry_key(REPLICASETS_PREFIX, "default", "web-c");
        client.store.put(&broken, b"not json").await.unwrap();
        let err = client.list_replicasets("default").await.unwrap_err();
        assert!(err.to_string().contains(&broken), "{}", err);
    }
}
