//! In-memory cluster and fixtures for engine tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use pkg_constants::rollout::{
    DESIRED_REPLICAS_ANNOTATION, POD_TEMPLATE_HASH_LABEL, REVISION_ANNOTATION, ROLLOUT_KIND,
};
use pkg_types::event::Event;
use pkg_types::meta::{ObjectMeta, OwnerReference};
use pkg_types::pod::{ContainerSpec, PodSpec, PodTemplateSpec};
use pkg_types::replicaset::{ReplicaSet, ReplicaSetSpec, ReplicaSetStatus};
use pkg_types::rollout::{
    BlueGreenStrategy, CanaryStep, CanaryStrategy, Rollout, RolloutSpec, RolloutStrategy,
};
use pkg_types::service::{Service, ServiceSpec};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::client::{ApiError, ClusterClient, Resource};
use crate::patch::merge_patch;
use crate::rollout::hash::template_hash;

pub const NS: &str = "default";
pub const ROLLOUT_UID: &str = "web-uid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Patch,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub verb: Verb,
    pub kind: &'static str,
    pub name: String,
    /// Patch body for `Patch`, the written object for `Create`/`Update`.
    pub body: Option<Value>,
}

impl Action {
    pub fn is_mutation(&self) -> bool {
        !matches!(self.verb, Verb::Get | Verb::List)
    }
}

#[derive(Default)]
struct FakeState {
    rollouts: BTreeMap<String, Rollout>,
    replicasets: BTreeMap<String, ReplicaSet>,
    services: BTreeMap<String, Service>,
    events: Vec<Event>,
    actions: Vec<Action>,
}

/// [`ClusterClient`] backed by maps, recording every call.
#[derive(Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
}

fn not_found(kind: &'static str, key: &str) -> ApiError {
    ApiError::NotFound {
        kind,
        key: key.to_string(),
    }
}

fn create_in<T: Resource + Clone>(map: &mut BTreeMap<String, T>, obj: &T) -> Result<T, ApiError> {
    let key = obj.meta().key();
    if map.contains_key(&key) {
        return Err(ApiError::AlreadyExists { kind: T::KIND, key });
    }
    let mut created = obj.clone();
    let meta = created.meta_mut();
    if meta.uid.is_empty() {
        meta.uid = format!("{}-uid", meta.name);
    }
    meta.resource_version = 1;
    meta.creation_timestamp = Utc::now();
    map.insert(key, created.clone());
    Ok(created)
}

fn update_in<T: Resource + Clone>(map: &mut BTreeMap<String, T>, obj: &T) -> Result<T, ApiError> {
    let key = obj.meta().key();
    let stored = map.get(&key).ok_or_else(|| not_found(T::KIND, &key))?;
    let version = stored.meta().resource_version;
    if version != obj.meta().resource_version {
        return Err(ApiError::Conflict {
            kind: T::KIND,
            key,
            message: "stale resourceVersion".to_string(),
        });
    }
    let mut updated = obj.clone();
    updated.meta_mut().resource_version = version + 1;
    map.insert(key, updated.clone());
    Ok(updated)
}

fn patch_in<T: Resource + Clone>(
    map: &mut BTreeMap<String, T>,
    key: &str,
    patch: &Value,
) -> Result<T, ApiError> {
    let stored = map.get(key).ok_or_else(|| not_found(T::KIND, key))?;
    let version = stored.meta().resource_version;
    let mut doc = serde_json::to_value(stored)?;
    merge_patch(&mut doc, patch);
    let mut patched: T = serde_json::from_value(doc)?;
    patched.meta_mut().resource_version = version + 1;
    map.insert(key.to_string(), patched.clone());
    Ok(patched)
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, state: &mut FakeState, verb: Verb, kind: &'static str, name: &str, body: Option<Value>) {
        let _ = self;
        state.actions.push(Action {
            verb,
            kind,
            name: name.to_string(),
            body,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_rollout(&self, rollout: Rollout) {
        self.lock().rollouts.insert(rollout.metadata.key(), rollout);
    }

    pub fn add_replicaset(&self, rs: ReplicaSet) {
        self.lock().replicasets.insert(rs.metadata.key(), rs);
    }

    pub fn add_service(&self, svc: Service) {
        self.lock().services.insert(svc.metadata.key(), svc);
    }

    pub fn rollout(&self, name: &str) -> Rollout {
        self.lock().rollouts[&format!("{}/{}", NS, name)].clone()
    }

    pub fn replicaset(&self, name: &str) -> Option<ReplicaSet> {
        self.lock()
            .replicasets
            .get(&format!("{}/{}", NS, name))
            .cloned()
    }

    pub fn replicasets(&self) -> Vec<ReplicaSet> {
        self.lock().replicasets.values().cloned().collect()
    }

    pub fn service(&self, name: &str) -> Service {
        self.lock().services[&format!("{}/{}", NS, name)].clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.lock().actions.clone()
    }

    pub fn mutations(&self) -> Vec<Action> {
        self.actions()
            .into_iter()
            .filter(Action::is_mutation)
            .collect()
    }

    /// Patch bodies sent for `kind`, in order.
    pub fn patches(&self, kind: &str) -> Vec<Value> {
        self.actions()
            .into_iter()
            .filter(|a| a.verb == Verb::Patch && a.kind == kind)
            .filter_map(|a| a.body)
            .collect()
    }

    pub fn clear_actions(&self) {
        let mut state = self.lock();
        state.actions.clear();
        state.events.clear();
    }

    /// Pretend every pod came up: each ReplicaSet reports its spec size as
    /// ready and available.
    pub fn settle(&self) {
        for rs in self.lock().replicasets.values_mut() {
            rs.status.replicas = rs.spec.replicas;
            rs.status.ready_replicas = rs.spec.replicas;
            rs.status.available_replicas = rs.spec.replicas;
        }
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn get_rollout(&self, namespace: &str, name: &str) -> Result<Rollout, ApiError> {
        let mut state = self.lock();
        self.record(&mut state, Verb::Get, ROLLOUT_KIND, name, None);
        let key = format!("{}/{}", namespace, name);
        state
            .rollouts
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(ROLLOUT_KIND, &key))
    }

    async fn list_rollouts(&self) -> Result<Vec<Rollout>, ApiError> {
        let mut state = self.lock();
        self.record(&mut state, Verb::List, ROLLOUT_KIND, "", None);
        Ok(state.rollouts.values().cloned().collect())
    }

    async fn update_rollout(&self, rollout: &Rollout) -> Result<Rollout, ApiError> {
        let mut state = self.lock();
        let body = serde_json::to_value(rollout)?;
        self.record(&mut state, Verb::Update, Rollout::KIND, &rollout.metadata.name, Some(body));
        update_in(&mut state.rollouts, rollout)
    }

    async fn patch_rollout(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Rollout, ApiError> {
        let mut state = self.lock();
        self.record(&mut state, Verb::Patch, Rollout::KIND, name, Some(patch.clone()));
        patch_in(&mut state.rollouts, &format!("{}/{}", namespace, name), patch)
    }

    async fn get_replicaset(&self, namespace: &str, name: &str) -> Result<ReplicaSet, ApiError> {
        let mut state = self.lock();
        self.record(&mut state, Verb::Get, ReplicaSet::KIND, name, None);
        let key = format!("{}/{}", namespace, name);
        state
            .replicasets
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(ReplicaSet::KIND, &key))
    }

    async fn list_replicasets(&self, namespace: &str) -> Result<Vec<ReplicaSet>, ApiError> {
        let mut state = self.lock();
        self.record(&mut state, Verb::List, ReplicaSet::KIND, "", None);
        Ok(state
            .replicasets
            .values()
            .filter(|rs| rs.metadata.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create_replicaset(&self, rs: &ReplicaSet) -> Result<ReplicaSet, ApiError> {
        let mut state = self.lock();
        let body = serde_json::to_value(rs)?;
        self.record(&mut state, Verb::Create, ReplicaSet::KIND, rs.name(), Some(body));
        create_in(&mut state.replicasets, rs)
    }

    async fn update_replicaset(&self, rs: &ReplicaSet) -> Result<ReplicaSet, ApiError> {
        let mut state = self.lock();
        let body = serde_json::to_value(rs)?;
        self.record(&mut state, Verb::Update, ReplicaSet::KIND, rs.name(), Some(body));
        update_in(&mut state.replicasets, rs)
    }

    async fn delete_replicaset(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        self.record(&mut state, Verb::Delete, ReplicaSet::KIND, name, None);
        let key = format!("{}/{}", namespace, name);
        state
            .replicasets
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| not_found(ReplicaSet::KIND, &key))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ApiError> {
        let mut state = self.lock();
        self.record(&mut state, Verb::Get, Service::KIND, name, None);
        let key = format!("{}/{}", namespace, name);
        state
            .services
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(Service::KIND, &key))
    }

    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Service, ApiError> {
        let mut state = self.lock();
        self.record(&mut state, Verb::Patch, Service::KIND, name, Some(patch.clone()));
        patch_in(&mut state.services, &format!("{}/{}", namespace, name), patch)
    }

    async fn record_event(&self, event: &Event) -> Result<(), ApiError> {
        self.lock().events.push(event.clone());
        Ok(())
    }
}

// ─── Fixtures ──────────────────────────────────────────────────────────────

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

pub fn template(image: &str) -> PodTemplateSpec {
    let mut template = PodTemplateSpec {
        spec: PodSpec {
            containers: vec![ContainerSpec {
                name: "web".to_string(),
                image: image.to_string(),
                command: vec![],
                args: vec![],
                env: Default::default(),
                resources: Default::default(),
            }],
            ..Default::default()
        },
        ..Default::default()
    };
    template
        .metadata
        .labels
        .insert("app".to_string(), "web".to_string());
    template
}

fn rollout(replicas: i32, strategy: RolloutStrategy) -> Rollout {
    let mut metadata = ObjectMeta::new(NS, "web");
    metadata.uid = ROLLOUT_UID.to_string();
    metadata.resource_version = 1;
    metadata.generation = 1;
    metadata.creation_timestamp = epoch();
    Rollout {
        metadata,
        spec: RolloutSpec {
            replicas: Some(replicas),
            selector: [("app".to_string(), "web".to_string())].into(),
            template: template("nginx:1.25"),
            min_ready_seconds: 0,
            strategy,
            revision_history_limit: None,
            paused: false,
        },
        status: Default::default(),
    }
}

pub fn canary_rollout(replicas: i32, steps: Vec<CanaryStep>) -> Rollout {
    rollout(
        replicas,
        RolloutStrategy::Canary(CanaryStrategy {
            steps,
            ..Default::default()
        }),
    )
}

pub fn blue_green_rollout(replicas: i32, active: &str, preview: &str) -> Rollout {
    rollout(
        replicas,
        RolloutStrategy::BlueGreen(BlueGreenStrategy {
            active_service: active.to_string(),
            preview_service: preview.to_string(),
        }),
    )
}

/// ReplicaSet owned by the fixture Rollout with an unrelated template.
/// `created` is seconds after a fixed epoch, so larger means newer.
pub fn replicaset(name: &str, hash: &str, spec: i32, available: i32, created: i64) -> ReplicaSet {
    let mut tmpl = template(&format!("registry.local/web:{}", hash));
    tmpl.metadata
        .labels
        .insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
    let mut metadata = ObjectMeta::new(NS, name);
    metadata.uid = format!("{}-uid", name);
    metadata.labels = tmpl.metadata.labels.clone();
    metadata.resource_version = 1;
    metadata.creation_timestamp = epoch() + ChronoDuration::seconds(created);
    metadata.owner_references = vec![OwnerReference {
        kind: ROLLOUT_KIND.to_string(),
        name: "web".to_string(),
        uid: ROLLOUT_UID.to_string(),
        controller: true,
    }];
    let mut selector: BTreeMap<String, String> = [("app".to_string(), "web".to_string())].into();
    selector.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
    ReplicaSet {
        metadata,
        spec: ReplicaSetSpec {
            replicas: spec,
            min_ready_seconds: 0,
            selector,
            template: tmpl,
        },
        status: ReplicaSetStatus {
            replicas: spec,
            ready_replicas: available,
            available_replicas: available,
            observed_generation: 1,
        },
    }
}

/// The ReplicaSet the resolver would create for `rollout`, already synced:
/// revision 1 above `revision_floor`, desired-replicas stamped.
pub fn current_replicaset(
    rollout: &Rollout,
    spec: i32,
    available: i32,
    revision: i64,
    created: i64,
) -> ReplicaSet {
    let hash = template_hash(&rollout.spec.template, rollout.status.collision_count).unwrap();
    let mut rs = replicaset(&format!("web-{}", hash), &hash, spec, available, created);
    let mut tmpl = rollout.spec.template.clone();
    tmpl.metadata
        .labels
        .insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.clone());
    rs.spec.template = tmpl;
    rs.metadata
        .annotations
        .insert(REVISION_ANNOTATION.to_string(), revision.to_string());
    rs.metadata.annotations.insert(
        DESIRED_REPLICAS_ANNOTATION.to_string(),
        rollout.replicas().to_string(),
    );
    rs
}

/// Stamp the ledger annotations an earlier pass would have written.
pub fn stamped(mut rs: ReplicaSet, revision: i64, desired: i32) -> ReplicaSet {
    rs.metadata
        .annotations
        .insert(REVISION_ANNOTATION.to_string(), revision.to_string());
    rs.metadata
        .annotations
        .insert(DESIRED_REPLICAS_ANNOTATION.to_string(), desired.to_string());
    rs
}

pub fn service(name: &str, hash: Option<&str>) -> Service {
    let mut selector: BTreeMap<String, String> = [("app".to_string(), "web".to_string())].into();
    if let Some(hash) = hash {
        selector.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
    }
    let mut metadata = ObjectMeta::new(NS, name);
    metadata.uid = format!("{}-uid", name);
    metadata.resource_version = 1;
    Service {
        metadata,
        spec: ServiceSpec {
            selector,
            ..Default::default()
        },
    }
}
