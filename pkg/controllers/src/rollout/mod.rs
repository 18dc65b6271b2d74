//! Rollout reconciliation: one pass drives a single Rollout one step closer
//! to its desired state, using only the ReplicaSets, services and status it
//! finds in the store.

pub mod annotations;
mod bluegreen;
mod canary;
mod context;
pub mod hash;
mod replicaset;
pub mod scaling;
mod service;
mod status;

use pkg_constants::rollout::{MANAGED_BY_ANNOTATION, ROLLOUT_KIND};
use pkg_constants::state::{REPLICASETS_PREFIX, ROLLOUTS_PREFIX, SERVICES_PREFIX};
use pkg_state::watch::{EventLog, WatchEvent};
use pkg_types::meta::split_key;
use pkg_types::replicaset::ReplicaSet;
use pkg_types::rollout::RolloutStrategy;
use pkg_types::service::Service;
use pkg_types::validate::validate_rollout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub use bluegreen::reconcile_verifying_preview;
pub use replicaset::find_new_replicaset;

use crate::client::ClusterClient;
use crate::collaborators::Collaborators;
use crate::error::ReconcileError;
use crate::queue::WorkQueue;
use context::RolloutContext;

/// What the worker should do with the key after a successful pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Reconcile again after this long even without a change (timed pauses).
    pub requeue_after: Option<Duration>,
}

/// A ReplicaSet that is running and was last sized for a different
/// `spec.replicas` than the current one.
fn is_scaling_event<C: ClusterClient>(ctx: &RolloutContext<'_, C>) -> bool {
    let replicas = ctx.rollout.replicas();
    ctx.all_rss()
        .filter(|rs| rs.spec.replicas > 0)
        .filter_map(|rs| annotations::desired_replicas(&rs.metadata))
        .any(|desired| desired != replicas)
}

/// Reconcile the Rollout stored under the `namespace/name` queue key.
pub async fn reconcile_rollout<C: ClusterClient>(
    client: &C,
    collaborators: &Collaborators,
    key: &str,
) -> Result<Outcome, ReconcileError> {
    let Some((namespace, name)) = split_key(key) else {
        warn!("Ignoring malformed rollout key '{}'", key);
        return Ok(Outcome::default());
    };
    let rollout = match client.get_rollout(namespace, name).await {
        Ok(r) => r,
        Err(e) if e.is_not_found() => {
            debug!("Rollout {} no longer exists", key);
            return Ok(Outcome::default());
        }
        Err(e) => return Err(e.into()),
    };
    let owned: Vec<ReplicaSet> = client
        .list_replicasets(namespace)
        .await?
        .into_iter()
        .filter(|rs| rs.metadata.is_controlled_by(&rollout.metadata.uid))
        .collect();

    let mut ctx = RolloutContext::new(client, collaborators, rollout, owned);

    if let Err(e) = validate_rollout(&ctx.rollout) {
        ctx.sync_invalid_spec(&e.to_string()).await?;
        return Ok(Outcome::default());
    }

    ctx.resolve(false).await?;
    if is_scaling_event(&ctx) {
        info!("Rollout {}: replicas changed to {}", key, ctx.rollout.replicas());
        sync_replicas_only(&mut ctx).await?;
        return Ok(Outcome {
            requeue_after: ctx.requeue_after,
        });
    }

    let result = if ctx.rollout.blue_green().is_some() {
        ctx.reconcile_blue_green().await
    } else {
        ctx.reconcile_canary().await
    };
    match result {
        Err(ReconcileError::InvalidSpec(message)) => ctx.sync_invalid_spec(&message).await?,
        other => other?,
    }
    Ok(Outcome {
        requeue_after: ctx.requeue_after,
    })
}

/// Follow a `spec.replicas` change without creating ReplicaSets or moving
/// the step cursor.
async fn sync_replicas_only<C: ClusterClient>(
    ctx: &mut RolloutContext<'_, C>,
) -> Result<(), ReconcileError> {
    match ctx.rollout.spec.strategy.clone() {
        RolloutStrategy::Canary(_) => {
            ctx.scale().await?;
            ctx.sync_canary_status().await
        }
        RolloutStrategy::BlueGreen(strategy) => {
            let active = ctx.get_service(&strategy.active_service).await?;
            let preview = match strategy.preview_service() {
                Some(name) => Some(ctx.get_service(name).await?),
                None => None,
            };
            ctx.reconcile_bluegreen_replicasets(&active).await?;
            ctx.sync_blue_green_status(&active, preview.as_ref()).await
        }
    }
}

/// Queue key of the Rollout a store change belongs to, if any.
fn rollout_key_for(event: &WatchEvent) -> Option<String> {
    let resource = event.resource()?;
    let prefix = format!("/registry/{}/", resource.kind);
    if prefix == ROLLOUTS_PREFIX {
        return Some(format!("{}/{}", resource.namespace, resource.name));
    }
    let value = event.value.as_deref()?;
    if prefix == REPLICASETS_PREFIX {
        let rs: ReplicaSet = serde_json::from_slice(value).ok()?;
        let owner = rs.metadata.controller_ref()?;
        return (owner.kind == ROLLOUT_KIND)
            .then(|| format!("{}/{}", resource.namespace, owner.name));
    }
    if prefix == SERVICES_PREFIX {
        let svc: Service = serde_json::from_slice(value).ok()?;
        let rollout = svc.metadata.annotations.get(MANAGED_BY_ANNOTATION)?;
        return Some(format!("{}/{}", resource.namespace, rollout));
    }
    None
}

/// Controller that reconciles Rollouts through a rate-limited work queue.
/// Keys come from a periodic full resync and, when an event log is given,
/// from store changes to Rollouts and the objects they manage.
pub struct RolloutController<C: ClusterClient + 'static> {
    client: Arc<C>,
    collaborators: Arc<Collaborators>,
    queue: WorkQueue,
    workers: usize,
    resync_interval: Duration,
    event_log: Option<EventLog>,
}

impl<C: ClusterClient + 'static> RolloutController<C> {
    pub fn new(client: Arc<C>, collaborators: Collaborators) -> Self {
        Self {
            client,
            collaborators: Arc::new(collaborators),
            queue: WorkQueue::new(),
            workers: pkg_constants::controller::DEFAULT_WORKERS,
            resync_interval: Duration::from_secs(pkg_constants::controller::DEFAULT_RESYNC_SECS),
            event_log: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_event_log(mut self, event_log: EventLog) -> Self {
        self.event_log = Some(event_log);
        self
    }

    /// Handle to the queue, e.g. to shut the controller down.
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "RolloutController started (workers={}, resync={}s)",
                self.workers,
                self.resync_interval.as_secs()
            );
            let mut handles = Vec::with_capacity(self.workers);
            for id in 0..self.workers {
                handles.push(tokio::spawn(run_worker(
                    id,
                    self.client.clone(),
                    self.collaborators.clone(),
                    self.queue.clone(),
                )));
            }

            self.feed().await;

            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("RolloutController worker panicked: {}", e);
                }
            }
            info!("RolloutController stopped");
        })
    }

    /// Enqueue keys until the queue shuts down.
    async fn feed(&self) {
        let mut interval = tokio::time::interval(self.resync_interval);
        let mut events = self.event_log.as_ref().map(EventLog::subscribe);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!("RolloutController resync error: {}", e);
                    }
                }
                event = async {
                    match events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Ok(event) => {
                        if let Some(key) = rollout_key_for(&event) {
                            debug!("RolloutController: {} changed, queueing {}", event.key, key);
                            self.queue.add(&key);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("RolloutController missed {} watch events, resyncing", missed);
                        if let Err(e) = self.resync().await {
                            warn!("RolloutController resync error: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => events = None,
                },
                _ = self.queue.closed() => return,
            }
        }
    }

    async fn resync(&self) -> Result<(), ReconcileError> {
        for rollout in self.client.list_rollouts().await? {
            self.queue.add(&rollout.metadata.key());
        }
        Ok(())
    }
}

async fn run_worker<C: ClusterClient>(
    id: usize,
    client: Arc<C>,
    collaborators: Arc<Collaborators>,
    queue: WorkQueue,
) {
    debug!("Rollout worker {} started", id);
    while let Some(key) = queue.get().await {
        match reconcile_rollout(client.as_ref(), &collaborators, &key).await {
            Ok(outcome) => {
                queue.forget(&key);
                if let Some(delay) = outcome.requeue_after {
                    queue.add_after(&key, delay);
                }
            }
            Err(e) => {
                warn!(
                    "Rollout {} reconcile error (retry {}): {}",
                    key,
                    queue.num_requeues(&key) + 1,
                    e
                );
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
    debug!("Rollout worker {} stopped", id);
}
