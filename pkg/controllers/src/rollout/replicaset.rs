use pkg_constants::controller::CONFLICT_RETRY_ATTEMPTS;
use pkg_constants::rollout::{
    POD_TEMPLATE_HASH_LABEL, REASON_DELETED_REPLICASET, REASON_FAILED_RS_CREATE,
    REASON_HASH_COLLISION, REASON_NEW_REPLICASET, REASON_SCALING_REPLICASET,
    REVISION_ANNOTATION, ROLLOUT_KIND,
};
use pkg_types::event::EventType;
use pkg_types::meta::{ObjectMeta, OwnerReference};
use pkg_types::replicaset::{ReplicaSet, ReplicaSetSpec, ReplicaSetStatus};
use pkg_types::rollout::Rollout;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::client::ClusterClient;
use crate::error::ReconcileError;
use crate::retry::retry_on_conflict;
use crate::rollout::annotations;
use crate::rollout::context::{RolloutContext, sort_by_creation};
use crate::rollout::hash::template_hash;

/// Index of the ReplicaSet running the Rollout's current template.
///
/// A ReplicaSet labelled with `hash` wins; otherwise the oldest one whose
/// template equals the Rollout's, ignoring the hash label. `rss` must be
/// sorted oldest first.
pub fn find_new_replicaset(rollout: &Rollout, rss: &[ReplicaSet], hash: &str) -> Option<usize> {
    if let Some(i) = rss
        .iter()
        .position(|rs| rs.label(POD_TEMPLATE_HASH_LABEL) == Some(hash))
        && template_matches(rollout, &rss[i])
    {
        return Some(i);
    }
    rss.iter().position(|rs| template_matches(rollout, rs))
}

fn template_matches(rollout: &Rollout, rs: &ReplicaSet) -> bool {
    rs.spec.template.without_label(POD_TEMPLATE_HASH_LABEL)
        == rollout.spec.template.without_label(POD_TEMPLATE_HASH_LABEL)
}

impl<C: ClusterClient> RolloutContext<'_, C> {
    /// Split the owned ReplicaSets into the new one and the old ones.
    ///
    /// With `create_if_absent` a missing new ReplicaSet is created and an
    /// existing one gets its revision synced; without it nothing is written.
    pub(crate) async fn resolve(&mut self, create_if_absent: bool) -> Result<(), ReconcileError> {
        let mut all: Vec<ReplicaSet> = self
            .new_rs
            .take()
            .into_iter()
            .chain(self.old_rss.drain(..))
            .collect();
        sort_by_creation(&mut all);
        let hash = template_hash(&self.rollout.spec.template, self.status.collision_count)?;
        let new_rs = find_new_replicaset(&self.rollout, &all, &hash).map(|i| all.remove(i));
        self.old_rss = all;

        self.new_rs = match new_rs {
            Some(rs) if create_if_absent => Some(self.sync_replicaset_revision(rs).await?),
            Some(rs) => Some(rs),
            None if create_if_absent => Some(self.create_new_replicaset(&hash).await?),
            None => None,
        };
        Ok(())
    }

    /// Bring an existing new ReplicaSet's ledger up to date and mirror its
    /// revision onto the Rollout.
    async fn sync_replicaset_revision(
        &mut self,
        rs: ReplicaSet,
    ) -> Result<ReplicaSet, ReconcileError> {
        let new_revision = annotations::max_revision(self.old_rss.iter()) + 1;
        let mut updated = rs.clone();
        let mut changed = annotations::copy_rollout_annotations(&self.rollout, &mut updated);
        changed |= annotations::set_new_replicaset_annotations(
            &self.rollout,
            &mut updated,
            new_revision,
            true,
        );
        if updated.spec.min_ready_seconds != self.rollout.spec.min_ready_seconds {
            updated.spec.min_ready_seconds = self.rollout.spec.min_ready_seconds;
            changed = true;
        }
        changed |= annotations::set_workload_generation(
            &mut updated.metadata,
            self.rollout.metadata.generation,
        );

        let rs = if changed {
            debug!(
                "Rollout {}: syncing revision of replica set {}",
                self.key(),
                updated.name()
            );
            self.client.update_replicaset(&updated).await?
        } else {
            rs
        };

        if let Some(revision) = rs.metadata.annotations.get(REVISION_ANNOTATION) {
            self.sync_rollout_revision(revision).await?;
        }
        Ok(rs)
    }

    /// Set the Rollout's revision annotation, re-reading on conflict.
    async fn sync_rollout_revision(&mut self, revision: &str) -> Result<(), ReconcileError> {
        if annotations::revision(&self.rollout.metadata).map(|r| r.to_string()).as_deref()
            == Some(revision)
        {
            return Ok(());
        }
        let client = self.client;
        let namespace = self.rollout.metadata.namespace.as_str();
        let name = self.rollout.metadata.name.as_str();
        let updated = retry_on_conflict(CONFLICT_RETRY_ATTEMPTS, move || async move {
            let mut current = client.get_rollout(namespace, name).await?;
            if !annotations::set_rollout_revision(&mut current, revision) {
                return Ok(current);
            }
            client.update_rollout(&current).await
        })
        .await?;
        info!("Rollout {}: revision is now {}", self.key(), revision);
        self.rollout.metadata = updated.metadata;
        Ok(())
    }

    async fn create_new_replicaset(&mut self, hash: &str) -> Result<ReplicaSet, ReconcileError> {
        let mut template = self.rollout.spec.template.clone();
        template
            .metadata
            .labels
            .insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
        let mut selector = self.rollout.spec.selector.clone();
        selector.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());

        let mut metadata = ObjectMeta::new(self.namespace(), &format!("{}-{}", self.name(), hash));
        metadata.labels = template.metadata.labels.clone();
        metadata.owner_references = vec![OwnerReference {
            kind: ROLLOUT_KIND.to_string(),
            name: self.name().to_string(),
            uid: self.rollout.metadata.uid.clone(),
            controller: true,
        }];
        let mut rs = ReplicaSet {
            metadata,
            spec: ReplicaSetSpec {
                replicas: 0,
                min_ready_seconds: self.rollout.spec.min_ready_seconds,
                selector,
                template,
            },
            status: ReplicaSetStatus::default(),
        };
        rs.spec.replicas = self.new_rs_new_replicas(&rs)?;
        annotations::copy_rollout_annotations(&self.rollout, &mut rs);
        let new_revision = annotations::max_revision(self.old_rss.iter()) + 1;
        annotations::set_new_replicaset_annotations(&self.rollout, &mut rs, new_revision, false);
        annotations::set_workload_generation(&mut rs.metadata, self.rollout.metadata.generation);

        let created = match self.client.create_replicaset(&rs).await {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => {
                let existing = self.client.get_replicaset(self.namespace(), rs.name()).await?;
                if existing.metadata.is_controlled_by(&self.rollout.metadata.uid)
                    && template_matches(&self.rollout, &existing)
                {
                    debug!(
                        "Rollout {}: replica set {} already exists",
                        self.key(),
                        existing.name()
                    );
                    return self.sync_replicaset_revision(existing).await;
                }
                return Err(self.record_collision(rs.name()).await?);
            }
            Err(e) => {
                let message = format!("Failed to create new replica set {}: {}", rs.name(), e);
                warn!("Rollout {}: {}", self.key(), message);
                self.record_event(EventType::Warning, REASON_FAILED_RS_CREATE, message)
                    .await;
                return Err(e.into());
            }
        };

        info!(
            "Rollout {}: created replica set {} with {} replicas",
            self.key(),
            created.name(),
            created.spec.replicas
        );
        if created.spec.replicas > 0 {
            self.record_event(
                EventType::Normal,
                REASON_NEW_REPLICASET,
                format!(
                    "Created replica set {} with size {}",
                    created.name(),
                    created.spec.replicas
                ),
            )
            .await;
            self.record_event(
                EventType::Normal,
                REASON_SCALING_REPLICASET,
                format!(
                    "Scaled up replica set {} from 0 to {}",
                    created.name(),
                    created.spec.replicas
                ),
            )
            .await;
        }

        if let Some(revision) = created.metadata.annotations.get(REVISION_ANNOTATION) {
            self.sync_rollout_revision(revision).await?;
        }
        Ok(created)
    }

    /// Someone else owns the name our template hashes to. Bump the
    /// collision count so the next pass hashes to a different name.
    async fn record_collision(&mut self, name: &str) -> Result<ReconcileError, ReconcileError> {
        let collision_count = self.status.collision_count.unwrap_or(0) + 1;
        let patch = json!({ "status": { "collisionCount": collision_count } });
        self.patch_status(&patch).await?;
        let message = format!(
            "Found a hash collision for replica set {}, bumping collision count to {}",
            name, collision_count
        );
        warn!("Rollout {}: {}", self.key(), message);
        self.record_event(EventType::Warning, REASON_HASH_COLLISION, message)
            .await;
        Ok(ReconcileError::HashCollision {
            name: name.to_string(),
            collision_count,
        })
    }

    /// Delete fully scaled-down old ReplicaSets beyond the history limit,
    /// oldest first. The stable ReplicaSet is never deleted.
    pub(crate) async fn cleanup_old_replicasets(&mut self) -> Result<(), ReconcileError> {
        let limit = usize::try_from(self.rollout.revision_history_limit()).unwrap_or(0);
        let stable = self.status.stable_rs.clone();
        let candidates: Vec<String> = self
            .old_rss
            .iter()
            .filter(|rs| rs.spec.replicas == 0 && rs.status.replicas == 0)
            .filter(|rs| stable.is_empty() || rs.label(POD_TEMPLATE_HASH_LABEL) != Some(&stable))
            .map(|rs| rs.name().to_string())
            .collect();
        if candidates.len() <= limit {
            return Ok(());
        }

        let excess = candidates.len() - limit;
        for name in candidates.into_iter().take(excess) {
            match self.client.delete_replicaset(self.namespace(), &name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            info!("Rollout {}: deleted old replica set {}", self.key(), name);
            self.record_event(
                EventType::Normal,
                REASON_DELETED_REPLICASET,
                format!("Deleted old replica set {}", name),
            )
            .await;
            self.forget_rs(&name);
        }
        Ok(())
    }
}
