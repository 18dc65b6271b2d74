use pkg_constants::rollout::POD_TEMPLATE_HASH_LABEL;
use pkg_types::replicaset::ReplicaSet;
use pkg_types::rollout::{BlueGreenStrategy, RolloutStatus};
use pkg_types::service::Service;
use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::error::ReconcileError;
use crate::rollout::context::RolloutContext;
use crate::rollout::scaling::is_saturated;

fn selector_hash(service: Option<&Service>) -> &str {
    service
        .and_then(|svc| svc.selector_value(POD_TEMPLATE_HASH_LABEL))
        .unwrap_or("")
}

/// Whether the rollout is held at the verifying-preview gate: only with a
/// preview service, only once the active service serves some hash, and only
/// while the flag is set.
pub fn reconcile_verifying_preview(
    strategy: &BlueGreenStrategy,
    status: &RolloutStatus,
    active: &Service,
) -> bool {
    strategy.preview_service().is_some()
        && !selector_hash(Some(active)).is_empty()
        && status.verifying_preview == Some(true)
}

impl<C: ClusterClient> RolloutContext<'_, C> {
    pub(crate) async fn reconcile_blue_green(&mut self) -> Result<(), ReconcileError> {
        let Some(strategy) = self.rollout.blue_green().cloned() else {
            return Ok(());
        };
        let mut active = self.get_service(&strategy.active_service).await?;
        let mut preview = match strategy.preview_service() {
            Some(name) => Some(self.get_service(name).await?),
            None => None,
        };
        self.resolve(true).await?;

        if self.scale_new_for_blue_green().await? {
            return self.sync_blue_green_status(&active, preview.as_ref()).await;
        }

        let hash = self.current_pod_hash()?;
        if let Some(preview) = preview.as_mut()
            && self.switch_service_selector(preview, &hash).await?
        {
            if !selector_hash(Some(&active)).is_empty() {
                self.status.verifying_preview = Some(true);
            }
            return self.sync_blue_green_status(&active, Some(&*preview)).await;
        }
        if reconcile_verifying_preview(&strategy, &self.status, &active) {
            debug!("Rollout {}: waiting for preview verification", self.key());
            return self.sync_blue_green_status(&active, preview.as_ref()).await;
        }

        if self.rollout.spec.paused {
            return self.sync_blue_green_status(&active, preview.as_ref()).await;
        }

        if !is_saturated(&self.rollout, self.new_rs.as_ref()) {
            debug!("Rollout {}: new replica set not yet available", self.key());
            return self.sync_blue_green_status(&active, preview.as_ref()).await;
        }
        if self.switch_service_selector(&mut active, &hash).await? {
            self.status.verifying_preview = None;
            return self.sync_blue_green_status(&active, preview.as_ref()).await;
        }

        if self.scale_down_untargeted(&active, preview.as_ref()).await? {
            return self.sync_blue_green_status(&active, preview.as_ref()).await;
        }

        let replicas = self.rollout.replicas();
        if self
            .new_rs
            .as_ref()
            .is_some_and(|rs| rs.status.available_replicas == replicas)
        {
            self.cleanup_old_replicasets().await?;
        }
        self.sync_blue_green_status(&active, preview.as_ref()).await
    }

    async fn scale_new_for_blue_green(&mut self) -> Result<bool, ReconcileError> {
        let Some(new_rs) = self.new_rs.clone() else {
            return Ok(false);
        };
        let replicas = self.rollout.replicas();
        self.scale_replica_set(new_rs, replicas).await
    }

    /// Replicas-only pass for a blue-green Rollout: the new ReplicaSet and
    /// the one the active service points at follow `spec.replicas`; the
    /// rest are left for the next full pass to drain.
    pub(crate) async fn reconcile_bluegreen_replicasets(
        &mut self,
        active: &Service,
    ) -> Result<bool, ReconcileError> {
        let replicas = self.rollout.replicas();
        let active_hash = selector_hash(Some(active));
        let targets: Vec<ReplicaSet> = self
            .all_rss()
            .filter(|rs| {
                self.new_rs.as_ref().is_some_and(|n| n.name() == rs.name())
                    || (!active_hash.is_empty()
                        && rs.label(POD_TEMPLATE_HASH_LABEL) == Some(active_hash))
            })
            .cloned()
            .collect();
        let mut scaled = false;
        for rs in targets {
            scaled |= self.scale_replica_set(rs, replicas).await?;
        }
        Ok(scaled)
    }

    /// Scale to zero every old ReplicaSet neither service points at.
    async fn scale_down_untargeted(
        &mut self,
        active: &Service,
        preview: Option<&Service>,
    ) -> Result<bool, ReconcileError> {
        let targeted = [selector_hash(Some(active)), selector_hash(preview)];
        let idle: Vec<ReplicaSet> = self
            .old_rss
            .iter()
            .filter(|rs| rs.spec.replicas > 0)
            .filter(|rs| {
                rs.label(POD_TEMPLATE_HASH_LABEL)
                    .is_none_or(|h| !targeted.contains(&h))
            })
            .cloned()
            .collect();
        let mut scaled = false;
        for rs in idle {
            info!(
                "Rollout {}: scaling down idle replica set {}",
                self.key(),
                rs.name()
            );
            scaled |= self.scale_replica_set(rs, 0).await?;
        }
        Ok(scaled)
    }

    pub(crate) async fn sync_blue_green_status(
        &mut self,
        active: &Service,
        preview: Option<&Service>,
    ) -> Result<(), ReconcileError> {
        let mut status = self.calculate_base_status()?;
        status.current_step_index = None;
        status.blue_green.active_selector = selector_hash(Some(active)).to_string();
        status.blue_green.preview_selector = selector_hash(preview).to_string();
        if !status.blue_green.active_selector.is_empty() {
            status.stable_rs = status.blue_green.active_selector.clone();
        }
        self.set_available_condition(&mut status)?;
        self.persist_status(status).await
    }
}
