use chrono::Utc;
use pkg_constants::rollout::{REASON_AVAILABLE, REASON_INVALID_SPEC, REASON_UNAVAILABLE};
use pkg_types::event::EventType;
use pkg_types::rollout::{ConditionStatus, ConditionType, RolloutCondition, RolloutStatus};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::ClusterClient;
use crate::error::ReconcileError;
use crate::patch::{field_patch, merge_patch};
use crate::rollout::context::RolloutContext;
use crate::rollout::hash::{generation_hash, step_hash};
use crate::rollout::scaling::max_unavailable;

/// Set `condition_type` on `conditions`. The transition time only moves
/// when the status flips. Returns whether anything changed.
pub fn set_condition(
    conditions: &mut Vec<RolloutCondition>,
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> bool {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        Some(c) if c.status == status && c.reason == reason && c.message == message => false,
        Some(c) if c.status == status => {
            c.reason = reason.to_string();
            c.message = message.to_string();
            true
        }
        Some(c) => {
            *c = RolloutCondition {
                condition_type,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now(),
            };
            true
        }
        None => {
            conditions.push(RolloutCondition {
                condition_type,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now(),
            });
            true
        }
    }
}

pub fn remove_condition(conditions: &mut Vec<RolloutCondition>, condition_type: ConditionType) {
    conditions.retain(|c| c.condition_type != condition_type);
}

impl<C: ClusterClient> RolloutContext<'_, C> {
    /// Working status with the observed fields recomputed from the
    /// ReplicaSets. Cursor and gate fields are carried over untouched.
    pub(crate) fn calculate_base_status(&self) -> Result<RolloutStatus, ReconcileError> {
        let mut status = self.status.clone();
        status.current_pod_hash = self.current_pod_hash()?;
        status.observed_generation = generation_hash(&self.rollout)?;
        status.current_step_hash = step_hash(&self.rollout)?;
        status.replicas = self.all_rss().map(|rs| rs.status.replicas).sum();
        status.updated_replicas = self.new_rs.as_ref().map_or(0, |rs| rs.status.replicas);
        status.ready_replicas = self.all_rss().map(|rs| rs.status.ready_replicas).sum();
        status.available_replicas = self.all_rss().map(|rs| rs.status.available_replicas).sum();
        Ok(status)
    }

    /// `Available` is true while availability is within the
    /// unavailability budget. A normal pass also clears `InvalidSpec`.
    pub(crate) fn set_available_condition(
        &self,
        status: &mut RolloutStatus,
    ) -> Result<(), ReconcileError> {
        let min_available = self.rollout.replicas() - max_unavailable(&self.rollout)?;
        if status.available_replicas >= min_available {
            set_condition(
                &mut status.conditions,
                ConditionType::Available,
                ConditionStatus::True,
                REASON_AVAILABLE,
                "Rollout has minimum availability",
            );
        } else {
            set_condition(
                &mut status.conditions,
                ConditionType::Available,
                ConditionStatus::False,
                REASON_UNAVAILABLE,
                "Rollout does not have minimum availability",
            );
        }
        remove_condition(&mut status.conditions, ConditionType::InvalidSpec);
        Ok(())
    }

    /// Write `status` as a merge patch of what changed since the last
    /// write. Nothing is sent when nothing changed.
    pub(crate) async fn persist_status(
        &mut self,
        status: RolloutStatus,
    ) -> Result<(), ReconcileError> {
        let Some(patch) = field_patch("status", &self.rollout.status, &status)? else {
            self.status = status;
            return Ok(());
        };
        debug!("Rollout {}: patching status {}", self.key(), patch);
        let updated = self
            .client
            .patch_rollout(self.namespace(), self.name(), &patch)
            .await?;
        self.rollout.metadata = updated.metadata;
        self.rollout.status = status.clone();
        self.status = status;
        Ok(())
    }

    /// Send a hand-written status patch and fold it into both copies of
    /// the status.
    pub(crate) async fn patch_status(&mut self, patch: &Value) -> Result<(), ReconcileError> {
        debug!("Rollout {}: patching status {}", self.key(), patch);
        let updated = self
            .client
            .patch_rollout(self.namespace(), self.name(), patch)
            .await?;
        self.rollout.metadata = updated.metadata;
        let Some(delta) = patch.get("status") else {
            return Ok(());
        };
        for status in [&mut self.rollout.status, &mut self.status] {
            let mut doc = serde_json::to_value(&*status)?;
            merge_patch(&mut doc, delta);
            *status = serde_json::from_value(doc)?;
        }
        Ok(())
    }

    /// Degraded pass: record why the Rollout spec is unusable and touch nothing
    /// else.
    pub(crate) async fn sync_invalid_spec(&mut self, message: &str) -> Result<(), ReconcileError> {
        warn!("Rollout {}: invalid spec: {}", self.key(), message);
        let mut status = self.status.clone();
        status.observed_generation = generation_hash(&self.rollout)?;
        let changed = set_condition(
            &mut status.conditions,
            ConditionType::InvalidSpec,
            ConditionStatus::True,
            REASON_INVALID_SPEC,
            message,
        );
        self.persist_status(status).await?;
        if changed {
            self.record_event(EventType::Warning, REASON_INVALID_SPEC, message)
                .await;
        }
        Ok(())
    }
}
