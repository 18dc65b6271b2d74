use chrono::Utc;
use pkg_constants::rollout::{
    REASON_ABORTED, REASON_PAUSED, REASON_PROMOTED, REASON_RESUMED, REASON_STEP_COMPLETED,
};
use pkg_types::event::EventType;
use pkg_types::replicaset::ReplicaSet;
use pkg_types::rollout::{CanaryStep, CollaboratorPhase, CollaboratorStatus, StepStatus};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{info, warn};

use crate::client::ClusterClient;
use crate::collaborators::into_status;
use crate::error::ReconcileError;
use crate::rollout::context::RolloutContext;
use crate::rollout::scaling::{
    at_desired_replica_counts_for_canary, calculate_canary_counts, current_canary_step,
    current_set_weight, max_unavailable,
};

fn step_count(steps: &[CanaryStep]) -> i32 {
    i32::try_from(steps.len()).unwrap_or(i32::MAX)
}

impl<C: ClusterClient> RolloutContext<'_, C> {
    /// Template or step list differs from what the status last recorded.
    fn pod_template_or_steps_changed(&self) -> Result<bool, ReconcileError> {
        let status = self.calculate_base_status()?;
        Ok(self.status.current_pod_hash != status.current_pod_hash
            || self.status.current_step_hash != status.current_step_hash)
    }

    /// The cursor is reset in a status-only pass before a new ReplicaSet is
    /// created, so the new ReplicaSet is sized against step 0.
    pub(crate) async fn reconcile_canary(&mut self) -> Result<(), ReconcileError> {
        if self.pod_template_or_steps_changed()? {
            return self.sync_canary_status().await;
        }
        self.resolve(true).await?;

        if self.reconcile_canary_replicasets().await? {
            return self.sync_canary_status().await;
        }

        self.reconcile_traffic_routing().await;
        self.reconcile_step_collaborator().await;

        if self.reconcile_canary_pause().await? {
            return self.sync_canary_status().await;
        }

        if self.is_fully_promoted() {
            self.cleanup_old_replicasets().await?;
        }
        self.sync_canary_status().await
    }

    fn is_fully_promoted(&self) -> bool {
        let Some(new_rs) = &self.new_rs else {
            return false;
        };
        let hash = self.status.current_pod_hash.as_str();
        !hash.is_empty()
            && self.status.stable_rs == hash
            && new_rs.status.available_replicas == self.rollout.replicas()
    }

    /// Scale the stable and new ReplicaSets to their canary counts and drain
    /// older ones. Returns whether any ReplicaSet was resized.
    async fn reconcile_canary_replicasets(&mut self) -> Result<bool, ReconcileError> {
        let stable = self.stable_rs().cloned();
        let others: Vec<ReplicaSet> = self.other_rss().into_iter().cloned().collect();
        let other_refs: Vec<&ReplicaSet> = others.iter().collect();
        let (new_count, stable_count) = calculate_canary_counts(
            &self.rollout,
            self.new_rs.as_ref(),
            stable.as_ref(),
            &other_refs,
        )?;

        let mut scaled = false;
        let new_name = self.new_rs.as_ref().map(|rs| rs.name().to_string());
        if let Some(stable) = stable
            && Some(stable.name()) != new_name.as_deref()
        {
            scaled |= self.scale_replica_set(stable, stable_count).await?;
        }
        if let Some(new_rs) = self.new_rs.clone() {
            scaled |= self.scale_replica_set(new_rs, new_count).await?;
        }
        scaled |= self.scale_down_old_replicasets().await?;
        Ok(scaled)
    }

    /// Drain ReplicaSets that are neither new nor stable. Ones without
    /// available pods go straight to zero; the rest shrink oldest first as
    /// far as the unavailability budget allows.
    async fn scale_down_old_replicasets(&mut self) -> Result<bool, ReconcileError> {
        let others: Vec<ReplicaSet> = self
            .other_rss()
            .into_iter()
            .filter(|rs| rs.spec.replicas > 0)
            .cloned()
            .collect();
        if others.is_empty() {
            return Ok(false);
        }

        let mut scaled = false;
        let (unhealthy, healthy): (Vec<ReplicaSet>, Vec<ReplicaSet>) = others
            .into_iter()
            .partition(|rs| rs.status.available_replicas == 0);
        for rs in unhealthy {
            scaled |= self.scale_replica_set(rs, 0).await?;
        }

        let min_available = self.rollout.replicas() - max_unavailable(&self.rollout)?;
        let available: i32 = self
            .all_rss()
            .map(ReplicaSet::available_for_scale_down)
            .sum();
        let mut budget = available - min_available;
        for rs in healthy {
            if budget <= 0 {
                break;
            }
            let down = rs.spec.replicas.min(budget);
            let target = rs.spec.replicas - down;
            budget -= down.min(rs.status.available_replicas);
            scaled |= self.scale_replica_set(rs, target).await?;
        }
        Ok(scaled)
    }

    /// Hand the current weight to the configured traffic router and keep
    /// what it reports. Router failures are recorded, never fatal.
    async fn reconcile_traffic_routing(&mut self) {
        let Some(routing) = self
            .rollout
            .canary()
            .and_then(|c| c.traffic_routing.clone())
        else {
            return;
        };
        let weight = current_set_weight(&self.rollout);
        let previous = self.status.canary.traffic_routing.clone();
        let result = match self.collaborators.router(&routing.router) {
            Some(router) => into_status(
                router
                    .set_weight(&self.rollout, weight, previous.as_ref())
                    .await,
            ),
            None => CollaboratorStatus {
                phase: CollaboratorPhase::Error,
                message: format!("traffic router {} is not registered", routing.router),
                status: Value::Null,
            },
        };
        if result.phase == CollaboratorPhase::Error {
            warn!(
                "Rollout {}: traffic router {} failed: {}",
                self.key(),
                routing.router,
                result.message
            );
        }
        self.status.canary.traffic_routing = Some(result);
    }

    /// Run the current analysis, experiment or plugin step until it reaches
    /// a terminal phase. A failed step aborts the rollout.
    async fn reconcile_step_collaborator(&mut self) {
        if self.status.abort || self.rollout.spec.paused {
            return;
        }
        let (Some(step), Some(index)) = current_canary_step(&self.rollout) else {
            return;
        };
        if matches!(step, CanaryStep::SetWeight(_) | CanaryStep::Pause(_)) {
            return;
        }
        let previous = self.status.canary.step_status(index).map(|s| s.result.clone());
        if previous.as_ref().is_some_and(|p| {
            matches!(
                p.phase,
                CollaboratorPhase::Successful | CollaboratorPhase::Failed
            )
        }) {
            return;
        }

        let kind = step.kind();
        let result = into_status(
            self.collaborators
                .steps()
                .run(&self.rollout, index, step, previous.as_ref())
                .await,
        );
        match result.phase {
            CollaboratorPhase::Failed => {
                let message = format!(
                    "Rollout aborted: {} step {} failed: {}",
                    kind, index, result.message
                );
                warn!("Rollout {}: {}", self.key(), message);
                self.status.abort = true;
                self.record_event(EventType::Warning, REASON_ABORTED, message)
                    .await;
            }
            CollaboratorPhase::Error => {
                warn!(
                    "Rollout {}: {} step {} errored: {}",
                    self.key(),
                    kind,
                    index,
                    result.message
                );
            }
            CollaboratorPhase::Running | CollaboratorPhase::Successful => {}
        }

        let entry = StepStatus {
            index,
            kind: kind.to_string(),
            result,
        };
        let statuses = &mut self.status.canary.step_statuses;
        match statuses.iter_mut().find(|s| s.index == index) {
            Some(existing) => *existing = entry,
            None => statuses.push(entry),
        }
    }

    /// Drive a pause step. Returns `true` while the pass should stop short
    /// of cleanup because the cursor is held or has just moved.
    pub(crate) async fn reconcile_canary_pause(&mut self) -> Result<bool, ReconcileError> {
        if self.rollout.spec.paused || self.status.abort {
            return Ok(false);
        }
        let (Some(CanaryStep::Pause(pause)), Some(index)) = current_canary_step(&self.rollout)
        else {
            return Ok(false);
        };
        let duration = pause
            .duration()
            .map_err(|e| ReconcileError::InvalidSpec(e.to_string()))?;

        match self.status.set_pause {
            None => {
                let mut patch = Map::new();
                patch.insert("setPause".to_string(), json!(true));
                if let Some(duration) = duration {
                    patch.insert("pauseStartTime".to_string(), json!(Utc::now()));
                    self.requeue_after(duration);
                }
                self.patch_status(&json!({ "status": patch })).await?;
                info!("Rollout {}: paused at step {}", self.key(), index);
                self.record_event(
                    EventType::Normal,
                    REASON_PAUSED,
                    format!("Rollout is paused at step {}", index),
                )
                .await;
            }
            Some(false) => self.advance_past_pause(index).await?,
            Some(true) => match (duration, self.status.pause_start_time) {
                (Some(duration), Some(started)) => {
                    let elapsed = (Utc::now() - started).to_std().unwrap_or(Duration::ZERO);
                    if elapsed >= duration {
                        self.advance_past_pause(index).await?;
                    } else {
                        self.requeue_after(duration - elapsed);
                    }
                }
                (Some(duration), None) => {
                    self.patch_status(&json!({ "status": { "pauseStartTime": Utc::now() } }))
                        .await?;
                    self.requeue_after(duration);
                }
                (None, _) => {}
            },
        }
        Ok(true)
    }

    async fn advance_past_pause(&mut self, index: i32) -> Result<(), ReconcileError> {
        let mut patch = Map::new();
        patch.insert("setPause".to_string(), Value::Null);
        patch.insert("currentStepIndex".to_string(), json!(index + 1));
        if self.status.pause_start_time.is_some() {
            patch.insert("pauseStartTime".to_string(), Value::Null);
        }
        self.patch_status(&json!({ "status": patch })).await?;
        info!("Rollout {}: resumed after step {}", self.key(), index);
        self.record_event(
            EventType::Normal,
            REASON_RESUMED,
            format!("Rollout resumed after step {}", index),
        )
        .await;
        Ok(())
    }

    fn completed_current_step(&self) -> Result<bool, ReconcileError> {
        let (Some(step), Some(index)) = current_canary_step(&self.rollout) else {
            return Ok(false);
        };
        match step {
            CanaryStep::SetWeight(_) => {
                let others = self.other_rss();
                at_desired_replica_counts_for_canary(
                    &self.rollout,
                    self.new_rs.as_ref(),
                    self.stable_rs(),
                    &others,
                )
            }
            CanaryStep::Pause(_) => Ok(self.status.set_pause == Some(false)),
            CanaryStep::Analysis(_) | CanaryStep::Experiment(_) | CanaryStep::Plugin(_) => Ok(self
                .status
                .canary
                .step_status(index)
                .is_some_and(|s| s.result.phase == CollaboratorPhase::Successful)),
        }
    }

    /// Recompute the canary status from scratch and persist the difference.
    pub(crate) async fn sync_canary_status(&mut self) -> Result<(), ReconcileError> {
        let mut status = self.calculate_base_status()?;
        let steps = step_count(self.rollout.steps());

        if self.status.current_pod_hash != status.current_pod_hash
            || self.status.current_step_hash != status.current_step_hash
        {
            status.current_step_index = (steps > 0).then_some(0);
            status.set_pause = None;
            status.pause_start_time = None;
            status.abort = false;
            status.canary.step_statuses.clear();
            // Rolling back to the stable template: nothing to step through.
            if steps > 0 && !status.stable_rs.is_empty() && status.stable_rs == status.current_pod_hash
            {
                status.current_step_index = Some(steps);
            }
            self.set_available_condition(&mut status)?;
            return self.persist_status(status).await;
        }

        if status.abort {
            self.set_available_condition(&mut status)?;
            return self.persist_status(status).await;
        }

        if status.stable_rs.is_empty() {
            status.stable_rs = status.current_pod_hash.clone();
            status.current_step_index = (steps > 0).then_some(steps);
            self.set_available_condition(&mut status)?;
            return self.persist_status(status).await;
        }

        let index = status.current_step_index.unwrap_or(0);
        if steps == 0 || index >= steps {
            let others = self.other_rss();
            let promote = status.stable_rs != status.current_pod_hash
                && at_desired_replica_counts_for_canary(
                    &self.rollout,
                    self.new_rs.as_ref(),
                    self.stable_rs(),
                    &others,
                )?;
            if promote {
                status.stable_rs = status.current_pod_hash.clone();
            }
            self.set_available_condition(&mut status)?;
            self.persist_status(status).await?;
            if promote {
                info!("Rollout {}: promoted to stable", self.key());
                self.record_event(
                    EventType::Normal,
                    REASON_PROMOTED,
                    format!("Rollout promoted {} to stable", self.status.stable_rs),
                )
                .await;
            }
            return Ok(());
        }

        let completed = !self.rollout.spec.paused && self.completed_current_step()?;
        if completed {
            status.current_step_index = Some(index + 1);
            status.set_pause = None;
            status.pause_start_time = None;
        }
        self.set_available_condition(&mut status)?;
        self.persist_status(status).await?;
        if completed {
            info!("Rollout {}: completed step {}/{}", self.key(), index + 1, steps);
            self.record_event(
                EventType::Normal,
                REASON_STEP_COMPLETED,
                format!("Rollout step {}/{} completed", index + 1, steps),
            )
            .await;
        }
        Ok(())
    }
}
