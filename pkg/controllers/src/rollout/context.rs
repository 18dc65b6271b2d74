use pkg_constants::rollout::{POD_TEMPLATE_HASH_LABEL, ROLLOUT_KIND};
use pkg_types::event::{Event, EventType};
use pkg_types::replicaset::ReplicaSet;
use pkg_types::rollout::{Rollout, RolloutStatus};
use std::time::Duration;
use tracing::warn;

use crate::client::ClusterClient;
use crate::collaborators::Collaborators;
use crate::error::ReconcileError;
use crate::rollout::hash::template_hash;

/// State of a single reconcile pass for one Rollout.
///
/// `rollout.status` always mirrors what was last written to the store, so
/// the final status write is the diff against it. `status` is the working
/// copy that collaborator results and gate flags are recorded in during the
/// pass. ReplicaSets are replaced by the objects the API returned.
pub(crate) struct RolloutContext<'a, C: ClusterClient> {
    pub(crate) client: &'a C,
    pub(crate) collaborators: &'a Collaborators,
    pub(crate) rollout: Rollout,
    pub(crate) status: RolloutStatus,
    pub(crate) new_rs: Option<ReplicaSet>,
    /// Every owned ReplicaSet except the new one, oldest first.
    pub(crate) old_rss: Vec<ReplicaSet>,
    pub(crate) requeue_after: Option<Duration>,
}

impl<'a, C: ClusterClient> RolloutContext<'a, C> {
    pub(crate) fn new(
        client: &'a C,
        collaborators: &'a Collaborators,
        rollout: Rollout,
        mut owned: Vec<ReplicaSet>,
    ) -> Self {
        sort_by_creation(&mut owned);
        Self {
            client,
            collaborators,
            status: rollout.status.clone(),
            rollout,
            new_rs: None,
            old_rss: owned,
            requeue_after: None,
        }
    }

    pub(crate) fn key(&self) -> String {
        self.rollout.metadata.key()
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.rollout.metadata.namespace
    }

    pub(crate) fn name(&self) -> &str {
        &self.rollout.metadata.name
    }

    pub(crate) fn all_rss(&self) -> impl Iterator<Item = &ReplicaSet> {
        self.new_rs.iter().chain(self.old_rss.iter())
    }

    /// ReplicaSet whose hash is `status.stableRS`. May be the new one.
    pub(crate) fn stable_rs(&self) -> Option<&ReplicaSet> {
        let stable = self.status.stable_rs.as_str();
        if stable.is_empty() {
            return None;
        }
        self.all_rss()
            .find(|rs| rs.label(POD_TEMPLATE_HASH_LABEL) == Some(stable))
    }

    /// Old ReplicaSets other than the stable one.
    pub(crate) fn other_rss(&self) -> Vec<&ReplicaSet> {
        let stable = self.stable_rs().map(|rs| rs.name().to_string());
        self.old_rss
            .iter()
            .filter(|rs| Some(rs.name()) != stable.as_deref())
            .collect()
    }

    /// Replace the in-memory copy of `rs` with a freshly written one.
    pub(crate) fn store_rs(&mut self, rs: ReplicaSet) {
        if let Some(new_rs) = self.new_rs.as_mut()
            && new_rs.name() == rs.name()
        {
            *new_rs = rs;
            return;
        }
        match self.old_rss.iter_mut().find(|o| o.name() == rs.name()) {
            Some(old) => *old = rs,
            None => self.old_rss.push(rs),
        }
    }

    pub(crate) fn forget_rs(&mut self, name: &str) {
        self.old_rss.retain(|rs| rs.name() != name);
    }

    /// Hash of the new ReplicaSet, or the hash it would be created with.
    pub(crate) fn current_pod_hash(&self) -> Result<String, ReconcileError> {
        if let Some(hash) = self
            .new_rs
            .as_ref()
            .and_then(|rs| rs.label(POD_TEMPLATE_HASH_LABEL))
        {
            return Ok(hash.to_string());
        }
        Ok(template_hash(
            &self.rollout.spec.template,
            self.status.collision_count,
        )?)
    }

    /// Ask for another pass after `delay`. The shortest request wins.
    pub(crate) fn requeue_after(&mut self, delay: Duration) {
        self.requeue_after = Some(match self.requeue_after {
            Some(current) => current.min(delay),
            None => delay,
        });
    }

    /// Best effort: a failed event write is logged, never fails the pass.
    pub(crate) async fn record_event(
        &self,
        event_type: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        let event = Event::new(
            ROLLOUT_KIND,
            &self.rollout.metadata,
            event_type,
            reason,
            message,
        );
        if let Err(e) = self.client.record_event(&event).await {
            warn!("Rollout {}: failed to record event {}: {}", self.key(), reason, e);
        }
    }
}

/// Oldest first; ties broken by name so the order is deterministic.
pub(crate) fn sort_by_creation(rss: &mut [ReplicaSet]) {
    rss.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
            .then_with(|| a.name().cmp(b.name()))
    });
}
