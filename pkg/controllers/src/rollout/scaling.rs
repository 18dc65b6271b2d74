use pkg_constants::rollout::{FULL_WEIGHT, POD_TEMPLATE_HASH_LABEL, REASON_SCALING_REPLICASET};
use pkg_types::event::EventType;
use pkg_types::intstr::IntOrPercent;
use pkg_types::replicaset::ReplicaSet;
use pkg_types::rollout::{CanaryStep, Rollout, RolloutStrategy};
use std::cmp::Reverse;
use tracing::info;

use crate::client::ClusterClient;
use crate::error::ReconcileError;
use crate::rollout::annotations;
use crate::rollout::context::RolloutContext;

fn invalid(e: anyhow::Error) -> ReconcileError {
    ReconcileError::InvalidSpec(e.to_string())
}

/// Resolve surge and unavailability against `desired`. Surge rounds up,
/// unavailability down; both zero would deadlock, so unavailability
/// becomes 1.
pub fn resolve_fenceposts(
    max_surge: &IntOrPercent,
    max_unavailable: &IntOrPercent,
    desired: i32,
) -> Result<(i32, i32), ReconcileError> {
    let surge = max_surge.scaled_value(desired, true).map_err(invalid)?;
    let unavailable = max_unavailable
        .scaled_value(desired, false)
        .map_err(invalid)?;
    if surge == 0 && unavailable == 0 {
        return Ok((0, 1));
    }
    Ok((surge, unavailable))
}

pub fn max_surge(rollout: &Rollout) -> Result<i32, ReconcileError> {
    max_surge_for(rollout, rollout.replicas())
}

/// Surge the Rollout would allow at `replicas`. Blue-green never surges
/// through the budget; its new ReplicaSet is sized independently.
pub fn max_surge_for(rollout: &Rollout, replicas: i32) -> Result<i32, ReconcileError> {
    match rollout.canary() {
        Some(c) => Ok(resolve_fenceposts(
            &c.max_surge_or_default(),
            &c.max_unavailable_or_default(),
            replicas,
        )?
        .0),
        None => Ok(0),
    }
}

/// Blue-green never goes below `replicas`.
pub fn max_unavailable(rollout: &Rollout) -> Result<i32, ReconcileError> {
    let replicas = rollout.replicas();
    let Some(c) = rollout.canary() else {
        return Ok(0);
    };
    if replicas == 0 {
        return Ok(0);
    }
    let (_, unavailable) = resolve_fenceposts(
        &c.max_surge_or_default(),
        &c.max_unavailable_or_default(),
        replicas,
    )?;
    Ok(unavailable.min(replicas))
}

/// Current canary step and its index. The step is `None` when there are
/// no steps or the index ran past the end of the list.
pub fn current_canary_step(rollout: &Rollout) -> (Option<&CanaryStep>, Option<i32>) {
    let steps = rollout.steps();
    if steps.is_empty() {
        return (None, None);
    }
    let index = rollout.status.current_step_index.unwrap_or(0);
    let step = usize::try_from(index).ok().and_then(|i| steps.get(i));
    (step, Some(index))
}

/// Weight the canary should have right now: the last `setWeight` at or
/// before the current step, full weight past the end, zero when aborted.
pub fn current_set_weight(rollout: &Rollout) -> i32 {
    if rollout.status.abort {
        return 0;
    }
    let (Some(_), Some(index)) = current_canary_step(rollout) else {
        return FULL_WEIGHT;
    };
    rollout.steps()[..=index as usize]
        .iter()
        .rev()
        .find_map(|step| match step {
            CanaryStep::SetWeight(w) => Some(*w),
            _ => None,
        })
        .unwrap_or(0)
}

fn ceil_percent(replicas: i32, weight: i32) -> i32 {
    let scaled = i64::from(replicas) * i64::from(weight);
    ((scaled + 99).div_euclid(100)) as i32
}

/// Both sides of a non-integral split round up, so the budget needs one
/// extra replica to fit them.
fn extra_replica_added(replicas: i32, weight: i32) -> bool {
    (i64::from(replicas) * i64::from(weight)) % 100 != 0
}

/// Replica counts `(new, stable)` for this pass.
///
/// Scale-up goes to the stable ReplicaSet first, then to the new one, and
/// never past `replicas + maxSurge`. Scale-down only counts the
/// availability of the new and stable ReplicaSets, never of older ones,
/// and never takes availability below `replicas - maxUnavailable`.
pub fn calculate_canary_counts(
    rollout: &Rollout,
    new_rs: Option<&ReplicaSet>,
    stable_rs: Option<&ReplicaSet>,
    others: &[&ReplicaSet],
) -> Result<(i32, i32), ReconcileError> {
    let replicas = rollout.replicas();
    let weight = current_set_weight(rollout);
    let desired_stable = ceil_percent(replicas, FULL_WEIGHT - weight);
    let desired_new = ceil_percent(replicas, weight);

    let Some(stable) = stable_rs else {
        return Ok((replicas, 0));
    };
    if let Some(new) = new_rs
        && new.label(POD_TEMPLATE_HASH_LABEL) == stable.label(POD_TEMPLATE_HASH_LABEL)
    {
        return Ok((replicas, 0));
    }

    let mut new_count = new_rs.map_or(0, |rs| rs.spec.replicas);
    let mut stable_count = stable.spec.replicas;

    let mut surge = max_surge(rollout)?;
    if extra_replica_added(replicas, weight) {
        surge += 1;
    }
    let max_allowed = replicas + surge;
    let total: i32 =
        others.iter().map(|rs| rs.spec.replicas).sum::<i32>() + new_count + stable_count;

    let mut scale_up = max_allowed - total;
    if scale_up > 0 && stable_count < desired_stable {
        let grow = (desired_stable - stable_count).min(scale_up);
        stable_count += grow;
        scale_up -= grow;
    }
    if scale_up > 0 && new_count < desired_new {
        new_count += (desired_new - new_count).min(scale_up);
    }

    let min_available = replicas - max_unavailable(rollout)?;
    let pool = new_rs.map_or(0, ReplicaSet::available_for_scale_down)
        + stable.available_for_scale_down();
    if pool <= min_available {
        return Ok((new_count, stable_count));
    }
    let mut scale_down = pool - min_available;
    if let Some(new) = new_rs
        && new.spec.replicas > desired_new
    {
        if new.spec.replicas - scale_down < desired_new {
            new_count = desired_new;
            scale_down -= new.spec.replicas - desired_new;
        } else {
            new_count = new.spec.replicas - scale_down;
            scale_down = 0;
        }
    }
    if scale_down > 0 && stable.spec.replicas > desired_stable {
        if stable.spec.replicas - scale_down < desired_stable {
            stable_count = desired_stable;
        } else {
            stable_count = stable.spec.replicas - scale_down;
        }
    }
    Ok((new_count, stable_count))
}

/// True once the new and stable ReplicaSets are at their calculated counts,
/// fully available, and no older ReplicaSet still has available replicas.
pub fn at_desired_replica_counts_for_canary(
    rollout: &Rollout,
    new_rs: Option<&ReplicaSet>,
    stable_rs: Option<&ReplicaSet>,
    others: &[&ReplicaSet],
) -> Result<bool, ReconcileError> {
    let (desired_new, desired_stable) =
        calculate_canary_counts(rollout, new_rs, stable_rs, others)?;
    let (Some(new), Some(stable)) = (new_rs, stable_rs) else {
        return Ok(false);
    };
    if new.spec.replicas != desired_new || new.status.available_replicas != desired_new {
        return Ok(false);
    }
    if stable.spec.replicas != desired_stable || stable.status.available_replicas != desired_stable
    {
        return Ok(false);
    }
    Ok(others
        .iter()
        .map(|rs| rs.status.available_replicas)
        .sum::<i32>()
        == 0)
}

/// The only active ReplicaSet, or the newest one when none is active.
/// `None` when several are active. `old` must be sorted oldest first.
pub fn find_active_or_latest<'a>(
    new_rs: Option<&'a ReplicaSet>,
    old: &'a [ReplicaSet],
) -> Option<&'a ReplicaSet> {
    let active: Vec<&ReplicaSet> = new_rs
        .into_iter()
        .chain(old.iter())
        .filter(|rs| rs.spec.replicas > 0)
        .collect();
    match active.as_slice() {
        [] => new_rs.or_else(|| old.last()),
        [only] => Some(only),
        _ => None,
    }
}

/// At full size for the current `spec.replicas` and fully available.
pub fn is_saturated(rollout: &Rollout, rs: Option<&ReplicaSet>) -> bool {
    let Some(rs) = rs else {
        return false;
    };
    let replicas = rollout.replicas();
    rs.spec.replicas == replicas
        && annotations::desired_replicas(&rs.metadata) == Some(replicas)
        && rs.status.available_replicas == replicas
}

fn replicaset_fraction(rs: &ReplicaSet, rollout: &Rollout) -> Result<i32, ReconcileError> {
    let replicas = rollout.replicas();
    if replicas == 0 {
        return Ok(-rs.spec.replicas);
    }
    let rollout_total = replicas + max_surge(rollout)?;
    let annotated_total = match annotations::desired_replicas(&rs.metadata) {
        Some(desired) => desired + max_surge_for(rollout, desired)?,
        None => rollout.status.replicas,
    };
    if annotated_total <= 0 {
        return Ok(0);
    }
    let new_size =
        (f64::from(rs.spec.replicas) * f64::from(rollout_total) / f64::from(annotated_total)).round();
    Ok(new_size as i32 - rs.spec.replicas)
}

/// Share of `to_add` (negative when shrinking) that `rs` should receive,
/// bounded by what is left after `added` was handed out.
pub fn get_proportion(
    rs: &ReplicaSet,
    rollout: &Rollout,
    to_add: i32,
    added: i32,
) -> Result<i32, ReconcileError> {
    if rs.spec.replicas == 0 || to_add == 0 || to_add == added {
        return Ok(0);
    }
    let fraction = replicaset_fraction(rs, rollout)?;
    let allowed = to_add - added;
    if to_add > 0 {
        Ok(fraction.min(allowed))
    } else {
        Ok(fraction.max(allowed))
    }
}

impl<C: ClusterClient> RolloutContext<'_, C> {
    /// Set `rs` to `new_scale` replicas and stamp the desired-replicas
    /// annotation. Issues no write when both already match. Returns whether
    /// the size changed.
    pub(crate) async fn scale_replica_set(
        &mut self,
        rs: ReplicaSet,
        new_scale: i32,
    ) -> Result<bool, ReconcileError> {
        let replicas = self.rollout.replicas();
        let size_needs_update = rs.spec.replicas != new_scale;
        let annotations_need_update =
            annotations::replicas_annotations_need_update(&rs.metadata, replicas);
        if !size_needs_update && !annotations_need_update {
            return Ok(false);
        }

        let old_scale = rs.spec.replicas;
        let mut updated = rs;
        updated.spec.replicas = new_scale;
        annotations::set_replicas_annotations(&mut updated.metadata, replicas);
        let updated = self.client.update_replicaset(&updated).await?;
        let name = updated.name().to_string();
        self.store_rs(updated);

        if size_needs_update {
            let direction = if old_scale < new_scale { "up" } else { "down" };
            let message = format!(
                "Scaled {} replica set {} from {} to {}",
                direction, name, old_scale, new_scale
            );
            info!("Rollout {}: {}", self.key(), message);
            self.record_event(EventType::Normal, REASON_SCALING_REPLICASET, message)
                .await;
        }
        Ok(size_needs_update)
    }

    /// Initial or target size of the new ReplicaSet.
    pub(crate) fn new_rs_new_replicas(&self, new_rs: &ReplicaSet) -> Result<i32, ReconcileError> {
        match &self.rollout.spec.strategy {
            RolloutStrategy::BlueGreen(_) => Ok(self.rollout.replicas()),
            RolloutStrategy::Canary(_) => {
                let stable = self.stable_rs();
                let others = self.other_rss();
                let (new_count, _) =
                    calculate_canary_counts(&self.rollout, Some(new_rs), stable, &others)?;
                Ok(new_count)
            }
        }
    }

    /// Generic scaling used when `spec.replicas` changed under a running
    /// rollout: one active ReplicaSet takes the full count; a saturated new
    /// ReplicaSet drains the rest; otherwise the change is spread over the
    /// active ReplicaSets in proportion to their size.
    pub(crate) async fn scale(&mut self) -> Result<(), ReconcileError> {
        let replicas = self.rollout.replicas();
        if let Some(target) = find_active_or_latest(self.new_rs.as_ref(), &self.old_rss) {
            let target = target.clone();
            self.scale_replica_set(target, replicas).await?;
            return Ok(());
        }

        if is_saturated(&self.rollout, self.new_rs.as_ref()) {
            let active: Vec<ReplicaSet> = self
                .old_rss
                .iter()
                .filter(|rs| rs.spec.replicas > 0)
                .cloned()
                .collect();
            for rs in active {
                self.scale_replica_set(rs, 0).await?;
            }
            return Ok(());
        }

        let mut active: Vec<ReplicaSet> = self
            .all_rss()
            .filter(|rs| rs.spec.replicas > 0)
            .cloned()
            .collect();
        let allowed = if replicas > 0 {
            replicas + max_surge(&self.rollout)?
        } else {
            0
        };
        let current: i32 = self.all_rss().map(|rs| rs.spec.replicas).sum();
        let to_add = allowed - current;

        // Largest first; growth favours newer, shrinking favours older.
        if to_add > 0 {
            active.sort_by_key(|rs| {
                (
                    Reverse(rs.spec.replicas),
                    Reverse(rs.metadata.creation_timestamp),
                )
            });
        } else {
            active.sort_by_key(|rs| (Reverse(rs.spec.replicas), rs.metadata.creation_timestamp));
        }

        let mut sizes = Vec::with_capacity(active.len());
        let mut added = 0;
        for rs in &active {
            let proportion = if to_add != 0 {
                get_proportion(rs, &self.rollout, to_add, added)?
            } else {
                0
            };
            sizes.push(rs.spec.replicas + proportion);
            added += proportion;
        }
        if to_add != 0
            && let Some(first) = sizes.first_mut()
        {
            *first = (*first + to_add - added).max(0);
        }

        for (rs, size) in active.into_iter().zip(sizes) {
            self.scale_replica_set(rs, size).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{canary_rollout, replicaset};
    use pkg_types::rollout::PauseStep;

    fn with_budget(mut rollout: Rollout, surge: IntOrPercent, unavailable: IntOrPercent) -> Rollout {
        if let RolloutStrategy::Canary(c) = &mut rollout.spec.strategy {
            c.max_surge = Some(surge);
            c.max_unavailable = Some(unavailable);
        }
        rollout
    }

    #[test]
    fn fenceposts_never_both_zero() {
        let zero = IntOrPercent::Int(0);
        assert_eq!(resolve_fenceposts(&zero, &zero, 10).unwrap(), (0, 1));
        assert_eq!(
            resolve_fenceposts(&IntOrPercent::percent(25), &IntOrPercent::percent(25), 10).unwrap(),
            (3, 2)
        );
    }

    #[test]
    fn weight_follows_steps() {
        let mut r = canary_rollout(
            10,
            vec![
                CanaryStep::SetWeight(20),
                CanaryStep::Pause(PauseStep::default()),
                CanaryStep::SetWeight(60),
            ],
        );
        r.status.current_step_index = Some(1);
        assert_eq!(current_set_weight(&r), 20);
        r.status.current_step_index = Some(2);
        assert_eq!(current_set_weight(&r), 60);
        r.status.current_step_index = Some(3);
        assert_eq!(current_set_weight(&r), 100);
        r.status.abort = true;
        assert_eq!(current_set_weight(&r), 0);

        let mut before_weight = canary_rollout(10, vec![CanaryStep::Pause(PauseStep::default())]);
        before_weight.status.current_step_index = Some(0);
        assert_eq!(current_set_weight(&before_weight), 0);

        assert_eq!(current_set_weight(&canary_rollout(10, vec![])), 100);
    }

    #[test]
    fn no_stable_goes_straight_to_full_size() {
        let r = canary_rollout(5, vec![CanaryStep::SetWeight(20)]);
        let new = replicaset("web-new", "new", 0, 0, 1);
        assert_eq!(
            calculate_canary_counts(&r, Some(&new), None, &[]).unwrap(),
            (5, 0)
        );
    }

    #[test]
    fn stable_equal_to_new_is_fully_promoted() {
        let mut r = canary_rollout(5, vec![CanaryStep::SetWeight(20)]);
        r.status.stable_rs = "abc".to_string();
        let rs = replicaset("web-abc", "abc", 5, 5, 1);
        assert_eq!(
            calculate_canary_counts(&r, Some(&rs), Some(&rs), &[]).unwrap(),
            (5, 0)
        );
    }

    #[test]
    fn integral_split_stays_within_surge() {
        // 10 replicas at 20%: 2 canary, 8 stable, maxSurge 1, maxUnavailable 0
        let mut r = with_budget(
            canary_rollout(10, vec![CanaryStep::SetWeight(20)]),
            IntOrPercent::Int(1),
            IntOrPercent::Int(0),
        );
        r.status.stable_rs = "stable".to_string();
        r.status.current_step_index = Some(0);
        let stable = replicaset("web-stable", "stable", 10, 10, 1);
        let new = replicaset("web-new", "new", 0, 0, 2);

        let (new_count, stable_count) =
            calculate_canary_counts(&r, Some(&new), Some(&stable), &[]).unwrap();
        assert_eq!((new_count, stable_count), (1, 10));
        assert!(new_count + stable_count <= 10 + 1);
    }

    #[test]
    fn non_integral_split_surges_by_one() {
        // 10 replicas at 15%: ceil(1.5) = 2 canary and ceil(8.5) = 9 stable
        let mut r = with_budget(
            canary_rollout(10, vec![CanaryStep::SetWeight(15)]),
            IntOrPercent::Int(0),
            IntOrPercent::Int(1),
        );
        r.status.stable_rs = "stable".to_string();
        r.status.current_step_index = Some(0);

        let stable = replicaset("web-stable", "stable", 9, 9, 1);
        let new = replicaset("web-new", "new", 1, 1, 2);
        let (new_count, stable_count) =
            calculate_canary_counts(&r, Some(&new), Some(&stable), &[]).unwrap();
        assert_eq!((new_count, stable_count), (2, 9));
        assert_eq!(new_count + stable_count, 10 + 0 + 1);
    }

    #[test]
    fn scale_down_respects_min_available() {
        // 4 replicas, maxUnavailable 1 (25%), weight 50: 2 + 2
        let mut r = canary_rollout(4, vec![CanaryStep::SetWeight(50)]);
        r.status.stable_rs = "stable".to_string();
        r.status.current_step_index = Some(0);

        // Canary is up but not yet available: stable must not shrink.
        let stable = replicaset("web-stable", "stable", 4, 4, 1);
        let new = replicaset("web-new", "new", 2, 0, 2);
        let (_, stable_count) =
            calculate_canary_counts(&r, Some(&new), Some(&stable), &[]).unwrap();
        let min_available = 4 - max_unavailable(&r).unwrap();
        assert!(stable_count >= min_available);
        assert_eq!(stable_count, 3);

        // Canary available: stable may drop to its desired share.
        let new = replicaset("web-new", "new", 2, 2, 2);
        let stable = replicaset("web-stable", "stable", 3, 3, 1);
        assert_eq!(
            calculate_canary_counts(&r, Some(&new), Some(&stable), &[]).unwrap(),
            (2, 2)
        );
    }

    #[test]
    fn older_replicasets_do_not_protect_capacity() {
        let mut r = canary_rollout(4, vec![CanaryStep::SetWeight(50)]);
        r.status.stable_rs = "stable".to_string();
        r.status.current_step_index = Some(0);
        let stable = replicaset("web-stable", "stable", 2, 2, 2);
        let new = replicaset("web-new", "new", 2, 0, 3);
        let older = replicaset("web-older", "older", 2, 2, 1);
        // 2 available in new + stable, min available 3: nothing may shrink.
        assert_eq!(
            calculate_canary_counts(&r, Some(&new), Some(&stable), &[&older]).unwrap(),
            (2, 2)
        );
    }

    #[test]
    fn desired_counts_require_drained_older_replicasets() {
        let mut r = canary_rollout(4, vec![CanaryStep::SetWeight(50)]);
        r.status.stable_rs = "stable".to_string();
        r.status.current_step_index = Some(0);
        let stable = replicaset("web-stable", "stable", 2, 2, 2);
        let new = replicaset("web-new", "new", 2, 2, 3);
        assert!(at_desired_replica_counts_for_canary(&r, Some(&new), Some(&stable), &[]).unwrap());
        let older = replicaset("web-older", "older", 1, 1, 1);
        assert!(
            !at_desired_replica_counts_for_canary(&r, Some(&new), Some(&stable), &[&older])
                .unwrap()
        );
    }

    #[test]
    fn active_or_latest() {
        let new = replicaset("web-new", "new", 0, 0, 3);
        let old = vec![
            replicaset("web-a", "a", 0, 0, 1),
            replicaset("web-b", "b", 0, 0, 2),
        ];
        assert_eq!(find_active_or_latest(Some(&new), &old).unwrap().name(), "web-new");
        assert_eq!(find_active_or_latest(None, &old).unwrap().name(), "web-b");

        let old = vec![replicaset("web-a", "a", 3, 3, 1)];
        assert_eq!(find_active_or_latest(Some(&new), &old).unwrap().name(), "web-a");

        let new = replicaset("web-new", "new", 1, 0, 3);
        assert!(find_active_or_latest(Some(&new), &old).is_none());
    }

    #[test]
    fn proportion_is_bounded_by_what_is_left() {
        let r = with_budget(
            canary_rollout(15, vec![]),
            IntOrPercent::Int(0),
            IntOrPercent::Int(1),
        );
        let mut rs = replicaset("web-a", "a", 6, 6, 1);
        annotations::set_replicas_annotations(&mut rs.metadata, 10);
        // 6 * 15 / 10 = 9, so +3; only 2 left to hand out.
        assert_eq!(get_proportion(&rs, &r, 5, 0).unwrap(), 3);
        assert_eq!(get_proportion(&rs, &r, 5, 3).unwrap(), 2);
        assert_eq!(get_proportion(&rs, &r, 5, 5).unwrap(), 0);
    }

    #[test]
    fn blue_green_budgets_are_zero() {
        let r = crate::testing::blue_green_rollout(3, "web-active", "");
        assert_eq!(max_unavailable(&r).unwrap(), 0);
        assert_eq!(max_surge(&r).unwrap(), 0);
    }
}
