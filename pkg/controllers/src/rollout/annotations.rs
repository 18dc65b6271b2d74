//! Typed access to the annotations the controller uses as durable memory.
//!
//! All values are decimal strings. A value that fails to parse is treated
//! as absent and gets overwritten on the next write.

use pkg_constants::rollout::{
    DESIRED_REPLICAS_ANNOTATION, LEDGER_ANNOTATIONS, REVISION_ANNOTATION,
    REVISION_HISTORY_ANNOTATION, WORKLOAD_GENERATION_ANNOTATION,
};
use pkg_types::meta::ObjectMeta;
use pkg_types::replicaset::ReplicaSet;
use pkg_types::rollout::Rollout;
use tracing::warn;

pub fn revision(meta: &ObjectMeta) -> Option<i64> {
    meta.annotations.get(REVISION_ANNOTATION)?.parse().ok()
}

/// Highest revision among `rss`, 0 when none carries one.
pub fn max_revision<'a>(rss: impl IntoIterator<Item = &'a ReplicaSet>) -> i64 {
    rss.into_iter()
        .filter_map(|rs| revision(&rs.metadata))
        .max()
        .unwrap_or(0)
}

pub fn desired_replicas(meta: &ObjectMeta) -> Option<i32> {
    meta.annotations.get(DESIRED_REPLICAS_ANNOTATION)?.parse().ok()
}

pub fn replicas_annotations_need_update(meta: &ObjectMeta, desired: i32) -> bool {
    desired_replicas(meta) != Some(desired)
}

/// Record the Rollout's `spec.replicas` on a ReplicaSet. Returns whether
/// anything changed.
pub fn set_replicas_annotations(meta: &mut ObjectMeta, desired: i32) -> bool {
    if !replicas_annotations_need_update(meta, desired) {
        return false;
    }
    meta.annotations
        .insert(DESIRED_REPLICAS_ANNOTATION.to_string(), desired.to_string());
    true
}

pub fn workload_generation(meta: &ObjectMeta) -> Option<u64> {
    meta.annotations
        .get(WORKLOAD_GENERATION_ANNOTATION)?
        .parse()
        .ok()
}

pub fn set_workload_generation(meta: &mut ObjectMeta, generation: u64) -> bool {
    if workload_generation(meta) == Some(generation) {
        return false;
    }
    meta.annotations.insert(
        WORKLOAD_GENERATION_ANNOTATION.to_string(),
        generation.to_string(),
    );
    true
}

/// Raise the revision of the new ReplicaSet to `new_revision`.
///
/// A revision is never lowered. When an existing revision is replaced it is
/// appended to the revision history. For a ReplicaSet that is about to be
/// created (`exists == false`) the desired-replicas annotation is set too.
pub fn set_new_replicaset_annotations(
    rollout: &Rollout,
    rs: &mut ReplicaSet,
    new_revision: i64,
    exists: bool,
) -> bool {
    let mut changed = false;
    let old_value = rs.metadata.annotations.get(REVISION_ANNOTATION).cloned();
    let old_revision = match old_value.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    "ReplicaSet {}: unparsable revision '{}': {}",
                    rs.metadata.key(),
                    raw,
                    e
                );
                return false;
            }
        },
    };

    if old_revision.is_none_or(|old| old < new_revision) {
        rs.metadata
            .annotations
            .insert(REVISION_ANNOTATION.to_string(), new_revision.to_string());
        changed = true;
        if let Some(old) = old_revision {
            let history = match rs.metadata.annotations.get(REVISION_HISTORY_ANNOTATION) {
                Some(h) if !h.is_empty() => format!("{},{}", h, old),
                _ => old.to_string(),
            };
            rs.metadata
                .annotations
                .insert(REVISION_HISTORY_ANNOTATION.to_string(), history);
        }
    }

    if !exists && set_replicas_annotations(&mut rs.metadata, rollout.replicas()) {
        changed = true;
    }
    changed
}

/// Copy user annotations of the Rollout onto the ReplicaSet. Ledger keys
/// are owned by the controller and skipped.
pub fn copy_rollout_annotations(rollout: &Rollout, rs: &mut ReplicaSet) -> bool {
    let mut changed = false;
    for (k, v) in &rollout.metadata.annotations {
        if LEDGER_ANNOTATIONS.contains(&k.as_str()) {
            continue;
        }
        if rs.metadata.annotations.get(k) != Some(v) {
            rs.metadata.annotations.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// Set the Rollout's own revision annotation. Returns whether it changed.
pub fn set_rollout_revision(rollout: &mut Rollout, revision: &str) -> bool {
    if rollout.metadata.annotations.get(REVISION_ANNOTATION).map(String::as_str) == Some(revision) {
        return false;
    }
    rollout
        .metadata
        .annotations
        .insert(REVISION_ANNOTATION.to_string(), revision.to_string());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::pod::PodTemplateSpec;
    use pkg_types::replicaset::ReplicaSetSpec;
    use pkg_types::rollout::{CanaryStrategy, RolloutSpec, RolloutStrategy};

    fn rollout() -> Rollout {
        let mut meta = ObjectMeta::new("default", "web");
        meta.annotations
            .insert("team".to_string(), "payments".to_string());
        meta.annotations
            .insert(REVISION_ANNOTATION.to_string(), "7".to_string());
        Rollout {
            metadata: meta,
            spec: RolloutSpec {
                replicas: Some(4),
                selector: Default::default(),
                template: PodTemplateSpec::default(),
                min_ready_seconds: 0,
                strategy: RolloutStrategy::Canary(CanaryStrategy::default()),
                revision_history_limit: None,
                paused: false,
            },
            status: Default::default(),
        }
    }

    fn rs(revision: Option<&str>) -> ReplicaSet {
        let mut meta = ObjectMeta::new("default", "web-abc");
        if let Some(r) = revision {
            meta.annotations
                .insert(REVISION_ANNOTATION.to_string(), r.to_string());
        }
        ReplicaSet {
            metadata: meta,
            spec: ReplicaSetSpec {
                replicas: 0,
                min_ready_seconds: 0,
                selector: Default::default(),
                template: PodTemplateSpec::default(),
            },
            status: Default::default(),
        }
    }

    #[test]
    fn revision_is_raised_and_history_kept() {
        let r = rollout();
        let mut target = rs(Some("2"));
        assert!(set_new_replicaset_annotations(&r, &mut target, 5, true));
        assert_eq!(revision(&target.metadata), Some(5));
        assert_eq!(
            target.metadata.annotations[REVISION_HISTORY_ANNOTATION],
            "2"
        );

        assert!(set_new_replicaset_annotations(&r, &mut target, 8, true));
        assert_eq!(
            target.metadata.annotations[REVISION_HISTORY_ANNOTATION],
            "2,5"
        );
    }

    #[test]
    fn revision_is_never_lowered() {
        let r = rollout();
        let mut target = rs(Some("9"));
        assert!(!set_new_replicaset_annotations(&r, &mut target, 4, true));
        assert_eq!(revision(&target.metadata), Some(9));
        assert!(!target
            .metadata
            .annotations
            .contains_key(REVISION_HISTORY_ANNOTATION));
    }

    #[test]
    fn new_replicaset_gets_desired_replicas() {
        let r = rollout();
        let mut target = rs(None);
        assert!(set_new_replicaset_annotations(&r, &mut target, 1, false));
        assert_eq!(desired_replicas(&target.metadata), Some(4));
        assert!(!target
            .metadata
            .annotations
            .contains_key(REVISION_HISTORY_ANNOTATION));
    }

    #[test]
    fn ledger_keys_are_not_copied() {
        let r = rollout();
        let mut target = rs(Some("3"));
        assert!(copy_rollout_annotations(&r, &mut target));
        assert_eq!(target.metadata.annotations["team"], "payments");
        assert_eq!(revision(&target.metadata), Some(3));
        assert!(!copy_rollout_annotations(&r, &mut target));
    }

    #[test]
    fn max_revision_ignores_garbage() {
        let rss = vec![rs(Some("3")), rs(Some("x")), rs(None), rs(Some("11"))];
        assert_eq!(max_revision(&rss), 11);
        assert_eq!(max_revision(Vec::<ReplicaSet>::new().iter()), 0);
    }

    #[test]
    fn replicas_annotation_round_trip() {
        let mut meta = ObjectMeta::new("default", "web-abc");
        assert!(set_replicas_annotations(&mut meta, 3));
        assert!(!set_replicas_annotations(&mut meta, 3));
        assert!(!replicas_annotations_need_update(&meta, 3));
        assert!(replicas_annotations_need_update(&meta, 5));
        assert!(set_workload_generation(&mut meta, 2));
        assert_eq!(workload_generation(&meta), Some(2));
    }
}
