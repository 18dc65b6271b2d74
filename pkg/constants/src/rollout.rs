//! Rollout annotation keys, labels and strategy defaults.
//!
//! Annotation keys are part of the persisted state layout: replica sets
//! created by older controller versions keep carrying them, so their
//! spelling must never change.

// ─── Annotations ───────────────────────────────────────────────────────────

/// Revision of a ReplicaSet, and the current revision of its Rollout.
pub const REVISION_ANNOTATION: &str = "rollout.k3rs.io/revision";

/// Comma-separated list of revisions a ReplicaSet held before it was
/// promoted again (rollback to an earlier template).
pub const REVISION_HISTORY_ANNOTATION: &str = "rollout.k3rs.io/revision-history";

/// `spec.replicas` of the Rollout at the time the ReplicaSet was last scaled.
pub const DESIRED_REPLICAS_ANNOTATION: &str = "rollout.k3rs.io/desired-replicas";

/// `metadata.generation` of the Rollout that last synced the ReplicaSet.
pub const WORKLOAD_GENERATION_ANNOTATION: &str = "rollout.k3rs.io/workload-generation";

/// Annotations that are owned by the controller and never copied from the
/// Rollout onto its ReplicaSets.
pub const LEDGER_ANNOTATIONS: &[&str] = &[
    REVISION_ANNOTATION,
    REVISION_HISTORY_ANNOTATION,
    DESIRED_REPLICAS_ANNOTATION,
    WORKLOAD_GENERATION_ANNOTATION,
];

/// Set on services whose selector is managed by a Rollout; the value is the
/// Rollout name. Lets service changes be mapped back to their Rollout.
pub const MANAGED_BY_ANNOTATION: &str = "rollout.k3rs.io/managed-by";

// ─── Labels ────────────────────────────────────────────────────────────────

/// Label added to ReplicaSets, their pod templates and service selectors.
pub const POD_TEMPLATE_HASH_LABEL: &str = "rollouts-pod-template-hash";

// ─── Kinds ─────────────────────────────────────────────────────────────────

pub const ROLLOUT_KIND: &str = "Rollout";
pub const REPLICASET_KIND: &str = "ReplicaSet";
pub const SERVICE_KIND: &str = "Service";
pub const EVENT_KIND: &str = "Event";

// ─── Defaults ──────────────────────────────────────────────────────────────

/// Default `spec.replicas` when unset.
pub const DEFAULT_REPLICAS: i32 = 1;

/// Default maxSurge for canary rollouts.
pub const DEFAULT_MAX_SURGE: &str = "25%";

/// Default maxUnavailable for canary rollouts.
pub const DEFAULT_MAX_UNAVAILABLE: &str = "25%";

/// Old ReplicaSets kept around for rollback.
pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 10;

/// Traffic weight once there is no current canary step.
pub const FULL_WEIGHT: i32 = 100;

// ─── Event reasons ─────────────────────────────────────────────────────────

pub const REASON_SCALING_REPLICASET: &str = "ScalingReplicaSet";
pub const REASON_NEW_REPLICASET: &str = "NewReplicaSetCreated";
pub const REASON_FAILED_RS_CREATE: &str = "ReplicaSetCreateError";
pub const REASON_HASH_COLLISION: &str = "HashCollision";
pub const REASON_STEP_COMPLETED: &str = "RolloutStepCompleted";
pub const REASON_PAUSED: &str = "RolloutPaused";
pub const REASON_RESUMED: &str = "RolloutResumed";
pub const REASON_PROMOTED: &str = "RolloutPromoted";
pub const REASON_ABORTED: &str = "RolloutAborted";
pub const REASON_SWITCH_SERVICE: &str = "SwitchService";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_DELETED_REPLICASET: &str = "DeletedReplicaSet";

// ─── Condition reasons ─────────────────────────────────────────────────────

pub const REASON_AVAILABLE: &str = "MinimumReplicasAvailable";
pub const REASON_UNAVAILABLE: &str = "MinimumReplicasUnavailable";
