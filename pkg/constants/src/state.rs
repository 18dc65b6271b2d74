//! State store key layout.

/// Prefix for all Rollout objects: `/registry/rollouts/{ns}/{name}`.
pub const ROLLOUTS_PREFIX: &str = "/registry/rollouts/";

/// Prefix for all ReplicaSet objects: `/registry/replicasets/{ns}/{name}`.
pub const REPLICASETS_PREFIX: &str = "/registry/replicasets/";

/// Prefix for all Service objects: `/registry/services/{ns}/{name}`.
pub const SERVICES_PREFIX: &str = "/registry/services/";

/// Prefix for recorded events: `/registry/events/{ns}/{uid}`.
pub const EVENTS_PREFIX: &str = "/registry/events/";

/// How many watch events a subscriber may fall behind before it lags.
pub const EVENT_LOG_CAPACITY: usize = 4096;
