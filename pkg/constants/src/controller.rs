//! Rollout controller tuning.

/// Concurrent reconcile workers (each handles a different Rollout key).
pub const DEFAULT_WORKERS: usize = 4;

/// Full resync interval: every Rollout is re-enqueued this often.
pub const DEFAULT_RESYNC_SECS: u64 = 30;

/// First retry delay after a failed reconcile.
pub const BACKOFF_BASE_MILLIS: u64 = 5;

/// Upper bound for the per-key retry delay.
pub const BACKOFF_MAX_SECS: u64 = 300;

/// Attempts made by the conflict-retry combinator around a single write.
pub const CONFLICT_RETRY_ATTEMPTS: u32 = 5;
