use crate::client::ApiError;

/// Why a reconcile pass stopped early. Every variant is retried by the
/// work queue with backoff.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("service {0} not found")]
    MissingService(String),
    #[error("hash collision creating replica set {name}, collision count is now {collision_count}")]
    HashCollision { name: String, collision_count: i32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
