use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::client::ApiError;

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or `attempts` runs out. `op` must re-read the object it writes on every
/// call, otherwise each retry just repeats the stale write.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!("conflict on attempt {}/{}: {}", attempt, attempts, e);
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
