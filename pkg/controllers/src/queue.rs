use pkg_constants::controller::{BACKOFF_BASE_MILLIS, BACKOFF_MAX_SECS};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Rate-limited work queue of `namespace/name` keys.
///
/// A key is queued at most once. A key handed out by [`WorkQueue::get`] is
/// not handed out again until [`WorkQueue::done`] is called for it; if it was
/// re-added meanwhile it goes back on the queue at that point.
#[derive(Clone)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    stopped: Arc<Notify>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            stopped: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Add `key` after its per-key backoff, which doubles on every call
    /// until [`WorkQueue::forget`] resets it.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = backoff(*failures);
            *failures += 1;
            delay
        };
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as finished. A key re-added while it was being processed
    /// is queued again.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys. Workers blocked in [`WorkQueue::get`] return
    /// `None`.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
        self.stopped.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Resolves once [`WorkQueue::shutdown`] has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_shutting_down() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff(failures: u32) -> Duration {
    let max = Duration::from_secs(BACKOFF_MAX_SECS);
    let factor = 2u64.checked_pow(failures).unwrap_or(u64::MAX);
    BACKOFF_BASE_MILLIS
        .checked_mul(factor)
        .map(Duration::from_millis)
        .map_or(max, |d| d.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_adds_are_collapsed() {
        let q = WorkQueue::new();
        q.add("default/web");
        q.add("default/web");
        q.add("default/api");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("default/web"));
        assert_eq!(q.get().await.as_deref(), Some("default/api"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_requeued_on_done() {
        let q = WorkQueue::new();
        q.add("default/web");
        let key = q.get().await.unwrap();

        q.add("default/web");
        assert!(q.is_empty(), "key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("default/web"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let q = WorkQueue::new();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(worker.await.unwrap(), None);
        q.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_the_key() {
        let q = WorkQueue::new();
        q.add_after("default/web", Duration::from_secs(10));
        tokio::task::yield_now().await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_counts_and_forget_resets() {
        let q = WorkQueue::new();
        q.add_rate_limited("default/web");
        q.add_rate_limited("default/web");
        assert_eq!(q.num_requeues("default/web"), 2);
        q.forget("default/web");
        assert_eq!(q.num_requeues("default/web"), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_millis(5));
        assert_eq!(backoff(1), Duration::from_millis(10));
        assert_eq!(backoff(4), Duration::from_millis(80));
        assert_eq!(backoff(30), Duration::from_secs(300));
        assert_eq!(backoff(200), Duration::from_secs(300));
    }
}
