//! A deduplicating, rate-limited queue of resource keys awaiting
//! reconciliation.
//!
//! The queue guarantees at most one in-flight reconciliation per key, which
//! is the invariant that lets the rest of the engine run without per-resource
//! locks. A key added while it is being processed is coalesced and re-queued
//! when the in-flight run completes, so no observed update is ever missed.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use functions_controller_core::ResourceId;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::{sync::Notify, time};

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    base_delay: time::Duration,
    max_delay: time::Duration,
    max_retries: u32,
}

#[derive(Default)]
struct State {
    order: VecDeque<ResourceId>,
    queued: HashSet<ResourceId>,
    active: HashSet<ResourceId>,
    dirty: HashSet<ResourceId>,
    retries: HashMap<ResourceId, u32>,
    shutdown: bool,
}

impl WorkQueue {
    pub fn new(base_delay: time::Duration, max_delay: time::Duration, max_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
            max_retries,
        })
    }

    /// Idempotently marks `key` as needing work. If the key is queued this is
    /// a no-op; if it is currently being processed, the key is marked dirty
    /// and re-queued once the in-flight run calls `done`.
    pub fn add(&self, key: ResourceId) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.order.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Blocks until a key is available, marking it in-flight. Returns `None`
    /// once the queue has been shut down.
    pub async fn next(&self) -> Option<ResourceId> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(key) = state.order.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks processing of `key` complete. If the key was re-added while
    /// in-flight it is immediately queued again.
    pub fn done(&self, key: &ResourceId) {
        let mut state = self.state.lock();
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
            state.order.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Schedules `key` to be re-added after `delay`, without blocking a
    /// worker. Implemented as a timer task rather than a busy wait.
    pub fn add_after(self: &Arc<Self>, key: ResourceId, delay: time::Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Requeues `key` after an exponential-backoff delay. Returns `false`
    /// once the per-key retry budget is spent; the key is then dropped and
    /// the next observed cache change must re-enqueue it.
    pub fn add_rate_limited(self: &Arc<Self>, key: ResourceId) -> bool {
        let attempt = {
            let mut state = self.state.lock();
            let attempt = state.retries.entry(key.clone()).or_insert(0);
            *attempt += 1;
            *attempt
        };
        if attempt > self.max_retries {
            self.state.lock().retries.remove(&key);
            tracing::warn!(%key, attempt, "Retry budget exhausted; dropping key");
            return false;
        }
        self.add_after(key, self.backoff(attempt));
        true
    }

    /// Resets the backoff counter for `key` after a successful pass.
    pub fn forget(&self, key: &ResourceId) {
        self.state.lock().retries.remove(key);
    }

    /// Unblocks all pending and future `next` calls. In-flight work is
    /// allowed to finish; nothing further is queued.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn backoff(&self, attempt: u32) -> time::Duration {
        self.base_delay
            .saturating_mul(1u32 << (attempt - 1).min(31))
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(name: &str) -> ResourceId {
        ResourceId::new("ns".to_string(), name.to_string())
    }

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Duration::from_millis(5), Duration::from_secs(300), 3)
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = queue();
        q.add(key("foo"));
        q.add(key("foo"));
        q.add(key("bar"));

        assert_eq!(q.next().await, Some(key("foo")));
        assert_eq!(q.next().await, Some(key("bar")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn per_key_exclusivity() {
        let q = queue();
        q.add(key("foo"));
        assert_eq!(q.next().await, Some(key("foo")));

        // The key is in-flight: re-adding must not hand it to another worker.
        q.add(key("foo"));
        assert!(q.is_empty());

        // Completion releases the coalesced add.
        q.done(&key("foo"));
        assert_eq!(q.next().await, Some(key("foo")));
        q.done(&key("foo"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn next_blocks_until_add() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.next().await }
        });
        tokio::task::yield_now().await;
        q.add(key("foo"));
        assert_eq!(waiter.await.unwrap(), Some(key("foo")));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_fires_on_schedule() {
        let q = queue();
        q.add_after(key("foo"), Duration::from_secs(3));
        tokio::task::yield_now().await;
        assert!(q.is_empty());

        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(q.next().await, Some(key("foo")));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_gives_up_after_max_retries() {
        let q = queue();
        for _ in 0..3 {
            assert!(q.add_rate_limited(key("foo")));
            time::sleep(Duration::from_secs(1)).await;
            assert_eq!(q.next().await, Some(key("foo")));
            q.done(&key("foo"));
        }
        assert!(!q.add_rate_limited(key("foo")));

        // The budget resets once spent, so a natural re-enqueue starts over.
        assert!(q.add_rate_limited(key("foo")));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_resets_backoff() {
        let q = queue();
        for _ in 0..3 {
            assert!(q.add_rate_limited(key("foo")));
            time::sleep(Duration::from_secs(1)).await;
            assert_eq!(q.next().await, Some(key("foo")));
            q.done(&key("foo"));
        }
        q.forget(&key("foo"));
        for _ in 0..3 {
            assert!(q.add_rate_limited(key("foo")));
            time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiters() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.next().await }
        });
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(q.next().await, None);
    }
}
