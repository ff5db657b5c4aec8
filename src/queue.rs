//! Deduplicating work queue of resource keys
//!
//! A key is held by at most one worker at a time. Enqueueing a key that is
//! being processed marks it dirty; it goes back on the queue when the worker
//! calls [`WorkQueue::done`]. Delayed enqueues keep only the earliest
//! pending deadline per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::metrics;
use crate::resource::ResourceKey;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ResourceKey>,
    queued: HashSet<ResourceKey>,
    in_flight: HashSet<ResourceKey>,
    dirty: HashSet<ResourceKey>,
    failures: HashMap<ResourceKey, u32>,
    scheduled: HashMap<ResourceKey, Instant>,
    shutting_down: bool,
}

impl QueueState {
    fn push(&mut self, key: ResourceKey) -> bool {
        self.scheduled.remove(&key);
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
            metrics::set_queue_depth(self.ready.len());
            return true;
        }
        false
    }
}

/// FIFO of resource keys with per-key mutual exclusion
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// An empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` now. Duplicates collapse into one entry.
    pub fn enqueue(&self, key: ResourceKey) {
        let pushed = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.push(key)
        };
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`, unless an earlier enqueue is already
    /// scheduled
    pub fn enqueue_after(self: &Arc<Self>, key: ResourceKey, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }

        let at = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            match state.scheduled.get(&key) {
                Some(existing) if *existing <= at => return,
                _ => {
                    state.scheduled.insert(key.clone(), at);
                }
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            queue.fire(key, at);
        });
    }

    fn fire(&self, key: ResourceKey, at: Instant) {
        let pushed = {
            let mut state = self.state.lock();
            if state.shutting_down || state.scheduled.get(&key) != Some(&at) {
                return;
            }
            state.push(key)
        };
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Wait for the next key and mark it in flight.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    metrics::set_queue_depth(state.ready.len());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key`. A key enqueued while in flight is queued again.
    pub fn done(&self, key: &ResourceKey) {
        let pushed = {
            let mut state = self.state.lock();
            state.in_flight.remove(key);
            if state.dirty.remove(key) && !state.shutting_down {
                state.push(key.clone())
            } else {
                false
            }
        };
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Count a failed pass and return the consecutive failure count
    pub fn record_failure(&self, key: &ResourceKey) -> u32 {
        let mut state = self.state.lock();
        let count = state.failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Reset the failure count after a successful pass
    pub fn forget(&self, key: &ResourceKey) {
        self.state.lock().failures.remove(key);
    }

    /// Consecutive failures of `key`
    pub fn failures(&self, key: &ResourceKey) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a worker currently holds `key`
    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.state.lock().in_flight.contains(key)
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("Topic", name)
    }

    #[tokio::test]
    async fn test_fifo_with_deduplication() {
        let queue = WorkQueue::new();
        queue.enqueue(key("a"));
        queue.enqueue(key("b"));
        queue.enqueue(key("a"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, Some(key("b")));
        assert!(queue.is_empty());
    }

    /// Story: a change that arrives while a worker holds the key is not lost
    /// and is not handed to a second worker
    #[tokio::test]
    async fn story_in_flight_key_is_exclusive() {
        let queue = WorkQueue::new();
        queue.enqueue(key("a"));
        let held = queue.next().await.expect("key");
        assert!(queue.is_in_flight(&held));

        queue.enqueue(key("a"));
        assert!(queue.is_empty(), "in-flight key must not be queued twice");

        queue.done(&held);
        assert!(!queue.is_in_flight(&held));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_done_without_dirty_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.enqueue(key("a"));
        let held = queue.next().await.expect("key");
        queue.done(&held);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_enqueue_fires_after_delay() {
        let queue = Arc::new(WorkQueue::new());
        queue.enqueue_after(key("a"), Duration::from_secs(30));
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_delay_wins() {
        let queue = Arc::new(WorkQueue::new());
        queue.enqueue_after(key("a"), Duration::from_secs(60));
        queue.enqueue_after(key("a"), Duration::from_secs(1));
        queue.enqueue_after(key("a"), Duration::from_secs(120));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.next().await, Some(key("a")));
        queue.done(&key("a"));

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(queue.is_empty(), "superseded timers must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_enqueue_cancels_pending_delay() {
        let queue = Arc::new(WorkQueue::new());
        queue.enqueue_after(key("a"), Duration::from_secs(10));
        queue.enqueue(key("a"));
        assert_eq!(queue.next().await, Some(key("a")));
        queue.done(&key("a"));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failure_counts() {
        let queue = WorkQueue::new();
        assert_eq!(queue.record_failure(&key("a")), 1);
        assert_eq!(queue.record_failure(&key("a")), 2);
        assert_eq!(queue.failures(&key("b")), 0);
        queue.forget(&key("a"));
        assert_eq!(queue.failures(&key("a")), 0);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiting_workers() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown();
        assert_eq!(waiter.await.expect("join"), None);

        queue.enqueue(key("a"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_worker_is_woken_by_enqueue() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.enqueue(key("a"));
        assert_eq!(waiter.await.expect("join"), Some(key("a")));
    }
}
