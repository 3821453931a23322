//! Keyed work queue with the guarantees the controllers lean on: a key is
//! never handed to two workers at once, adds of an in-flight key are
//! remembered and replayed after `done`, and duplicate adds coalesce.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;

pub struct Workqueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    closed: AtomicBool,
}

struct State<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    active: FxHashSet<K>,
    dirty: FxHashSet<K>,
}

impl<K> Default for Workqueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Workqueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                queued: FxHashSet::default(),
                active: FxHashSet::default(),
                dirty: FxHashSet::default(),
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn add(&self, key: K) {
        let mut state = self.state.lock().unwrap();
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

    /// Re-adds `key` after `delay`.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Takes the next key, waiting if none is available. Returns `None`
    /// once the queue is closed and drained.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a concurrent add or close
            // cannot slip between the check and the await.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.order.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    let more = !state.order.is_empty();
                    drop(state);
                    if more {
                        // Permits coalesce; pass one along for the next waiter.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Marks processing of `key` complete, re-queueing it if it was dirtied
    /// while active.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.order.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coalesces_duplicate_adds() {
        let q = Workqueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, Some("b"));
    }

    #[tokio::test]
    async fn single_flight_per_key() {
        let q = Workqueue::new();
        q.add("a");
        let key = q.next().await.unwrap();

        // The key is active: re-adds must not hand it out again yet.
        q.add("a");
        assert_eq!(q.len(), 0);

        q.done(&key);
        assert_eq!(q.next().await, Some("a"), "dirty key replays after done");
        q.done(&"a");
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn done_without_dirty_does_not_requeue() {
        let q = Workqueue::new();
        q.add("a");
        let key = q.next().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_after_delays() {
        let q = Arc::new(Workqueue::new());
        q.add_after("a", Duration::from_millis(10));
        assert!(q.is_empty());
        let key = q.next().await;
        assert_eq!(key, Some("a"));
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let q = Arc::new(Workqueue::<&'static str>::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        q.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn parallel_workers_never_share_a_key() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let q = Arc::new(Workqueue::new());
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            let max_concurrent = Arc::clone(&max_concurrent);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                while let Some(key) = q.next().await {
                    let n = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(n, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    q.done(&key);
                }
            }));
        }

        // One hot key, added repeatedly: concurrency must stay at 1.
        for _ in 0..50 {
            q.add("hot");
            tokio::time::sleep(Duration::from_micros(200)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
