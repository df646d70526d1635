//! Global concurrent-connection accounting.
//!
//! Every dial attempt and accepted stream claims an entry keyed by
//! (protocol, local, remote) against a process-wide budget. The entry is
//! an RAII guard: dropping it — including by closing the stream that owns
//! it — releases the slot and wakes a waiter. A tracker can be shared
//! between multiple clients via configuration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Identifies one tracked connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackerKey {
    pub protocol: String,
    pub local: String,
    pub remote: String,
}

pub struct ConnTracker {
    max: usize,
    inner: Mutex<Inner>,
    released: Notify,
}

struct Inner {
    total: usize,
    entries: HashMap<TrackerKey, usize>,
}

impl ConnTracker {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            inner: Mutex::new(Inner {
                total: 0,
                entries: HashMap::new(),
            }),
            released: Notify::new(),
        })
    }

    /// Waits for budget and claims an entry.
    pub async fn acquire(self: &Arc<Self>, key: TrackerKey) -> TrackerEntry {
        loop {
            let notified = self.released.notified();
            {
                let mut inner = self.inner.lock();
                if inner.total < self.max {
                    inner.total += 1;
                    *inner.entries.entry(key.clone()).or_insert(0) += 1;
                    return TrackerEntry {
                        tracker: Arc::clone(self),
                        key,
                    };
                }
            }
            notified.await;
        }
    }

    /// Claims an entry only if budget is immediately available.
    pub fn try_acquire(self: &Arc<Self>, key: TrackerKey) -> Option<TrackerEntry> {
        let mut inner = self.inner.lock();
        if inner.total >= self.max {
            return None;
        }
        inner.total += 1;
        *inner.entries.entry(key.clone()).or_insert(0) += 1;
        Some(TrackerEntry {
            tracker: Arc::clone(self),
            key,
        })
    }

    pub fn active(&self) -> usize {
        self.inner.lock().total
    }

    fn release(&self, key: &TrackerKey) {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.entries.remove(key);
            }
            None => panic!("releasing untracked connection entry: {key:?}"),
        }
        inner.total -= 1;
        drop(inner);
        self.released.notify_one();
    }
}

/// RAII handle for one tracked connection. Released exactly once, on
/// drop.
pub struct TrackerEntry {
    tracker: Arc<ConnTracker>,
    key: TrackerKey,
}

impl Drop for TrackerEntry {
    fn drop(&mut self) {
        self.tracker.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(remote: &str) -> TrackerKey {
        TrackerKey {
            protocol: "tcp4".into(),
            local: "0.0.0.0:0".into(),
            remote: remote.into(),
        }
    }

    #[tokio::test]
    async fn budget_is_enforced_and_released() {
        let tracker = ConnTracker::new(2);
        let a = tracker.acquire(key("10.0.0.1:1")).await;
        let _b = tracker.acquire(key("10.0.0.2:1")).await;
        assert_eq!(tracker.active(), 2);
        assert!(tracker.try_acquire(key("10.0.0.3:1")).is_none());

        drop(a);
        assert_eq!(tracker.active(), 1);
        assert!(tracker.try_acquire(key("10.0.0.3:1")).is_some());
    }

    #[tokio::test]
    async fn acquire_wakes_after_release() {
        let tracker = ConnTracker::new(1);
        let first = tracker.acquire(key("10.0.0.1:1")).await;

        let tracker2 = Arc::clone(&tracker);
        let waiter = tokio::spawn(async move { tracker2.acquire(key("10.0.0.2:1")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(first);
        let entry = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracker.active(), 1);
        drop(entry);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn duplicate_keys_are_counted() {
        let tracker = ConnTracker::new(4);
        let a = tracker.acquire(key("10.0.0.1:1")).await;
        let b = tracker.acquire(key("10.0.0.1:1")).await;
        assert_eq!(tracker.active(), 2);
        drop(a);
        drop(b);
        assert_eq!(tracker.active(), 0);
    }
}
