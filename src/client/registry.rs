//! Per-path subscriber lists with deferred teardown.
//!
//! When the last subscriber of a path leaves, a grace timer starts. A new
//! subscriber before it fires cancels it; otherwise the idle callback runs
//! and the caller closes the path's connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::client::payload::Payload;

/// Default delay between the last unsubscribe and teardown.
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(10);

pub type Listener = Arc<dyn Fn(&Payload) + Send + Sync>;
pub type IdleCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    listeners: Vec<(u64, Listener)>,
    generation: u64,
    teardown: Option<JoinHandle<()>>,
}

/// Listener lists keyed by path.
pub struct SubscriberRegistry {
    entries: DashMap<String, Subscribers>,
    next_id: AtomicU64,
    grace: Duration,
    on_idle: IdleCallback,
}

impl SubscriberRegistry {
    pub fn new(grace: Duration, on_idle: IdleCallback) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(0),
            grace,
            on_idle,
        })
    }

    /// Add a listener for `path` and cancel any pending teardown.
    pub fn subscribe(self: &Arc<Self>, path: &str, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.entries.entry(path.to_string()).or_default();
        entry.listeners.push((id, listener));
        entry.generation += 1;
        if let Some(teardown) = entry.teardown.take() {
            teardown.abort();
            tracing::debug!(path = %path, "Teardown cancelled");
        }
        drop(entry);

        Subscription {
            registry: Arc::downgrade(self),
            path: path.to_string(),
            id,
            released: false,
        }
    }

    fn unsubscribe(self: &Arc<Self>, path: &str, id: u64) {
        let Some(mut entry) = self.entries.get_mut(path) else {
            return;
        };
        entry.listeners.retain(|(listener_id, _)| *listener_id != id);
        if !entry.listeners.is_empty() {
            return;
        }

        entry.generation += 1;
        let generation = entry.generation;
        if let Some(previous) = entry.teardown.take() {
            previous.abort();
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = Arc::downgrade(self);
                let path = path.to_string();
                let grace = self.grace;
                entry.teardown = Some(handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.expire(&path, generation);
                    }
                }));
                tracing::debug!(path = %entry.key(), grace_ms = grace.as_millis() as u64, "Teardown scheduled");
            }
            Err(_) => {
                // No runtime to wait on: tear down now.
                drop(entry);
                self.expire(path, generation);
            }
        }
    }

    fn expire(&self, path: &str, generation: u64) {
        let removed = self
            .entries
            .remove_if(path, |_, subs| {
                subs.generation == generation && subs.listeners.is_empty()
            })
            .is_some();
        if removed {
            tracing::debug!(path = %path, "Grace window elapsed, tearing down");
            (self.on_idle)(path);
        }
    }

    /// Call every listener of `path` with `payload`.
    pub fn notify(&self, path: &str, payload: &Payload) {
        let listeners: Vec<Listener> = match self.entries.get(path) {
            Some(entry) => entry.listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(payload);
        }
    }

    pub fn listener_count(&self, path: &str) -> usize {
        self.entries
            .get(path)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    pub fn teardown_pending(&self, path: &str) -> bool {
        self.entries
            .get(path)
            .map(|entry| entry.teardown.is_some())
            .unwrap_or(false)
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    registry: Weak<SubscriberRegistry>,
    path: String,
    id: u64,
    released: bool,
}

impl Subscription {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.path, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn registry(grace: Duration) -> (Arc<SubscriberRegistry>, Arc<Mutex<Vec<String>>>) {
        let idle = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&idle);
        let registry = SubscriberRegistry::new(
            grace,
            Arc::new(move |path: &str| seen.lock().unwrap().push(path.to_string())),
        );
        (registry, idle)
    }

    fn noop() -> Listener {
        Arc::new(|_: &Payload| {})
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_notifies_every_listener() {
        let (registry, _idle) = registry(DEFAULT_TEARDOWN_GRACE);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for label in ["a", "b"] {
            let seen = Arc::clone(&seen);
            subs.push(registry.subscribe(
                "/rooms/1",
                Arc::new(move |payload: &Payload| {
                    seen.lock().unwrap().push((label, payload.clone()));
                }),
            ));
        }

        registry.notify("/rooms/1", &Payload::Data(json!(1)));
        registry.notify("/rooms/2", &Payload::Data(json!(2)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, p)| *p == Payload::Data(json!(1))));
        assert_eq!(registry.listener_count("/rooms/1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_after_grace_window() {
        let (registry, idle) = registry(Duration::from_secs(10));
        let sub = registry.subscribe("/rooms/1", noop());
        sub.unsubscribe();
        assert!(registry.teardown_pending("/rooms/1"));

        tokio::time::advance(Duration::from_secs(9)).await;
        settle().await;
        assert!(idle.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(*idle.lock().unwrap(), vec!["/rooms/1".to_string()]);
        assert_eq!(registry.listener_count("/rooms/1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_cancels_teardown() {
        let (registry, idle) = registry(Duration::from_secs(10));
        drop(registry.subscribe("/rooms/1", noop()));

        tokio::time::advance(Duration::from_secs(5)).await;
        let again = registry.subscribe("/rooms/1", noop());
        assert!(!registry.teardown_pending("/rooms/1"));

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(idle.lock().unwrap().is_empty());
        assert_eq!(registry.listener_count("/rooms/1"), 1);
        drop(again);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_listener_keeps_path_alive() {
        let (registry, idle) = registry(Duration::from_secs(10));
        let first = registry.subscribe("/rooms/1", noop());
        let _second = registry.subscribe("/rooms/1", noop());
        first.unsubscribe();

        assert!(!registry.teardown_pending("/rooms/1"));
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(idle.lock().unwrap().is_empty());
    }

    #[test]
    fn test_outside_runtime_tears_down_immediately() {
        let (registry, idle) = registry(Duration::from_secs(10));
        drop(registry.subscribe("/rooms/1", noop()));
        assert_eq!(*idle.lock().unwrap(), vec!["/rooms/1".to_string()]);
    }
}
