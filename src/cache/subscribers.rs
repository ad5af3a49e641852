//! Per-key observer registry.
//!
//! Callbacks carry no payload; a notified consumer re-reads the cache. The
//! registry lock is never held while a callback runs, so callbacks may
//! subscribe, unsubscribe or read the cache freely.
//!
//! Once [`Subscription`] is dropped, no notification that starts afterwards
//! invokes its callback, on any thread. A notification already running on
//! another thread may still deliver one call that was in progress when the
//! drop happened; consumers that share state across threads must tolerate it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use super::lock::mutex_lock;
use crate::query::EntityId;

const SOURCE: &str = "cache::subscribers";

pub type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    by_key: Mutex<HashMap<EntityId, Vec<Subscriber>>>,
}

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

/// Handle returned by `subscribe`. Dropping it unsubscribes; see the module
/// docs for the ordering guarantee.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    key: EntityId,
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    pub fn key(&self) -> &EntityId {
        &self.key
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
    }
}

impl SubscriberRegistry {
    pub(crate) fn subscribe(&self, key: EntityId, callback: Callback) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        mutex_lock(&self.inner.by_key, SOURCE, "subscribe")
            .entry(key.clone())
            .or_default()
            .push(Subscriber {
                id,
                active: Arc::clone(&active),
                callback,
            });
        Subscription {
            key,
            id,
            active,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every live callback registered for `key`.
    pub(crate) fn notify(&self, key: &EntityId) -> usize {
        let snapshot: Vec<(Arc<AtomicBool>, Callback)> =
            match mutex_lock(&self.inner.by_key, SOURCE, "notify").get(key) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|s| (Arc::clone(&s.active), Arc::clone(&s.callback)))
                    .collect(),
                None => return 0,
            };

        let mut notified = 0;
        for (active, callback) in snapshot {
            if active.load(Ordering::Acquire) {
                callback();
                notified += 1;
            }
        }
        trace!(key = %key, notified, "Subscribers notified");
        notified
    }

    #[cfg(test)]
    pub(crate) fn count(&self, key: &EntityId) -> usize {
        mutex_lock(&self.inner.by_key, SOURCE, "count")
            .get(key)
            .map_or(0, Vec::len)
    }

    pub(crate) fn total(&self) -> usize {
        mutex_lock(&self.inner.by_key, SOURCE, "total")
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl RegistryInner {
    fn remove(&self, key: &EntityId, id: u64) {
        let mut by_key = mutex_lock(&self.by_key, SOURCE, "unsubscribe");
        if let Some(subscribers) = by_key.get_mut(key) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                by_key.remove(key);
            }
        }
    }
}
