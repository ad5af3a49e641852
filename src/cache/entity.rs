//! TTL entity cache.
//!
//! Values are keyed by [`EntityId`] and expire a fixed time after they were
//! stored. Misses are resolved through a [`Coalescer`], so lookups for many
//! different ids issued together cost one relay query. Only one fetch per id
//! runs at a time; concurrent misses for the same id wait on it.
//!
//! Every fetch holds a ticket in the in-flight map. `invalidate` and `clear`
//! revoke outstanding tickets, and a fetch whose ticket was revoked returns
//! its value to its own caller without caching it, so the next lookup goes
//! back to the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use metrics::counter;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use super::lock::{rw_read, rw_write};
use super::subscribers::{Callback, SubscriberRegistry, Subscription};
use crate::batch::{BatchLoader, Coalescer, CoalescerStats};
use crate::query::EntityId;

const SOURCE: &str = "cache::entity";
const METRIC_ENTITY_HIT_TOTAL: &str = "relaycache_entity_hit_total";
const METRIC_ENTITY_MISS_TOTAL: &str = "relaycache_entity_miss_total";

/// Default time-to-live of an entity entry.
pub const DEFAULT_ENTITY_TTL: Duration = Duration::from_secs(120);

/// Type-erased handle used to maintain caches of differing value types together.
pub(crate) trait ManagedCache: Send + Sync {
    fn clear_all(&self);
    fn purge_expired(&self) -> usize;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityCacheStats {
    /// Stored entries, including expired ones not yet purged.
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Ids with a fetch currently running.
    pub in_flight: usize,
    pub subscribers: usize,
    pub coalescer: CoalescerStats,
}

pub struct EntityCache<L: BatchLoader> {
    inner: Arc<EntityInner<L>>,
}

impl<L: BatchLoader> Clone for EntityCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EntityInner<L: BatchLoader> {
    coalescer: Coalescer<L>,
    ttl: Duration,
    entries: RwLock<HashMap<EntityId, CachedValue<L::Value>>>,
    in_flight: InFlightMap<L::Value>,
    next_ticket: AtomicU64,
    subscribers: SubscriberRegistry,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CachedValue<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CachedValue<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

type InFlightMap<V> = Arc<DashMap<EntityId, InFlight<V>>>;

struct InFlight<V> {
    ticket: u64,
    waiters: Vec<oneshot::Sender<V>>,
}

/// Marks an id as being fetched under `ticket`. Dropping an unfinished guard
/// releases any waiters with a closed channel.
struct FetchGuard<V> {
    key: EntityId,
    ticket: u64,
    in_flight: InFlightMap<V>,
    armed: bool,
}

impl<V> FetchGuard<V> {
    /// Run `commit` and hand back the waiters if this fetch still owns the
    /// in-flight slot. `commit` runs under the slot's shard lock, so a
    /// concurrent revocation either happens before it (nothing is committed)
    /// or after it (and removes what was committed).
    fn complete(mut self, commit: impl FnOnce()) -> Option<Vec<oneshot::Sender<V>>> {
        self.armed = false;
        match self.in_flight.entry(self.key.clone()) {
            Entry::Occupied(slot) if slot.get().ticket == self.ticket => {
                commit();
                Some(slot.remove().waiters)
            }
            _ => None,
        }
    }
}

impl<V> Drop for FetchGuard<V> {
    fn drop(&mut self) {
        if self.armed {
            let ticket = self.ticket;
            self.in_flight
                .remove_if(&self.key, |_, slot| slot.ticket == ticket);
        }
    }
}

enum FetchRole<V> {
    Leader(FetchGuard<V>),
    Follower(oneshot::Receiver<V>),
}

impl<L: BatchLoader> EntityCache<L> {
    pub fn new(coalescer: Coalescer<L>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                coalescer,
                ttl,
                entries: RwLock::new(HashMap::new()),
                in_flight: Arc::new(DashMap::new()),
                next_ticket: AtomicU64::new(0),
                subscribers: SubscriberRegistry::default(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn coalescer(&self) -> &Coalescer<L> {
        &self.inner.coalescer
    }

    /// Return the live value for `key` without waiting.
    ///
    /// A miss returns `None` and starts a background fetch; subscribers of
    /// `key` are notified once it lands.
    pub fn get(&self, key: &EntityId) -> Option<L::Value> {
        if let Some(value) = self.inner.lookup(key) {
            return Some(value);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                if !self.inner.in_flight.contains_key(key) {
                    let inner = Arc::clone(&self.inner);
                    let key = key.clone();
                    handle.spawn(async move {
                        inner.fetch(key).await;
                    });
                }
            }
            Err(err) => {
                error!(
                    key = %key,
                    error = %err,
                    error_kind = "programming",
                    "Entity cache miss outside a tokio runtime; fetch not started"
                );
            }
        }
        None
    }

    /// Return the value for `key`, fetching it on a miss.
    pub async fn load(&self, key: &EntityId) -> L::Value {
        match self.inner.lookup(key) {
            Some(value) => value,
            None => self.inner.fetch(key.clone()).await,
        }
    }

    /// Store `value` with a fresh expiry and notify subscribers.
    pub fn set(&self, key: EntityId, value: L::Value) {
        self.inner.store(key, value);
    }

    pub fn subscribe<F>(&self, key: EntityId, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        self.inner.subscribers.subscribe(key, callback)
    }

    /// Remove one entry, or every entry when `key` is `None`.
    ///
    /// The next lookup goes to the network, even if a fetch for the key is
    /// already running; that fetch's result is not cached. Subscribers are
    /// not notified.
    pub fn invalidate(&self, key: Option<&EntityId>) {
        match key {
            Some(key) => {
                let revoked = self.inner.in_flight.remove(key).is_some();
                rw_write(&self.inner.entries, SOURCE, "invalidate").remove(key);
                debug!(key = %key, revoked, "Entity invalidated");
            }
            None => {
                let revoked = self.inner.revoke_in_flight();
                let removed = {
                    let mut entries = rw_write(&self.inner.entries, SOURCE, "invalidate");
                    let removed = entries.len();
                    entries.clear();
                    removed
                };
                debug!(removed, revoked, "Entity cache invalidated");
            }
        }
    }

    /// Resolve every id that is not live, concurrently, through the coalescer.
    pub async fn prefetch(&self, keys: &[EntityId]) {
        let missing: Vec<&EntityId> = keys
            .iter()
            .filter(|key| self.inner.peek(key).is_none())
            .collect();
        if missing.is_empty() {
            return;
        }
        debug!(requested = keys.len(), missing = missing.len(), "Prefetching entities");
        join_all(missing.into_iter().map(|key| self.inner.fetch(key.clone()))).await;
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Drop every entry and the coalescer's open window.
    pub fn clear(&self) {
        self.inner.clear_all();
    }

    /// Clear and swap the batch loader.
    pub fn reset(&self, loader: L) {
        self.clear();
        self.inner.coalescer.reset(loader);
    }

    pub fn stats(&self) -> EntityCacheStats {
        // Never hold the entries lock while touching the in-flight map.
        let entries = rw_read(&self.inner.entries, SOURCE, "stats").len();
        EntityCacheStats {
            entries,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.len(),
            subscribers: self.inner.subscribers.total(),
            coalescer: self.inner.coalescer.stats(),
        }
    }

    pub(crate) fn managed(&self) -> Weak<dyn ManagedCache> {
        let inner: Arc<dyn ManagedCache> = self.inner.clone();
        Arc::downgrade(&inner)
    }
}

impl<L: BatchLoader> EntityInner<L> {
    fn peek(&self, key: &EntityId) -> Option<L::Value> {
        let now = Instant::now();
        rw_read(&self.entries, SOURCE, "peek")
            .get(key)
            .filter(|cached| cached.is_live(now))
            .map(|cached| cached.value.clone())
    }

    fn lookup(&self, key: &EntityId) -> Option<L::Value> {
        let value = self.peek(key);
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_ENTITY_HIT_TOTAL).increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_ENTITY_MISS_TOTAL).increment(1);
        }
        value
    }

    fn insert(&self, key: EntityId, value: L::Value) {
        let expires_at = Instant::now() + self.ttl;
        rw_write(&self.entries, SOURCE, "store").insert(key, CachedValue { value, expires_at });
    }

    fn store(&self, key: EntityId, value: L::Value) {
        self.insert(key.clone(), value);
        self.subscribers.notify(&key);
    }

    /// Drop every in-flight slot so running fetches cannot commit.
    fn revoke_in_flight(&self) -> usize {
        let revoked = self.in_flight.len();
        self.in_flight.clear();
        revoked
    }

    async fn fetch(&self, key: EntityId) -> L::Value {
        loop {
            let role = match self.in_flight.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                    vacant.insert(InFlight {
                        ticket,
                        waiters: Vec::new(),
                    });
                    FetchRole::Leader(FetchGuard {
                        key: key.clone(),
                        ticket,
                        in_flight: Arc::clone(&self.in_flight),
                        armed: true,
                    })
                }
                Entry::Occupied(mut occupied) => {
                    let (sender, receiver) = oneshot::channel();
                    occupied.get_mut().waiters.push(sender);
                    FetchRole::Follower(receiver)
                }
            };

            match role {
                FetchRole::Leader(guard) => return self.lead(key, guard).await,
                FetchRole::Follower(receiver) => {
                    if let Ok(value) = receiver.await {
                        return value;
                    }
                    // The leader was cancelled, revoked or lost its window.
                    trace!(key = %key, "Entity fetch leader gone; retrying");
                }
            }
        }
    }

    async fn lead(&self, key: EntityId, guard: FetchGuard<L::Value>) -> L::Value {
        let Some(value) = self.coalescer.try_load(key.clone()).await else {
            debug!(key = %key, "Entity fetch window discarded; nothing cached");
            return L::Value::default();
        };

        let committed = guard.complete(|| self.insert(key.clone(), value.clone()));
        match committed {
            Some(waiters) => {
                self.subscribers.notify(&key);
                for waiter in waiters {
                    let _ = waiter.send(value.clone());
                }
            }
            None => debug!(key = %key, "Entity fetch revoked; result not cached"),
        }
        value
    }
}

impl<L: BatchLoader> ManagedCache for EntityInner<L> {
    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "purge_expired");
        let before = entries.len();
        entries.retain(|_, cached| cached.is_live(now));
        before - entries.len()
    }

    fn clear_all(&self) {
        let revoked = self.revoke_in_flight();
        let removed = {
            let mut entries = rw_write(&self.entries, SOURCE, "clear");
            let removed = entries.len();
            entries.clear();
            removed
        };
        self.coalescer.clear();
        debug!(removed, revoked, "Entity cache cleared");
    }
}
