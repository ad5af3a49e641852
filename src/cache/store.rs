//! Unified capacity-bounded record store.
//!
//! Full records are kept for longer sessions, bounded both by entry count and
//! by age. Frequently changing derived data (engagement counters and the like)
//! lives in a separate map with a shorter maximum age. Recency is tracked by
//! access: every hit moves an entry to the most-recently-used end, so the
//! eviction pass drops the entries with the oldest `last_accessed`.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::lock::{rw_read, rw_write};
use crate::query::{EntityId, Record};

const SOURCE: &str = "cache::store";
const METRIC_STORE_EVICT_TOTAL: &str = "relaycache_store_evict_total";
const METRIC_STORE_EXPIRED_TOTAL: &str = "relaycache_store_expired_total";

const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 60);
const DEFAULT_DERIVED_MAX_AGE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Engagement counters attached to a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub reactions: u64,
    pub replies: u64,
    pub reposts: u64,
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
}

impl<T> CacheEntry<T> {
    fn new(value: T, now: Instant) -> Self {
        Self {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        }
    }

    fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= max_age
    }

    fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_entries: NonZeroUsize,
    pub max_age: Duration,
    pub derived_max_age: Duration,
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: NonZeroUsize::new(DEFAULT_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN),
            max_age: DEFAULT_MAX_AGE,
            derived_max_age: DEFAULT_DERIVED_MAX_AGE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Outcome of one [`UnifiedCache::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub derived_expired: usize,
    pub evicted: usize,
    pub derived_evicted: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired + self.derived_expired + self.evicted + self.derived_evicted
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub derived_entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evicted: u64,
    pub expired: u64,
}

pub struct UnifiedCache<D = Engagement> {
    config: StoreConfig,
    records: RwLock<LruCache<EntityId, CacheEntry<Record>>>,
    derived: RwLock<LruCache<EntityId, CacheEntry<D>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
}

impl<D> Default for UnifiedCache<D>
where
    D: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl<D> UnifiedCache<D>
where
    D: Clone + Send + Sync + 'static,
{
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            records: RwLock::new(LruCache::unbounded()),
            derived: RwLock::new(LruCache::unbounded()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Store records, replacing existing entries with the same id. Entries
    /// beyond capacity are evicted least-recently-accessed first.
    pub fn put<I>(&self, records: I)
    where
        I: IntoIterator<Item = Record>,
    {
        let now = Instant::now();
        let evicted = {
            let mut map = rw_write(&self.records, SOURCE, "put");
            for record in records {
                map.push(record.id.clone(), CacheEntry::new(record, now));
            }
            evict_over_capacity(&mut map, self.config.max_entries.get())
        };
        self.record_evicted(evicted);
    }

    pub fn get(&self, id: &EntityId) -> Option<Record> {
        self.lookup(&self.records, id, self.config.max_age, "get")
    }

    pub fn put_derived(&self, id: EntityId, data: D) {
        let evicted = {
            let mut map = rw_write(&self.derived, SOURCE, "put_derived");
            map.push(id, CacheEntry::new(data, Instant::now()));
            evict_over_capacity(&mut map, self.config.max_entries.get())
        };
        self.record_evicted(evicted);
    }

    pub fn get_derived(&self, id: &EntityId) -> Option<D> {
        self.lookup(&self.derived, id, self.config.derived_max_age, "get_derived")
    }

    /// Access metadata for a primary entry, without counting as an access.
    pub fn entry_meta(&self, id: &EntityId) -> Option<(Instant, u64)> {
        rw_read(&self.records, SOURCE, "entry_meta")
            .peek(id)
            .map(|entry| (entry.last_accessed, entry.access_count))
    }

    /// Drop the record and its derived data.
    pub fn invalidate(&self, id: &EntityId) {
        let primary = rw_write(&self.records, SOURCE, "invalidate").pop(id).is_some();
        let derived = rw_write(&self.derived, SOURCE, "invalidate.derived")
            .pop(id)
            .is_some();
        debug!(id = %id, primary, derived, "Store entry invalidated");
    }

    pub fn invalidate_derived(&self, id: &EntityId) {
        rw_write(&self.derived, SOURCE, "invalidate_derived").pop(id);
    }

    /// Remove aged-out entries, then evict least-recently-accessed entries
    /// until both maps are within capacity.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let max_entries = self.config.max_entries.get();

        let (expired, evicted) = {
            let mut map = rw_write(&self.records, SOURCE, "sweep");
            let expired = remove_expired(&mut map, now, self.config.max_age);
            (expired, evict_over_capacity(&mut map, max_entries))
        };
        let (derived_expired, derived_evicted) = {
            let mut map = rw_write(&self.derived, SOURCE, "sweep.derived");
            let expired = remove_expired(&mut map, now, self.config.derived_max_age);
            (expired, evict_over_capacity(&mut map, max_entries))
        };

        let report = SweepReport {
            expired,
            derived_expired,
            evicted,
            derived_evicted,
        };
        self.record_expired(expired + derived_expired);
        self.record_evicted(evicted + derived_evicted);
        if report.removed() > 0 {
            info!(
                expired = report.expired,
                derived_expired = report.derived_expired,
                evicted = report.evicted,
                derived_evicted = report.derived_evicted,
                "Store sweep finished"
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the cache is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    debug!("Store dropped; sweeper exiting");
                    break;
                };
                cache.sweep();
            }
        })
    }

    pub fn len(&self) -> usize {
        rw_read(&self.records, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.records, SOURCE, "clear").clear();
        rw_write(&self.derived, SOURCE, "clear.derived").clear();
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.len(),
            derived_entries: rw_read(&self.derived, SOURCE, "stats.derived").len(),
            max_entries: self.config.max_entries.get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    fn lookup<T: Clone>(
        &self,
        lock: &RwLock<LruCache<EntityId, CacheEntry<T>>>,
        id: &EntityId,
        max_age: Duration,
        op: &'static str,
    ) -> Option<T> {
        let now = Instant::now();
        let mut map = rw_write(lock, SOURCE, op);
        let expired = map
            .peek(id)
            .is_some_and(|entry| entry.is_expired(now, max_age));
        if expired {
            map.pop(id);
            drop(map);
            self.record_expired(1);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match map.get_mut(id) {
            Some(entry) => {
                entry.touch(now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn record_evicted(&self, count: usize) {
        if count > 0 {
            self.evicted.fetch_add(count as u64, Ordering::Relaxed);
            counter!(METRIC_STORE_EVICT_TOTAL).increment(count as u64);
            debug!(evicted = count, "Store entries evicted");
        }
    }

    fn record_expired(&self, count: usize) {
        if count > 0 {
            self.expired.fetch_add(count as u64, Ordering::Relaxed);
            counter!(METRIC_STORE_EXPIRED_TOTAL).increment(count as u64);
        }
    }
}

fn remove_expired<T>(
    map: &mut LruCache<EntityId, CacheEntry<T>>,
    now: Instant,
    max_age: Duration,
) -> usize {
    let stale: Vec<EntityId> = map
        .iter()
        .filter(|(_, entry)| entry.is_expired(now, max_age))
        .map(|(id, _)| id.clone())
        .collect();
    for id in &stale {
        map.pop(id);
    }
    stale.len()
}

fn evict_over_capacity<T>(map: &mut LruCache<EntityId, CacheEntry<T>>, max_entries: usize) -> usize {
    let mut evicted = 0;
    while map.len() > max_entries && map.pop_lru().is_some() {
        evicted += 1;
    }
    evicted
}
