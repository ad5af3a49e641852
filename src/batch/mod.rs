//! Batching coalescer.
//!
//! Concurrent per-key lookups issued within one batch window are merged into a
//! single [`BatchLoader::load_batch`] call. A batch is flushed when its window
//! elapses or when it reaches the maximum batch size, whichever comes first.
//!
//! Failures are fail-open: if the loader errors or times out, every caller in
//! that batch receives the value type's default instead of an error. Keys the
//! loader has no data for resolve to the default as well, so no caller is ever
//! left pending.

mod loader;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::{counter, histogram};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::lock::{mutex_lock, rw_read, rw_write};
use crate::error::QueryError;
use crate::query::EntityId;

pub use loader::{ById, KeyField, RecordGrouping, ReferenceCount, ReferencedRecords, RelayBatchLoader};

const SOURCE: &str = "batch";
const DEFAULT_WINDOW_MS: u64 = 50;
const DEFAULT_MAX_BATCH_SIZE: usize = 100;
const METRIC_BATCH_FLUSH_TOTAL: &str = "relaycache_batch_flush_total";
const METRIC_BATCH_KEYS: &str = "relaycache_batch_keys";
const METRIC_BATCH_FAILURE_TOTAL: &str = "relaycache_batch_failure_total";

/// Resolves many keys with one round trip.
///
/// Implementations must return exactly one value per key, in input order.
#[async_trait]
pub trait BatchLoader: Send + Sync + 'static {
    type Value: Clone + Default + Send + Sync + 'static;

    async fn load_batch(&self, keys: &[EntityId]) -> Result<Vec<Self::Value>, QueryError>;
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How long keys are buffered before a flush.
    pub window: Duration,
    /// A batch reaching this many distinct keys is flushed immediately.
    pub max_batch_size: NonZeroUsize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_WINDOW_MS),
            max_batch_size: NonZeroUsize::new(DEFAULT_MAX_BATCH_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Batches handed to the loader.
    pub flushes: u64,
    /// Batches whose loader call failed and were resolved with defaults.
    pub failed_batches: u64,
    /// Distinct keys sent to the loader across all batches.
    pub keys_loaded: u64,
    /// Keys buffered in the currently open window.
    pub pending_keys: usize,
}

pub struct Coalescer<L: BatchLoader> {
    inner: Arc<CoalescerInner<L>>,
}

impl<L: BatchLoader> Clone for Coalescer<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CoalescerInner<L: BatchLoader> {
    config: BatchConfig,
    loader: RwLock<Arc<L>>,
    pending: Mutex<Option<PendingBatch<L::Value>>>,
    flushes: AtomicU64,
    failed_batches: AtomicU64,
    keys_loaded: AtomicU64,
}

struct PendingBatch<V> {
    id: Uuid,
    keys: Vec<EntityId>,
    waiters: HashMap<EntityId, Vec<oneshot::Sender<V>>>,
}

impl<V> PendingBatch<V> {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            keys: Vec::new(),
            waiters: HashMap::new(),
        }
    }

    fn push(&mut self, key: EntityId, waiter: oneshot::Sender<V>) {
        let waiters = self.waiters.entry(key.clone()).or_default();
        if waiters.is_empty() {
            self.keys.push(key);
        }
        waiters.push(waiter);
    }
}

impl<L: BatchLoader> Coalescer<L> {
    pub fn new(loader: L, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                config,
                loader: RwLock::new(Arc::new(loader)),
                pending: Mutex::new(None),
                flushes: AtomicU64::new(0),
                failed_batches: AtomicU64::new(0),
                keys_loaded: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Resolve `key` through the next batch. Never fails; see module docs.
    pub async fn load(&self, key: EntityId) -> L::Value {
        self.try_load(key).await.unwrap_or_default()
    }

    /// Like [`load`](Self::load), but `None` when the window holding `key` was
    /// dropped by [`clear`](Self::clear) or [`reset`](Self::reset) before it
    /// flushed. A loader failure still resolves to `Some(default)`.
    pub(crate) async fn try_load(&self, key: EntityId) -> Option<L::Value> {
        self.register(key).await.ok()
    }

    /// Resolve several keys, all registered in the same window.
    pub async fn load_many(&self, keys: &[EntityId]) -> Vec<L::Value> {
        let receivers: Vec<_> = keys.iter().cloned().map(|key| self.register(key)).collect();
        join_all(receivers)
            .await
            .into_iter()
            .map(Result::unwrap_or_default)
            .collect()
    }

    fn register(&self, key: EntityId) -> oneshot::Receiver<L::Value> {
        let (sender, receiver) = oneshot::channel();
        let full = {
            let mut pending = mutex_lock(&self.inner.pending, SOURCE, "register");
            let batch = pending.get_or_insert_with(|| {
                let batch = PendingBatch::new();
                self.schedule_window_flush(batch.id);
                batch
            });
            batch.push(key, sender);
            if batch.keys.len() >= self.inner.config.max_batch_size.get() {
                pending.take()
            } else {
                None
            }
        };

        if let Some(batch) = full {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.flush(batch).await });
        }
        receiver
    }

    fn schedule_window_flush(&self, batch_id: Uuid) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.window).await;
            let batch = {
                let mut pending = mutex_lock(&inner.pending, SOURCE, "window_elapsed");
                match pending.as_ref() {
                    Some(batch) if batch.id == batch_id => pending.take(),
                    _ => None,
                }
            };
            if let Some(batch) = batch {
                inner.flush(batch).await;
            }
        });
    }

    /// Drop the open window. Its callers resolve with the default value.
    pub fn clear(&self) {
        let dropped = mutex_lock(&self.inner.pending, SOURCE, "clear").take();
        if let Some(batch) = dropped {
            debug!(batch_id = %batch.id, keys = batch.keys.len(), "Pending batch discarded");
        }
    }

    /// Swap the loader and drop the open window.
    pub fn reset(&self, loader: L) {
        self.clear();
        *rw_write(&self.inner.loader, SOURCE, "reset") = Arc::new(loader);
    }

    pub fn stats(&self) -> CoalescerStats {
        let pending_keys = mutex_lock(&self.inner.pending, SOURCE, "stats")
            .as_ref()
            .map_or(0, |batch| batch.keys.len());
        CoalescerStats {
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            failed_batches: self.inner.failed_batches.load(Ordering::Relaxed),
            keys_loaded: self.inner.keys_loaded.load(Ordering::Relaxed),
            pending_keys,
        }
    }
}

impl<L: BatchLoader> CoalescerInner<L> {
    async fn flush(&self, batch: PendingBatch<L::Value>) {
        let PendingBatch {
            id,
            keys,
            mut waiters,
        } = batch;
        let loader = Arc::clone(&rw_read(&self.loader, SOURCE, "flush"));

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.keys_loaded
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        counter!(METRIC_BATCH_FLUSH_TOTAL).increment(1);
        histogram!(METRIC_BATCH_KEYS).record(keys.len() as f64);
        debug!(batch_id = %id, keys = keys.len(), "Flushing batch");

        let values = match loader.load_batch(&keys).await {
            Ok(values) if values.len() == keys.len() => values,
            Ok(values) => {
                self.record_failure(
                    id,
                    &QueryError::ResponseShape {
                        expected: keys.len(),
                        actual: values.len(),
                    },
                );
                vec![L::Value::default(); keys.len()]
            }
            Err(err) => {
                self.record_failure(id, &err);
                vec![L::Value::default(); keys.len()]
            }
        };

        for (key, value) in keys.into_iter().zip(values) {
            for waiter in waiters.remove(&key).unwrap_or_default() {
                let _ = waiter.send(value.clone());
            }
        }
    }

    fn record_failure(&self, batch_id: Uuid, err: &QueryError) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_BATCH_FAILURE_TOTAL).increment(1);
        if err.is_programming_error() {
            error!(
                batch_id = %batch_id,
                error = %err,
                error_kind = "programming",
                "Batch load failed; resolving with defaults"
            );
        } else {
            warn!(
                batch_id = %batch_id,
                error = %err,
                error_kind = "network",
                "Batch load failed; resolving with defaults"
            );
        }
    }
}
