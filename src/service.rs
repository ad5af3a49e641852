//! The relay cache service object.
//!
//! [`RelayCache`] is constructed once per process and shared as
//! `Arc<RelayCache>`. It owns the query queue, the default by-id record
//! cache, the timeline cache and the unified store, and hands out additional
//! entity caches for other lookups (reaction counts, threads, profiles).

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::batch::{
    BatchConfig, ById, Coalescer, KeyField, RecordGrouping, RelayBatchLoader,
};
use crate::cache::lock::mutex_lock;
use crate::cache::{
    DEFAULT_ENTITY_TTL, DEFAULT_MAX_TIMELINES, EntityCache, EntityCacheStats, ManagedCache,
    StoreConfig, StoreStats, TimelineCache, TimelineStats, UnifiedCache,
};
use crate::config::Settings;
use crate::query::{EntityId, ExecutorHandle, Filter, QueryExecutor};
use crate::queue::{Priority, QueryQueue, QueueConfig, QueueStats};

const SOURCE: &str = "service";
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const RECORDS_SOURCE_GROUP: &str = "records";

/// Component configuration for a [`RelayCache`].
#[derive(Debug, Clone)]
pub struct RelayCacheConfig {
    pub batch: BatchConfig,
    /// Hard deadline applied to every relay query.
    pub query_timeout: Duration,
    pub entity_ttl: Duration,
    pub queue: QueueConfig,
    pub max_timelines: NonZeroUsize,
    pub store: StoreConfig,
}

impl Default for RelayCacheConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            entity_ttl: DEFAULT_ENTITY_TTL,
            queue: QueueConfig::default(),
            max_timelines: NonZeroUsize::new(DEFAULT_MAX_TIMELINES).unwrap_or(NonZeroUsize::MIN),
            store: StoreConfig::default(),
        }
    }
}

impl From<&Settings> for RelayCacheConfig {
    fn from(settings: &Settings) -> Self {
        let mut queue = QueueConfig {
            default_concurrency: settings.queue.default_concurrency,
            ..QueueConfig::default()
        };
        for (group, limit) in &settings.queue.group_concurrency {
            queue = queue.with_group_limit(group.clone(), *limit);
        }

        Self {
            batch: BatchConfig {
                window: settings.batch.window,
                max_batch_size: settings.batch.max_batch_size,
            },
            query_timeout: settings.batch.query_timeout,
            entity_ttl: settings.entity.ttl,
            queue,
            max_timelines: settings.timeline.max_timelines,
            store: StoreConfig {
                max_entries: settings.store.max_entries,
                max_age: settings.store.max_age,
                derived_max_age: settings.store.derived_max_age,
                sweep_interval: settings.store.sweep_interval,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayCacheStats {
    pub records: EntityCacheStats,
    /// Entity caches handed out by [`RelayCache::entity_cache`] still alive.
    pub entity_caches: usize,
    pub queue: QueueStats,
    pub timelines: TimelineStats,
    pub store: StoreStats,
}

type ManagedCaches = Arc<Mutex<Vec<Weak<dyn ManagedCache>>>>;

pub struct RelayCache {
    config: RelayCacheConfig,
    executor: ExecutorHandle,
    queue: Arc<QueryQueue>,
    records: EntityCache<RelayBatchLoader<ById>>,
    timelines: TimelineCache,
    store: Arc<UnifiedCache>,
    entity_caches: ManagedCaches,
}

impl RelayCache {
    pub fn new(executor: Arc<dyn QueryExecutor>, config: RelayCacheConfig) -> Self {
        let executor = ExecutorHandle::new(executor);
        let queue = Arc::new(QueryQueue::new(config.queue.clone()));
        let records_loader = RelayBatchLoader::new(
            executor.clone(),
            Arc::clone(&queue),
            Filter::new(),
            KeyField::Ids,
            ById,
        )
        .with_source_group(RECORDS_SOURCE_GROUP)
        .with_timeout(config.query_timeout);
        let records = EntityCache::new(
            Coalescer::new(records_loader, config.batch.clone()),
            config.entity_ttl,
        );

        info!(
            batch_window_ms = config.batch.window.as_millis() as u64,
            max_batch_size = config.batch.max_batch_size.get(),
            entity_ttl_secs = config.entity_ttl.as_secs(),
            max_timelines = config.max_timelines.get(),
            store_max_entries = config.store.max_entries.get(),
            "Relay cache constructed"
        );

        Self {
            timelines: TimelineCache::new(config.max_timelines),
            store: Arc::new(UnifiedCache::new(config.store.clone())),
            entity_caches: Arc::new(Mutex::new(vec![records.managed()])),
            records,
            queue,
            executor,
            config,
        }
    }

    pub fn from_settings(executor: Arc<dyn QueryExecutor>, settings: &Settings) -> Self {
        Self::new(executor, RelayCacheConfig::from(settings))
    }

    pub fn config(&self) -> &RelayCacheConfig {
        &self.config
    }

    pub fn executor(&self) -> &ExecutorHandle {
        &self.executor
    }

    pub fn queue(&self) -> &Arc<QueryQueue> {
        &self.queue
    }

    /// Per-id record cache; keys are record ids.
    pub fn records(&self) -> &EntityCache<RelayBatchLoader<ById>> {
        &self.records
    }

    pub fn timelines(&self) -> &TimelineCache {
        &self.timelines
    }

    pub fn store(&self) -> &Arc<UnifiedCache> {
        &self.store
    }

    /// Batch loader bound to this service's executor, queue and timeout.
    pub fn relay_loader<G: RecordGrouping>(
        &self,
        template: Filter,
        key_field: KeyField,
        grouping: G,
    ) -> RelayBatchLoader<G> {
        RelayBatchLoader::new(
            self.executor.clone(),
            Arc::clone(&self.queue),
            template,
            key_field,
            grouping,
        )
        .with_timeout(self.config.query_timeout)
    }

    /// Build an entity cache over `template`, e.g. reaction counts keyed by
    /// the referenced post. It is cleared and purged along with the service.
    pub fn entity_cache<G: RecordGrouping>(
        &self,
        template: Filter,
        key_field: KeyField,
        grouping: G,
        source_group: &str,
        priority: Priority,
    ) -> EntityCache<RelayBatchLoader<G>> {
        let loader = self
            .relay_loader(template, key_field, grouping)
            .with_source_group(source_group)
            .with_priority(priority);
        let cache = EntityCache::new(
            Coalescer::new(loader, self.config.batch.clone()),
            self.config.entity_ttl,
        );

        let mut caches = mutex_lock(&self.entity_caches, SOURCE, "entity_cache");
        caches.retain(|cache| cache.strong_count() > 0);
        caches.push(cache.managed());
        debug!(source_group, entity_caches = caches.len(), "Entity cache registered");
        cache
    }

    /// Resolve every record id through the coalescer so later reads hit.
    pub async fn prefetch(&self, ids: &[EntityId]) {
        self.records.prefetch(ids).await;
    }

    /// Start the store sweeper and the entity purge loop. Both stop on their
    /// own once this service is dropped.
    pub fn start_sweepers(&self) -> Vec<JoinHandle<()>> {
        let store_sweeper = self.store.spawn_sweeper();

        let caches = Arc::downgrade(&self.entity_caches);
        let period = self.config.entity_ttl;
        let entity_sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(caches) = caches.upgrade() else {
                    break;
                };
                let live: Vec<Arc<dyn ManagedCache>> = mutex_lock(&caches, SOURCE, "purge")
                    .iter()
                    .filter_map(Weak::upgrade)
                    .collect();
                let purged: usize = live.iter().map(|cache| cache.purge_expired()).sum();
                if purged > 0 {
                    debug!(purged, caches = live.len(), "Expired entity entries purged");
                }
            }
        });

        vec![store_sweeper, entity_sweeper]
    }

    /// Drop every cached value in every component.
    pub fn clear(&self) {
        let caches: Vec<Arc<dyn ManagedCache>> =
            mutex_lock(&self.entity_caches, SOURCE, "clear")
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
        for cache in &caches {
            cache.clear_all();
        }
        self.timelines.clear();
        self.store.clear();
        info!(entity_caches = caches.len(), "Relay cache cleared");
    }

    /// Clear all state and rebind the query executor. Loaders resolve the
    /// executor per batch, so every cache picks up the new one.
    pub fn reset_for_testing(&self, executor: Arc<dyn QueryExecutor>) {
        self.executor.replace(executor);
        self.clear();
        info!("Relay cache reset with a new executor");
    }

    pub fn stats(&self) -> RelayCacheStats {
        let entity_caches = mutex_lock(&self.entity_caches, SOURCE, "stats")
            .iter()
            .filter(|cache| cache.strong_count() > 0)
            .count();
        RelayCacheStats {
            records: self.records.stats(),
            entity_caches,
            queue: self.queue.stats(),
            timelines: self.timelines.stats(),
            store: self.store.stats(),
        }
    }
}
