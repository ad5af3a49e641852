use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::DebuggingRecorder;
use relaycache::cache::{StoreConfig, UnifiedCache};
use relaycache::query::{EntityId, Filter, QueryExecutor, QueryOptions, Record};
use relaycache::queue::{Priority, QueryQueue, QueueConfig};
use relaycache::{QueryError, RelayCache, RelayCacheConfig};
use tokio::sync::oneshot;

struct Fixed(Vec<Record>);

#[async_trait]
impl QueryExecutor for Fixed {
    async fn query(
        &self,
        _filters: &[Filter],
        _options: QueryOptions,
    ) -> Result<Vec<Record>, QueryError> {
        Ok(self.0.clone())
    }
}

struct Unreachable;

#[async_trait]
impl QueryExecutor for Unreachable {
    async fn query(
        &self,
        _filters: &[Filter],
        _options: QueryOptions,
    ) -> Result<Vec<Record>, QueryError> {
        Err(QueryError::network("connection refused"))
    }
}

#[tokio::test(start_paused = true)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    relaycache::infra::telemetry::describe_metrics();

    // Entity miss, batch flush, queue wait, then entity hit
    let service = RelayCache::new(
        Arc::new(Fixed(vec![Record::new("a", 1)])),
        RelayCacheConfig::default(),
    );
    let id = EntityId::from("a");
    assert!(service.records().load(&id).await.is_some());
    assert!(service.records().load(&id).await.is_some());

    // Batch failure resolves with the default
    let failing = RelayCache::new(Arc::new(Unreachable), RelayCacheConfig::default());
    assert!(failing.records().load(&id).await.is_none());

    // Queue depth while a second task waits for the only slot
    let queue = QueryQueue::new(QueueConfig::default().with_group_limit("x", NonZeroUsize::MIN));
    let (release, gate) = oneshot::channel::<()>();
    tokio::join!(
        queue.enqueue("x", Priority::High, async {
            let _ = gate.await;
        }),
        queue.enqueue("x", Priority::Low, async {}),
        async move {
            let _ = release.send(());
        },
    );

    // Store eviction and expiry
    let store: UnifiedCache = UnifiedCache::new(StoreConfig {
        max_entries: NonZeroUsize::MIN,
        max_age: Duration::from_secs(60),
        ..StoreConfig::default()
    });
    store.put([Record::new("first", 1), Record::new("second", 2)]);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(store.get(&EntityId::from("second")).is_none());

    // Timeline admission
    service
        .timelines()
        .set_timeline(&["wss://relay"], &Filter::new(), &[Record::new("a", 1)]);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "relaycache_batch_flush_total",
        "relaycache_batch_keys",
        "relaycache_batch_failure_total",
        "relaycache_entity_hit_total",
        "relaycache_entity_miss_total",
        "relaycache_queue_wait_ms",
        "relaycache_queue_depth",
        "relaycache_store_evict_total",
        "relaycache_store_expired_total",
        "relaycache_timeline_refs_admitted_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
