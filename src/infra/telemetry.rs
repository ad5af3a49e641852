use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing::{Subscriber, info};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the process-wide tracing subscriber for a relay cache host.
///
/// Batch flushes, window timers and sweepers log from spawned tasks, so
/// events carry the emitting thread, and JSON output lifts event fields
/// (`batch_id`, `source_group`, `cache_key`) to the top level. Returns
/// [`InfraError::Telemetry`] when a global subscriber is already set.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer(logging.format))
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("tracing subscriber already set: {err}")))?;

    info!(
        level = %logging.level,
        format = ?logging.format,
        "Relay cache telemetry initialised"
    );
    Ok(())
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span> + 'static,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_thread_names(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(true)
            .boxed(),
    }
}

/// Register descriptions for every metric this crate emits with the
/// currently installed recorder. Runs once per process.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "relaycache_batch_flush_total",
            Unit::Count,
            "Total number of batches handed to a batch loader."
        );
        describe_histogram!(
            "relaycache_batch_keys",
            Unit::Count,
            "Distinct keys per flushed batch."
        );
        describe_counter!(
            "relaycache_batch_failure_total",
            Unit::Count,
            "Total number of batches resolved with defaults after a loader failure."
        );
        describe_counter!(
            "relaycache_entity_hit_total",
            Unit::Count,
            "Total number of entity cache hits."
        );
        describe_counter!(
            "relaycache_entity_miss_total",
            Unit::Count,
            "Total number of entity cache misses, including expired entries."
        );
        describe_histogram!(
            "relaycache_queue_wait_ms",
            Unit::Milliseconds,
            "Time a query task waited for a concurrency slot in milliseconds."
        );
        describe_gauge!(
            "relaycache_queue_depth",
            Unit::Count,
            "Tasks waiting for a slot, per source group."
        );
        describe_counter!(
            "relaycache_store_evict_total",
            Unit::Count,
            "Total number of store entries evicted due to capacity."
        );
        describe_counter!(
            "relaycache_store_expired_total",
            Unit::Count,
            "Total number of store entries removed after exceeding their maximum age."
        );
        describe_counter!(
            "relaycache_timeline_refs_admitted_total",
            Unit::Count,
            "Total number of refs admitted into timelines."
        );
    });
}
