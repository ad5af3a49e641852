//! Configuration layer: typed settings with layered precedence (defaults → file → env).

use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    path::Path,
    str::FromStr,
    time::Duration,
};

use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const LOCAL_CONFIG_BASENAME: &str = "relaycache";
const ENV_PREFIX: &str = "RELAYCACHE";
const DEFAULT_BATCH_WINDOW_MS: u64 = 50;
const DEFAULT_BATCH_MAX_SIZE: u64 = 100;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_ENTITY_TTL_SECS: u64 = 120;
const DEFAULT_QUEUE_CONCURRENCY: u64 = 3;
const DEFAULT_MAX_TIMELINES: u64 = 50;
const DEFAULT_STORE_MAX_ENTRIES: u64 = 1_000;
const DEFAULT_STORE_MAX_AGE_SECS: u64 = 30 * 60;
const DEFAULT_STORE_DERIVED_MAX_AGE_SECS: u64 = 5 * 60;
const DEFAULT_STORE_SWEEP_INTERVAL_SECS: u64 = 10 * 60;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub batch: BatchSettings,
    pub entity: EntitySettings,
    pub queue: QueueSettings,
    pub timeline: TimelineSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub window: Duration,
    pub max_batch_size: NonZeroUsize,
    pub query_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EntitySettings {
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub default_concurrency: NonZeroUsize,
    pub group_concurrency: BTreeMap<String, NonZeroUsize>,
}

#[derive(Debug, Clone)]
pub struct TimelineSettings {
    pub max_timelines: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_entries: NonZeroUsize,
    pub max_age: Duration,
    pub derived_max_age: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Load settings: built-in defaults, then `relaycache.toml` (or `config_file`
/// when given, which must exist), then `RELAYCACHE__*` environment variables.
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    load_from(builder)
}

fn load_from(builder: ConfigBuilder<DefaultState>) -> Result<Settings, LoadError> {
    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    batch: RawBatchSettings,
    entity: RawEntitySettings,
    queue: RawQueueSettings,
    timeline: RawTimelineSettings,
    store: RawStoreSettings,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            batch,
            entity,
            queue,
            timeline,
            store,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            batch: build_batch_settings(batch)?,
            entity: build_entity_settings(entity)?,
            queue: build_queue_settings(queue)?,
            timeline: build_timeline_settings(timeline)?,
            store: build_store_settings(store)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_batch_settings(batch: RawBatchSettings) -> Result<BatchSettings, LoadError> {
    let window_ms = non_zero_u64(
        batch.window_ms.unwrap_or(DEFAULT_BATCH_WINDOW_MS),
        "batch.window_ms",
    )?;
    let max_batch_size = non_zero_usize(
        batch.max_batch_size.unwrap_or(DEFAULT_BATCH_MAX_SIZE),
        "batch.max_batch_size",
    )?;
    let query_timeout_ms = non_zero_u64(
        batch.query_timeout_ms.unwrap_or(DEFAULT_QUERY_TIMEOUT_MS),
        "batch.query_timeout_ms",
    )?;

    Ok(BatchSettings {
        window: Duration::from_millis(window_ms),
        max_batch_size,
        query_timeout: Duration::from_millis(query_timeout_ms),
    })
}

fn build_entity_settings(entity: RawEntitySettings) -> Result<EntitySettings, LoadError> {
    let ttl_secs = non_zero_u64(
        entity.ttl_secs.unwrap_or(DEFAULT_ENTITY_TTL_SECS),
        "entity.ttl_secs",
    )?;
    Ok(EntitySettings {
        ttl: Duration::from_secs(ttl_secs),
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let default_concurrency = non_zero_usize(
        queue
            .default_concurrency
            .unwrap_or(DEFAULT_QUEUE_CONCURRENCY),
        "queue.default_concurrency",
    )?;

    let mut group_concurrency = BTreeMap::new();
    for (group, limit) in queue.group_concurrency {
        let trimmed = group.trim();
        if trimmed.is_empty() {
            return Err(LoadError::invalid(
                "queue.group_concurrency",
                "source group name must not be empty",
            ));
        }
        let limit = non_zero_usize(limit, format!("queue.group_concurrency.{trimmed}"))?;
        group_concurrency.insert(trimmed.to_string(), limit);
    }

    Ok(QueueSettings {
        default_concurrency,
        group_concurrency,
    })
}

fn build_timeline_settings(timeline: RawTimelineSettings) -> Result<TimelineSettings, LoadError> {
    let max_timelines = non_zero_usize(
        timeline.max_timelines.unwrap_or(DEFAULT_MAX_TIMELINES),
        "timeline.max_timelines",
    )?;
    Ok(TimelineSettings { max_timelines })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let max_entries = non_zero_usize(
        store.max_entries.unwrap_or(DEFAULT_STORE_MAX_ENTRIES),
        "store.max_entries",
    )?;
    let max_age_secs = non_zero_u64(
        store.max_age_secs.unwrap_or(DEFAULT_STORE_MAX_AGE_SECS),
        "store.max_age_secs",
    )?;
    let derived_max_age_secs = non_zero_u64(
        store
            .derived_max_age_secs
            .unwrap_or(DEFAULT_STORE_DERIVED_MAX_AGE_SECS),
        "store.derived_max_age_secs",
    )?;
    let sweep_interval_secs = non_zero_u64(
        store
            .sweep_interval_secs
            .unwrap_or(DEFAULT_STORE_SWEEP_INTERVAL_SECS),
        "store.sweep_interval_secs",
    )?;

    Ok(StoreSettings {
        max_entries,
        max_age: Duration::from_secs(max_age_secs),
        derived_max_age: Duration::from_secs(derived_max_age_secs),
        sweep_interval: Duration::from_secs(sweep_interval_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBatchSettings {
    window_ms: Option<u64>,
    max_batch_size: Option<u64>,
    query_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEntitySettings {
    ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    default_concurrency: Option<u64>,
    group_concurrency: HashMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTimelineSettings {
    max_timelines: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    max_entries: Option<u64>,
    max_age_secs: Option<u64>,
    derived_max_age_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn non_zero_usize(value: u64, key: impl Into<String>) -> Result<NonZeroUsize, LoadError> {
    let key = key.into();
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key.clone(), "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn load_toml(contents: &str) -> Result<Settings, LoadError> {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp config file");
        file.write_all(contents.as_bytes()).expect("write config");
        load_from(Config::builder().add_source(File::from(file.path()).required(true)))
    }

    #[test]
    fn defaults_match_reference_values() {
        let settings = Settings::from_raw(RawSettings::default()).expect("defaults validate");
        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert_eq!(settings.logging.format, LogFormat::Compact);
        assert_eq!(settings.batch.window, Duration::from_millis(50));
        assert_eq!(settings.batch.max_batch_size.get(), 100);
        assert_eq!(settings.batch.query_timeout, Duration::from_secs(5));
        assert_eq!(settings.entity.ttl, Duration::from_secs(120));
        assert_eq!(settings.queue.default_concurrency.get(), 3);
        assert!(settings.queue.group_concurrency.is_empty());
        assert_eq!(settings.timeline.max_timelines.get(), 50);
        assert_eq!(settings.store.max_entries.get(), 1000);
        assert_eq!(settings.store.max_age, Duration::from_secs(1800));
        assert_eq!(settings.store.derived_max_age, Duration::from_secs(300));
        assert_eq!(settings.store.sweep_interval, Duration::from_secs(600));
    }

    #[test]
    fn file_values_override_defaults() {
        let settings = load_toml(
            r#"
            [logging]
            level = "debug"
            json = true

            [batch]
            window_ms = 20

            [queue]
            default_concurrency = 2

            [queue.group_concurrency]
            profiles = 4
            "#,
        )
        .expect("settings");

        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.batch.window, Duration::from_millis(20));
        assert_eq!(settings.batch.max_batch_size.get(), 100);
        assert_eq!(settings.queue.default_concurrency.get(), 2);
        assert_eq!(
            settings.queue.group_concurrency.get("profiles").map(|n| n.get()),
            Some(4)
        );
    }

    #[test]
    fn overrides_take_precedence_over_file_values() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp config file");
        file.write_all(b"[entity]\nttl_secs = 30\n").expect("write config");

        let builder = Config::builder()
            .add_source(File::from(file.path()).required(true))
            .set_override("entity.ttl_secs", 45)
            .expect("override");
        let settings = load_from(builder).expect("settings");

        assert_eq!(settings.entity.ttl, Duration::from_secs(45));
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = load_toml("[store]\nmax_entries = 0\n").expect_err("zero capacity");
        assert!(matches!(err, LoadError::Invalid { ref key, .. } if key == "store.max_entries"));

        let err = load_toml("[queue.group_concurrency]\nrelays = 0\n").expect_err("zero limit");
        assert!(
            matches!(err, LoadError::Invalid { ref key, .. } if key == "queue.group_concurrency.relays")
        );
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let err = load_toml("[logging]\nlevel = \"loud\"\n").expect_err("bad level");
        assert!(matches!(err, LoadError::Invalid { ref key, .. } if key == "logging.level"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load(Some(Path::new("/nonexistent/relaycache.toml"))).expect_err("missing file");
        assert!(matches!(err, LoadError::Build(_)));
    }
}
