//! Batch loaders backed by the relay network.
//!
//! A [`RelayBatchLoader`] substitutes the collected keys into a filter
//! template, runs one query through the [`QueryQueue`] and splits the records
//! back into one value per key with a [`RecordGrouping`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::BatchLoader;
use crate::error::QueryError;
use crate::query::{EntityId, ExecutorHandle, Filter, QueryOptions, Record, query_with_deadline};
use crate::queue::{Priority, QueryQueue};

const DEFAULT_SOURCE_GROUP: &str = "default";
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the collected keys go in the outgoing filter, and how a returned
/// record is matched back to the keys it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyField {
    /// Keys are record ids (`ids: [...]`).
    Ids,
    /// Keys are referenced through a tag (`#e: [...]`).
    Tag(String),
}

impl KeyField {
    pub fn tag(name: impl Into<String>) -> Result<Self, QueryError> {
        let name = name.into();
        if name.is_empty() || name.starts_with('#') {
            return Err(QueryError::malformed_filter(format!(
                "reference tag must be a bare non-empty name, got `{name}`"
            )));
        }
        Ok(Self::Tag(name))
    }

    fn apply(&self, template: &Filter, keys: &[EntityId]) -> Filter {
        match self {
            Self::Ids => template.with_ids(keys),
            Self::Tag(tag) => template.with_tag_refs(tag, keys),
        }
    }

    fn matching_keys(&self, record: &Record, requested: &HashSet<&EntityId>) -> Vec<EntityId> {
        match self {
            Self::Ids => requested
                .get(&record.id)
                .map(|key| vec![(*key).clone()])
                .unwrap_or_default(),
            Self::Tag(tag) => {
                let mut keys: Vec<EntityId> = record
                    .tag_values(tag)
                    .map(EntityId::from)
                    .filter(|key| requested.contains(key))
                    .collect();
                keys.sort();
                keys.dedup();
                keys
            }
        }
    }
}

/// Folds the records answering one key into that key's value.
///
/// `fold` receives records deduplicated by id, newest first.
pub trait RecordGrouping: Send + Sync + 'static {
    type Value: Clone + Default + Send + Sync + 'static;

    fn fold(&self, records: Vec<Record>) -> Self::Value;
}

/// One record per key, looked up by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ById;

impl RecordGrouping for ById {
    type Value = Option<Record>;

    fn fold(&self, records: Vec<Record>) -> Self::Value {
        records.into_iter().next()
    }
}

/// Every record referencing the key, e.g. the comments on a post.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferencedRecords;

impl RecordGrouping for ReferencedRecords {
    type Value = Vec<Record>;

    fn fold(&self, records: Vec<Record>) -> Self::Value {
        records
    }
}

/// Number of distinct records referencing the key, e.g. a reaction count.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceCount;

impl RecordGrouping for ReferenceCount {
    type Value = u64;

    fn fold(&self, records: Vec<Record>) -> Self::Value {
        records.len() as u64
    }
}

pub struct RelayBatchLoader<G> {
    executor: ExecutorHandle,
    queue: Arc<QueryQueue>,
    template: Filter,
    key_field: KeyField,
    grouping: G,
    source_group: String,
    priority: Priority,
    timeout: Duration,
}

impl<G: RecordGrouping> RelayBatchLoader<G> {
    pub fn new(
        executor: ExecutorHandle,
        queue: Arc<QueryQueue>,
        template: Filter,
        key_field: KeyField,
        grouping: G,
    ) -> Self {
        Self {
            executor,
            queue,
            template,
            key_field,
            grouping,
            source_group: DEFAULT_SOURCE_GROUP.to_string(),
            priority: Priority::Medium,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_source_group(mut self, source_group: impl Into<String>) -> Self {
        self.source_group = source_group.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Filter that would be sent for `keys`.
    pub fn filter_for(&self, keys: &[EntityId]) -> Filter {
        self.key_field.apply(&self.template, keys)
    }

    fn group(&self, keys: &[EntityId], records: Vec<Record>) -> Vec<G::Value> {
        let requested: HashSet<&EntityId> = keys.iter().collect();
        let mut seen = HashSet::new();
        let mut unique: Vec<Record> = records
            .into_iter()
            .filter(|record| seen.insert(record.id.clone()))
            .collect();
        unique.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut by_key: HashMap<EntityId, Vec<Record>> = HashMap::new();
        let mut unmatched = 0usize;
        for record in unique {
            let matched = self.key_field.matching_keys(&record, &requested);
            if matched.is_empty() {
                unmatched += 1;
                continue;
            }
            for key in matched {
                by_key.entry(key).or_default().push(record.clone());
            }
        }
        if unmatched > 0 {
            debug!(unmatched, source_group = %self.source_group, "Ignoring records matching no requested key");
        }

        keys.iter()
            .map(|key| {
                let records = by_key.get(key).cloned().unwrap_or_default();
                self.grouping.fold(records)
            })
            .collect()
    }
}

#[async_trait]
impl<G: RecordGrouping> BatchLoader for RelayBatchLoader<G> {
    type Value = G::Value;

    async fn load_batch(&self, keys: &[EntityId]) -> Result<Vec<Self::Value>, QueryError> {
        let filters = [self.filter_for(keys)];
        let executor = self.executor.current();
        let options = QueryOptions {
            timeout: self.timeout,
        };
        let records = self
            .queue
            .enqueue(
                &self.source_group,
                self.priority,
                query_with_deadline(executor.as_ref(), &filters, options),
            )
            .await?;
        debug!(
            keys = keys.len(),
            records = records.len(),
            source_group = %self.source_group,
            "Relay batch returned"
        );
        Ok(self.group(keys, records))
    }
}
