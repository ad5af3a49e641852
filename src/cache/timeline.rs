//! Timeline ref cache.
//!
//! A timeline is the ordered list of `(id, created_at)` refs answering one
//! set query. Refs are kept newest first, ties broken by ascending id, with
//! no id appearing twice. Full records are resolved separately by callers.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::keys::{CacheKey, timeline_key};
use super::lock::mutex_lock;
use crate::error::CacheError;
use crate::query::{EntityId, Filter, Record};

const SOURCE: &str = "cache::timeline";
const METRIC_TIMELINE_REFS_ADMITTED_TOTAL: &str = "relaycache_timeline_refs_admitted_total";

/// Default number of timelines kept before the least recently used is dropped.
pub const DEFAULT_MAX_TIMELINES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TimelineRef {
    pub id: EntityId,
    pub created_at: u64,
}

impl TimelineRef {
    pub fn new(id: impl Into<EntityId>, created_at: u64) -> Self {
        Self {
            id: id.into(),
            created_at,
        }
    }
}

impl From<&Record> for TimelineRef {
    fn from(record: &Record) -> Self {
        Self::new(record.id.clone(), record.created_at)
    }
}

/// Timeline order: the ref that should be listed first compares smallest.
impl Ord for TimelineRef {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for TimelineRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Newer data at the head; only refs newer than the current newest are admitted.
    Prepend,
    /// Older data at the tail; only refs older than the current oldest are admitted.
    Append,
}

impl UpdateMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Prepend => "prepend",
            Self::Append => "append",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timeline {
    refs: Vec<TimelineRef>,
    ids: HashSet<EntityId>,
    query_signature: Value,
    sources: Vec<String>,
}

impl Timeline {
    fn new(sources: Vec<String>, query_signature: Value, records: &[Record]) -> Self {
        let mut timeline = Self {
            refs: Vec::with_capacity(records.len()),
            ids: HashSet::with_capacity(records.len()),
            query_signature,
            sources,
        };
        for record in records {
            if timeline.ids.insert(record.id.clone()) {
                timeline.refs.push(TimelineRef::from(record));
            }
        }
        timeline.refs.sort();
        timeline
    }

    pub fn refs(&self) -> &[TimelineRef] {
        &self.refs
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn newest(&self) -> Option<&TimelineRef> {
        self.refs.first()
    }

    pub fn oldest(&self) -> Option<&TimelineRef> {
        self.refs.last()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.ids.contains(id)
    }

    /// Canonical form of the filter this timeline answers.
    pub fn query_signature(&self) -> &Value {
        &self.query_signature
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Ids of `refs[offset..offset + limit]`, clamped to the timeline.
    pub fn page(&self, offset: usize, limit: usize) -> Vec<EntityId> {
        self.refs
            .iter()
            .skip(offset)
            .take(limit)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Strictly ordered with no duplicate ids.
    pub fn is_ordered(&self) -> bool {
        self.refs.windows(2).all(|pair| pair[0] < pair[1]) && self.ids.len() == self.refs.len()
    }

    fn admit(&mut self, records: &[Record], mode: UpdateMode) -> usize {
        let bound = match mode {
            UpdateMode::Prepend => self.newest().map(|r| r.created_at),
            UpdateMode::Append => self.oldest().map(|r| r.created_at),
        };
        let mut admitted: Vec<TimelineRef> = Vec::new();
        for record in records {
            let eligible = match (mode, bound) {
                (_, None) => true,
                (UpdateMode::Prepend, Some(newest)) => record.created_at > newest,
                (UpdateMode::Append, Some(oldest)) => record.created_at < oldest,
            };
            if eligible && self.ids.insert(record.id.clone()) {
                admitted.push(TimelineRef::from(record));
            }
        }
        admitted.sort();

        let count = admitted.len();
        match mode {
            UpdateMode::Prepend => {
                admitted.append(&mut self.refs);
                self.refs = admitted;
            }
            UpdateMode::Append => self.refs.append(&mut admitted),
        }
        count
    }

    fn insert(&mut self, record: &Record) -> bool {
        if !self.ids.insert(record.id.clone()) {
            return false;
        }
        let new_ref = TimelineRef::from(record);
        let position = self.refs.partition_point(|existing| existing < &new_ref);
        self.refs.insert(position, new_ref);
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineStats {
    pub timelines: usize,
    pub capacity: usize,
    pub total_refs: usize,
    pub refs_admitted: u64,
}

pub struct TimelineCache {
    timelines: Mutex<LruCache<CacheKey, Timeline>>,
    refs_admitted: AtomicU64,
}

impl Default for TimelineCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_MAX_TIMELINES).unwrap_or(NonZeroUsize::MIN))
    }
}

impl TimelineCache {
    pub fn new(max_timelines: NonZeroUsize) -> Self {
        Self {
            timelines: Mutex::new(LruCache::new(max_timelines)),
            refs_admitted: AtomicU64::new(0),
        }
    }

    /// Store the initial refs for `(sources, filter)`, replacing any existing
    /// timeline under the same key.
    pub fn set_timeline<S: AsRef<str>>(
        &self,
        sources: &[S],
        filter: &Filter,
        records: &[Record],
    ) -> CacheKey {
        let key = timeline_key(sources, filter);
        let mut sorted_sources: Vec<String> =
            sources.iter().map(|s| s.as_ref().to_string()).collect();
        sorted_sources.sort();
        sorted_sources.dedup();

        let timeline = Timeline::new(sorted_sources, filter.canonical(), records);
        debug_assert!(timeline.is_ordered());
        let refs = timeline.len();

        let evicted = mutex_lock(&self.timelines, SOURCE, "set_timeline").push(key.clone(), timeline);
        if let Some((evicted_key, _)) = evicted.filter(|(evicted_key, _)| evicted_key != &key) {
            debug!(cache_key = %evicted_key, "Timeline evicted");
        }
        self.record_admitted(refs);
        debug!(cache_key = %key, refs, "Timeline set");
        key
    }

    pub fn get_timeline(&self, key: &CacheKey) -> Option<Timeline> {
        mutex_lock(&self.timelines, SOURCE, "get_timeline")
            .get(key)
            .cloned()
    }

    /// Merge `records` into the timeline. Returns how many refs were admitted.
    pub fn update_timeline(
        &self,
        key: &CacheKey,
        records: &[Record],
        mode: UpdateMode,
    ) -> Result<usize, CacheError> {
        let admitted = {
            let mut timelines = mutex_lock(&self.timelines, SOURCE, "update_timeline");
            let timeline = timelines
                .get_mut(key)
                .ok_or_else(|| CacheError::unknown_timeline(key))?;
            let admitted = timeline.admit(records, mode);
            debug_assert!(timeline.is_ordered());
            admitted
        };
        self.record_admitted(admitted);
        debug!(
            cache_key = %key,
            mode = mode.as_str(),
            offered = records.len(),
            admitted,
            "Timeline updated"
        );
        Ok(admitted)
    }

    /// Insert one real-time record at its ordered position. Returns `false`
    /// if the id is already present.
    pub fn insert_record(&self, key: &CacheKey, record: &Record) -> Result<bool, CacheError> {
        let inserted = {
            let mut timelines = mutex_lock(&self.timelines, SOURCE, "insert_record");
            let timeline = timelines
                .get_mut(key)
                .ok_or_else(|| CacheError::unknown_timeline(key))?;
            let inserted = timeline.insert(record);
            debug_assert!(timeline.is_ordered());
            inserted
        };
        if inserted {
            self.record_admitted(1);
        }
        Ok(inserted)
    }

    /// Ids for one page. An unknown key yields an empty page.
    pub fn get_key_for_page(&self, key: &CacheKey, offset: usize, limit: usize) -> Vec<EntityId> {
        mutex_lock(&self.timelines, SOURCE, "get_key_for_page")
            .get(key)
            .map(|timeline| timeline.page(offset, limit))
            .unwrap_or_default()
    }

    pub fn invalidate_timeline(&self, key: &CacheKey) -> bool {
        let removed = mutex_lock(&self.timelines, SOURCE, "invalidate_timeline")
            .pop(key)
            .is_some();
        if removed {
            debug!(cache_key = %key, "Timeline invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        mutex_lock(&self.timelines, SOURCE, "clear").clear();
    }

    pub fn stats(&self) -> TimelineStats {
        let timelines = mutex_lock(&self.timelines, SOURCE, "stats");
        TimelineStats {
            timelines: timelines.len(),
            capacity: timelines.cap().get(),
            total_refs: timelines.iter().map(|(_, t)| t.len()).sum(),
            refs_admitted: self.refs_admitted.load(AtomicOrdering::Relaxed),
        }
    }

    fn record_admitted(&self, count: usize) {
        self.refs_admitted
            .fetch_add(count as u64, AtomicOrdering::Relaxed);
        counter!(METRIC_TIMELINE_REFS_ADMITTED_TOTAL).increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(stamps: &[(&str, u64)]) -> Vec<Record> {
        stamps
            .iter()
            .map(|(id, created_at)| Record::new(*id, *created_at))
            .collect()
    }

    fn ids(cache: &TimelineCache, key: &CacheKey) -> Vec<String> {
        cache
            .get_key_for_page(key, 0, usize::MAX)
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect()
    }

    fn video_feed() -> Filter {
        Filter::new().kinds([34235]).limit(20)
    }

    #[test]
    fn set_timeline_sorts_and_dedupes() {
        let cache = TimelineCache::default();
        let key = cache.set_timeline(
            &["wss://a"],
            &video_feed(),
            &records(&[("c", 80), ("a", 100), ("b", 90), ("a", 100), ("d", 90)]),
        );

        assert_eq!(ids(&cache, &key), vec!["a", "b", "d", "c"]);
        let timeline = cache.get_timeline(&key).expect("timeline");
        assert!(timeline.is_ordered());
        assert_eq!(timeline.newest().map(|r| r.created_at), Some(100));
        assert_eq!(timeline.oldest().map(|r| r.created_at), Some(80));
    }

    #[test]
    fn insert_record_lands_in_order() {
        let cache = TimelineCache::default();
        let key = cache.set_timeline(
            &["wss://a"],
            &video_feed(),
            &records(&[("x100", 100), ("x90", 90), ("x80", 80)]),
        );

        assert_eq!(cache.insert_record(&key, &Record::new("x95", 95)), Ok(true));

        let stamps: Vec<u64> = cache
            .get_timeline(&key)
            .expect("timeline")
            .refs()
            .iter()
            .map(|r| r.created_at)
            .collect();
        assert_eq!(stamps, vec![100, 95, 90, 80]);
    }

    #[test]
    fn insert_record_is_idempotent() {
        let cache = TimelineCache::default();
        let key = cache.set_timeline(&["wss://a"], &video_feed(), &records(&[("a", 10)]));

        assert_eq!(cache.insert_record(&key, &Record::new("a", 10)), Ok(false));
        assert_eq!(cache.get_timeline(&key).expect("timeline").len(), 1);
    }

    #[test]
    fn timestamp_ties_break_by_id() {
        let cache = TimelineCache::default();
        let key = cache.set_timeline(&["wss://a"], &video_feed(), &records(&[("m", 50)]));
        cache.insert_record(&key, &Record::new("z", 50)).expect("insert");
        cache.insert_record(&key, &Record::new("b", 50)).expect("insert");

        assert_eq!(ids(&cache, &key), vec!["b", "m", "z"]);
    }

    #[test]
    fn prepend_admits_only_strictly_newer() {
        let cache = TimelineCache::default();
        let key = cache.set_timeline(&["wss://a"], &video_feed(), &records(&[("a", 100), ("b", 90)]));

        let admitted = cache
            .update_timeline(&key, &records(&[("old", 95), ("tie", 100), ("older", 10)]), UpdateMode::Prepend)
            .expect("update");
        assert_eq!(admitted, 0);

        let admitted = cache
            .update_timeline(&key, &records(&[("n1", 110), ("n2", 120), ("skip", 50)]), UpdateMode::Prepend)
            .expect("update");
        assert_eq!(admitted, 2);
        assert_eq!(ids(&cache, &key), vec!["n2", "n1", "a", "b"]);
    }

    #[test]
    fn append_admits_only_strictly_older() {
        let cache = TimelineCache::default();
        let key = cache.set_timeline(&["wss://a"], &video_feed(), &records(&[("a", 100), ("b", 90)]));

        let admitted = cache
            .update_timeline(
                &key,
                &records(&[("p1", 70), ("dup", 90), ("p2", 80), ("p1", 70)]),
                UpdateMode::Append,
            )
            .expect("update");

        assert_eq!(admitted, 2);
        assert_eq!(ids(&cache, &key), vec!["a", "b", "p2", "p1"]);
    }

    #[test]
    fn update_on_empty_timeline_admits_everything() {
        let cache = TimelineCache::default();
        let key = cache.set_timeline(&["wss://a"], &video_feed(), &[]);

        let admitted = cache
            .update_timeline(&key, &records(&[("a", 1), ("b", 2)]), UpdateMode::Append)
            .expect("update");

        assert_eq!(admitted, 2);
        assert_eq!(ids(&cache, &key), vec!["b", "a"]);
    }

    #[test]
    fn unknown_key_is_an_error_for_mutations_and_empty_for_pages() {
        let cache = TimelineCache::default();
        let key = timeline_key(&["wss://a"], &video_feed());

        assert_eq!(
            cache.update_timeline(&key, &[], UpdateMode::Prepend),
            Err(CacheError::unknown_timeline(&key))
        );
        assert_eq!(
            cache.insert_record(&key, &Record::new("a", 1)),
            Err(CacheError::unknown_timeline(&key))
        );
        assert!(cache.get_key_for_page(&key, 0, 10).is_empty());
    }

    #[test]
    fn page_slices_and_clamps() {
        let cache = TimelineCache::default();
        let key = cache.set_timeline(
            &["wss://a"],
            &video_feed(),
            &records(&[("a", 5), ("b", 4), ("c", 3), ("d", 2), ("e", 1)]),
        );

        let page: Vec<String> = cache
            .get_key_for_page(&key, 3, 10)
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(page, vec!["d", "e"]);
        assert!(cache.get_key_for_page(&key, 10, 10).is_empty());
    }

    #[test]
    fn least_recently_used_timeline_is_dropped_at_capacity() {
        let cache = TimelineCache::new(NonZeroUsize::new(2).expect("non-zero"));
        let first = cache.set_timeline(&["wss://a"], &Filter::new().kinds([1]), &[]);
        let second = cache.set_timeline(&["wss://a"], &Filter::new().kinds([2]), &[]);
        assert!(cache.get_timeline(&first).is_some());

        let third = cache.set_timeline(&["wss://a"], &Filter::new().kinds([3]), &[]);

        assert!(cache.get_timeline(&first).is_some());
        assert!(cache.get_timeline(&second).is_none());
        assert!(cache.get_timeline(&third).is_some());
        assert_eq!(cache.stats().timelines, 2);
    }

    #[test]
    fn invalidate_removes_timeline() {
        let cache = TimelineCache::default();
        let key = cache.set_timeline(&["wss://a"], &video_feed(), &records(&[("a", 1)]));

        assert!(cache.invalidate_timeline(&key));
        assert!(!cache.invalidate_timeline(&key));
        assert!(cache.get_timeline(&key).is_none());
    }
}
