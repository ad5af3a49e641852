//! Relay cache layers.
//!
//! - **Entity cache**: per-id values with a TTL, filled through the batching
//!   coalescer, with per-key subscribers for reactive consumers.
//! - **Timeline cache**: ordered `(id, created_at)` refs for set queries,
//!   addressed by a [`CacheKey`] derived from the query and its sources.
//! - **Unified store**: full records bounded by count and age, with a
//!   shorter-lived derived-data map alongside.

mod entity;
mod keys;
pub(crate) mod lock;
mod store;
mod subscribers;
mod timeline;

pub use entity::{DEFAULT_ENTITY_TTL, EntityCache, EntityCacheStats};
pub(crate) use entity::ManagedCache;
pub use keys::{CacheKey, timeline_key};
pub use store::{CacheEntry, Engagement, StoreConfig, StoreStats, SweepReport, UnifiedCache};
pub use subscribers::{Callback, Subscription};
pub use timeline::{
    DEFAULT_MAX_TIMELINES, Timeline, TimelineCache, TimelineRef, TimelineStats, UpdateMode,
};
