//! Query aggregation and caching for a federated relay network.
//!
//! Many small, overlapping reads are coalesced into few batched relay
//! queries, throttled per source group, and cached by id, by ordered
//! timeline, and as full records with capacity and age bounds.
//!
//! Construct one [`RelayCache`] per process and share it as `Arc<RelayCache>`.

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod query;
pub mod queue;
pub mod service;

pub use error::{CacheError, QueryError};
pub use service::{RelayCache, RelayCacheConfig, RelayCacheStats};
