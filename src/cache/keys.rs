//! Timeline cache keys.
//!
//! A [`CacheKey`] addresses one timeline: the hash of a canonical rendering of
//! the filter plus the sorted, deduplicated source list. Reordering object
//! keys, filter arrays or sources never changes the key.

use std::fmt;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::query::Filter;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the key for a timeline over `filter` served by `sources`.
pub fn timeline_key<S: AsRef<str>>(sources: &[S], filter: &Filter) -> CacheKey {
    let mut sources: Vec<&str> = sources.iter().map(|source| source.as_ref()).collect();
    sources.sort_unstable();
    sources.dedup();

    let signature = json!({
        "filter": filter.canonical(),
        "sources": sources,
    });
    let mut hasher = Sha256::new();
    hasher.update(signature.to_string().as_bytes());
    CacheKey(hex::encode(hasher.finalize()))
}
