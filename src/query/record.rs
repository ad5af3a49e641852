//! Records returned by the relay network.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a record. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A signed, immutable record as delivered by a relay.
///
/// The caches only look at `id` and `created_at`; batch groupings may also
/// read `tags` to route a record back to the key that requested it.
/// `created_at` is the source-supplied logical timestamp, not wall-clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: EntityId,
    pub created_at: u64,
    #[serde(default)]
    pub kind: u32,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl Record {
    pub fn new(id: impl Into<EntityId>, created_at: u64) -> Self {
        Self {
            id: id.into(),
            created_at,
            kind: 0,
            author: String::new(),
            tags: Vec::new(),
            content: String::new(),
        }
    }

    pub fn with_kind(mut self, kind: u32) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Append a `[name, value]` tag.
    pub fn with_tag(mut self, name: &str, value: impl Into<String>) -> Self {
        self.tags.push(vec![name.to_string(), value.into()]);
        self
    }

    /// Values of every tag named `name` (the second element of each tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_values_skips_other_tags_and_short_tags() {
        let mut record = Record::new("r1", 10)
            .with_tag("e", "target-1")
            .with_tag("p", "author-1")
            .with_tag("e", "target-2");
        record.tags.push(vec!["e".to_string()]);

        let values: Vec<&str> = record.tag_values("e").collect();
        assert_eq!(values, vec!["target-1", "target-2"]);
    }

    #[test]
    fn record_deserializes_with_defaults() {
        let record: Record =
            serde_json::from_str(r#"{"id":"abc","created_at":42}"#).expect("valid record");
        assert_eq!(record.id, EntityId::from("abc"));
        assert_eq!(record.created_at, 42);
        assert!(record.tags.is_empty());
    }
}
