//! Opaque filter predicates sent to the Query Executor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CacheError;

use super::record::EntityId;

/// A relay filter: a JSON object whose fields the caching layer does not
/// interpret, except when substituting collected keys into `ids` or a
/// `#<tag>` reference array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Map<String, Value>);

impl Filter {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap an arbitrary JSON value; anything but an object is rejected.
    pub fn from_value(value: Value) -> Result<Self, CacheError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CacheError::malformed_filter(format!(
                "filter must be a JSON object, got `{other}`"
            ))),
        }
    }

    pub fn kinds(self, kinds: impl IntoIterator<Item = u32>) -> Self {
        let kinds = kinds.into_iter().map(Value::from).collect();
        self.with_field("kinds", Value::Array(kinds))
    }

    pub fn authors<I, S>(self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let authors = authors
            .into_iter()
            .map(|author| Value::String(author.into()))
            .collect();
        self.with_field("authors", Value::Array(authors))
    }

    pub fn limit(self, limit: u64) -> Self {
        self.with_field("limit", Value::from(limit))
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    /// Copy of this filter with `ids` set to `keys`.
    pub fn with_ids(&self, keys: &[EntityId]) -> Self {
        self.clone().with_field("ids", key_array(keys))
    }

    /// Copy of this filter with the `#<tag>` reference array set to `keys`.
    pub fn with_tag_refs(&self, tag: &str, keys: &[EntityId]) -> Self {
        self.clone().with_field(&format!("#{tag}"), key_array(keys))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Canonical form: object keys sorted, array elements sorted by their
    /// serialized form. Two filters that differ only in key or array order
    /// have the same canonical form.
    pub fn canonical(&self) -> Value {
        canonicalize(&Value::Object(self.0.clone()))
    }
}

fn key_array(keys: &[EntityId]) -> Value {
    Value::Array(
        keys.iter()
            .map(|key| Value::String(key.as_str().to_string()))
            .collect(),
    )
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, value)| (key.clone(), value))
                    .collect(),
            )
        }
        Value::Array(items) => {
            let mut items: Vec<(String, Value)> = items
                .iter()
                .map(canonicalize)
                .map(|item| (item.to_string(), item))
                .collect();
            items.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Array(items.into_iter().map(|(_, item)| item).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_form_ignores_key_and_array_order() {
        let a = Filter::from_value(json!({"kinds": [1, 7], "limit": 20, "#t": ["b", "a"]}))
            .expect("object filter");
        let b = Filter::from_value(json!({"#t": ["a", "b"], "limit": 20, "kinds": [7, 1]}))
            .expect("object filter");

        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical().to_string(), b.canonical().to_string());
    }

    #[test]
    fn canonical_form_distinguishes_values() {
        let a = Filter::new().kinds([1]).limit(20);
        let b = Filter::new().kinds([1]).limit(21);
        assert_ne!(a.canonical(), b.canonical());
    }

    #[test]
    fn non_object_filters_are_rejected() {
        let err = Filter::from_value(json!([1, 2])).expect_err("array is not a filter");
        assert!(matches!(err, CacheError::MalformedFilter { .. }));
    }

    #[test]
    fn tag_substitution_keeps_template_intact() {
        let template = Filter::new().kinds([7]);
        let keys = vec![EntityId::from("a"), EntityId::from("b")];

        let filled = template.with_tag_refs("e", &keys);

        assert_eq!(filled.get("#e"), Some(&json!(["a", "b"])));
        assert!(template.get("#e").is_none());
        assert_eq!(template.with_ids(&keys).get("ids"), Some(&json!(["a", "b"])));
    }
}
