//! # Cache Key Layout
//!
//! Every cache key lives under one application namespace so that an
//! entity, its lists, or the whole cache can be cleared by prefix.
//!
//! ```text
//! <app>/cache/<entity>/<id>             single row
//! <app>/cache/<entity>/list/<query>     list result
//! <app>/cache/<entity>/count/<query>    count result
//! ```
//!
//! `<query>` is rendered from sorted `key=value` pairs, so two equal
//! queries built in a different order share a key. Ids, columns and
//! values are percent-encoded, so `/`, `&` and `=` inside them cannot
//! reach into another key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use urlencoding::encode;

// =============================================================================
// List Query
// =============================================================================

/// An equality filter over a table.
///
/// Doubles as the remote `select` filter and as the cache key suffix for
/// list and count results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    filters: BTreeMap<String, String>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `column = value`.
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(column.into(), value.into());
        self
    }

    pub fn filters(&self) -> &BTreeMap<String, String> {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Stable key segment: `all` for no filters, otherwise `a=1&b=2`
    /// with each column and value percent-encoded.
    pub fn key_segment(&self) -> String {
        if self.filters.is_empty() {
            return "all".to_string();
        }
        self.filters
            .iter()
            .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// True if a JSON row satisfies every equality filter.
    ///
    /// String columns compare directly; other JSON scalars compare by
    /// their rendered form.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        self.filters.iter().all(|(col, expected)| match row.get(col) {
            Some(serde_json::Value::String(s)) => s == expected,
            Some(serde_json::Value::Null) | None => false,
            Some(other) => other.to_string() == *expected,
        })
    }
}

// =============================================================================
// Cache Keys
// =============================================================================

/// Builds keys inside one application namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    namespace: String,
}

impl CacheKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        CacheKeys {
            namespace: namespace.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix covering every cache key in the namespace.
    pub fn root(&self) -> String {
        format!("{}/cache/", self.namespace)
    }

    /// Prefix covering every key of one entity.
    pub fn entity_prefix(&self, entity: &str) -> String {
        format!("{}{}/", self.root(), entity)
    }

    /// `list` and `count` are safe as ids: an id can never contain `/`
    /// once encoded.
    pub fn entity(&self, entity: &str, id: &str) -> String {
        format!("{}{}", self.entity_prefix(entity), encode(id))
    }

    pub fn list_prefix(&self, entity: &str) -> String {
        format!("{}list/", self.entity_prefix(entity))
    }

    pub fn list(&self, entity: &str, query: &ListQuery) -> String {
        format!("{}{}", self.list_prefix(entity), query.key_segment())
    }

    pub fn count_prefix(&self, entity: &str) -> String {
        format!("{}count/", self.entity_prefix(entity))
    }

    pub fn count(&self, entity: &str, query: &ListQuery) -> String {
        format!("{}{}", self.count_prefix(entity), query.key_segment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_layout() {
        let keys = CacheKeys::new("fitquest/");
        assert_eq!(keys.entity("challenge", "c1"), "fitquest/cache/challenge/c1");
        assert_eq!(
            keys.list("challenge", &ListQuery::new()),
            "fitquest/cache/challenge/list/all"
        );
        assert_eq!(
            keys.count("participant", &ListQuery::new().where_eq("challenge_id", "c1")),
            "fitquest/cache/participant/count/challenge_id=c1"
        );
        assert!(keys.list("challenge", &ListQuery::new()).starts_with(&keys.entity_prefix("challenge")));
    }

    #[test]
    fn test_query_segment_is_order_independent() {
        let a = ListQuery::new().where_eq("status", "active").where_eq("owner_id", "u1");
        let b = ListQuery::new().where_eq("owner_id", "u1").where_eq("status", "active");
        assert_eq!(a.key_segment(), b.key_segment());
        assert_eq!(a.key_segment(), "owner_id=u1&status=active");
    }

    #[test]
    fn test_separators_inside_values_do_not_collide() {
        let keys = CacheKeys::new("app");

        let packed = ListQuery::new().where_eq("a", "1&b=2");
        let split = ListQuery::new().where_eq("a", "1").where_eq("b", "2");
        assert_ne!(keys.list("challenge", &packed), keys.list("challenge", &split));
        assert_eq!(packed.key_segment(), "a=1%26b%3D2");

        let id_like_list = keys.entity("challenge", "list/all");
        assert_ne!(id_like_list, keys.list("challenge", &ListQuery::new()));
        assert!(!id_like_list.starts_with(&keys.list_prefix("challenge")));
        assert_eq!(keys.entity("participant", "c1:u1"), "app/cache/participant/c1%3Au1");
    }

    #[test]
    fn test_query_matches_rows() {
        let q = ListQuery::new().where_eq("challenge_id", "c1").where_eq("steps", "10");
        assert!(q.matches(&json!({"challenge_id": "c1", "steps": 10})));
        assert!(!q.matches(&json!({"challenge_id": "c2", "steps": 10})));
        assert!(!q.matches(&json!({"steps": 10})));
        assert!(ListQuery::new().matches(&json!({})));
    }
}
