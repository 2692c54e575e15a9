//! # Cache Manager
//!
//! TTL-tagged JSON entries on top of the durable key/value store.
//!
//! ## Read Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  get(key)                                                               │
//! │     │                                                                   │
//! │     ├── kv.get(key) fails ──────────► warn, treat as miss (None)       │
//! │     ├── no row ─────────────────────► None                              │
//! │     ├── row is not a CacheEntry ────► remove row, None                  │
//! │     └── entry ──────────────────────► value (fresh or stale)           │
//! │                                                                         │
//! │  Staleness is computed at read time: now - stored_at >= ttl.           │
//! │  Nothing is evicted because it is stale.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use tether_core::{CacheEntry, CacheKeys};
use tether_db::KvRepository;

use crate::error::SyncResult;

/// A cached value with its freshness at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
    pub value: T,
    pub is_stale: bool,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheManager {
    kv: KvRepository,
    keys: CacheKeys,
}

impl CacheManager {
    pub fn new(kv: KvRepository, keys: CacheKeys) -> Self {
        CacheManager { kv, keys }
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    async fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        let raw = match self.kv.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                if let Err(e) = self.kv.remove(key).await {
                    warn!(key = %key, error = %e, "Failed to remove undecodable cache entry");
                }
                None
            }
        }
    }

    /// Returns the value whether fresh or stale.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with_metadata(key).await.map(|cached| cached.value)
    }

    pub async fn get_with_metadata<T: DeserializeOwned>(&self, key: &str) -> Option<CachedValue<T>> {
        self.get_with_metadata_at(key, Utc::now()).await
    }

    /// Like [`get_with_metadata`](Self::get_with_metadata) with staleness
    /// judged at `now`.
    pub async fn get_with_metadata_at<T: DeserializeOwned>(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<CachedValue<T>> {
        let entry = self.read_entry(key).await?;
        let is_stale = entry.is_stale_at(now);
        let stored_at = entry.stored_at;

        match serde_json::from_value(entry.value) {
            Ok(value) => Some(CachedValue {
                value,
                is_stale,
                stored_at,
            }),
            Err(e) => {
                debug!(key = %key, error = %e, "Cached value does not match requested type");
                None
            }
        }
    }

    /// Overwrites the entry and resets its `stored_at`.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> SyncResult<()> {
        let entry = CacheEntry::new(key, serde_json::to_value(value)?, ttl);
        self.kv.set(key, &serde_json::to_string(&entry)?).await?;
        debug!(key = %key, ttl_ms = entry.ttl_ms, "Cache set");
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> SyncResult<bool> {
        Ok(self.kv.remove(key).await?)
    }

    /// Deletes every entry whose key starts with `prefix`.
    pub async fn clear_by_pattern(&self, prefix: &str) -> SyncResult<u64> {
        let removed = self.kv.remove_prefix(prefix).await?;
        debug!(prefix = %prefix, removed, "Cache cleared by pattern");
        Ok(removed)
    }

    /// Drops every list and count result cached for `entity`.
    pub async fn invalidate_lists(&self, entity: &str) -> SyncResult<u64> {
        let lists = self.kv.remove_prefix(&self.keys.list_prefix(entity)).await?;
        let counts = self.kv.remove_prefix(&self.keys.count_prefix(entity)).await?;
        debug!(entity = %entity, removed = lists + counts, "List caches invalidated");
        Ok(lists + counts)
    }

    /// Keys under `prefix`, sorted.
    pub async fn entries(&self, prefix: &str) -> SyncResult<Vec<String>> {
        Ok(self.kv.keys(prefix).await?)
    }

    /// Drops the whole namespace.
    pub async fn clear_all(&self) -> SyncResult<u64> {
        self.clear_by_pattern(&self.keys.root()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tether_core::ListQuery;
    use tether_db::{Database, DbConfig};

    async fn cache() -> (Database, CacheManager) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cache = CacheManager::new(db.kv(), CacheKeys::new("app"));
        (db, cache)
    }

    #[tokio::test]
    async fn test_set_get_and_staleness() {
        let (_db, cache) = cache().await;
        cache.set("app/cache/profile/u1", &json!({"name": "Ann"}), Duration::from_secs(60)).await.unwrap();

        let fresh: CachedValue<Value> = cache.get_with_metadata("app/cache/profile/u1").await.unwrap();
        assert!(!fresh.is_stale);
        assert_eq!(fresh.value, json!({"name": "Ann"}));

        let later = fresh.stored_at + chrono::Duration::seconds(60);
        let stale: CachedValue<Value> = cache.get_with_metadata_at("app/cache/profile/u1", later).await.unwrap();
        assert!(stale.is_stale);

        let just_before = fresh.stored_at + chrono::Duration::milliseconds(59_999);
        let still_fresh: CachedValue<Value> =
            cache.get_with_metadata_at("app/cache/profile/u1", just_before).await.unwrap();
        assert!(!still_fresh.is_stale);
    }

    #[tokio::test]
    async fn test_stale_entry_is_still_returned() {
        let (_db, cache) = cache().await;
        cache.set("app/cache/profile/u1", &json!(1), Duration::ZERO).await.unwrap();

        let cached: CachedValue<i64> = cache.get_with_metadata("app/cache/profile/u1").await.unwrap();
        assert!(cached.is_stale);
        assert_eq!(cache.get::<i64>("app/cache/profile/u1").await, Some(1));
    }

    #[tokio::test]
    async fn test_garbage_row_is_a_miss_and_removed() {
        let (db, cache) = cache().await;
        db.kv().set("app/cache/profile/u1", "not an entry").await.unwrap();

        assert_eq!(cache.get::<Value>("app/cache/profile/u1").await, None);
        assert_eq!(db.kv().get("app/cache/profile/u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_lists_keeps_rows() {
        let (_db, cache) = cache().await;
        let keys = cache.keys().clone();
        let ttl = Duration::from_secs(60);
        let query = ListQuery::new().where_eq("status", "active");

        cache.set(&keys.entity("challenge", "c1"), &json!({"id": "c1"}), ttl).await.unwrap();
        cache.set(&keys.list("challenge", &ListQuery::new()), &json!([]), ttl).await.unwrap();
        cache.set(&keys.list("challenge", &query), &json!([]), ttl).await.unwrap();
        cache.set(&keys.count("challenge", &query), &json!(0), ttl).await.unwrap();
        cache.set(&keys.list("activity", &ListQuery::new()), &json!([]), ttl).await.unwrap();

        assert_eq!(cache.invalidate_lists("challenge").await.unwrap(), 3);
        assert_eq!(
            cache.entries(&keys.root()).await.unwrap(),
            vec![
                "app/cache/activity/list/all".to_string(),
                "app/cache/challenge/c1".to_string(),
            ]
        );

        assert_eq!(cache.clear_all().await.unwrap(), 2);
    }
}
