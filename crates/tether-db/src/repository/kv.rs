//! # Key/Value Repository
//!
//! Durable string store backing the cache manager. Values are opaque
//! here; the cache layer owns their JSON shape.
//!
//! Prefix matching uses `substr` rather than `LIKE` so `%` and `_` in
//! keys are matched literally.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Repository for the `kv_store` table.
#[derive(Debug, Clone)]
pub struct KvRepository {
    pool: SqlitePool,
}

impl KvRepository {
    pub fn new(pool: SqlitePool) -> Self {
        KvRepository { pool }
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Inserts or overwrites a value.
    pub async fn set(&self, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes a key. Returns true if it existed.
    pub async fn remove(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Lists keys starting with `prefix`, sorted.
    pub async fn keys(&self, prefix: &str) -> DbResult<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    /// Deletes every key starting with `prefix`. Returns the number removed.
    pub async fn remove_prefix(&self, prefix: &str) -> DbResult<u64> {
        let result =
            sqlx::query("DELETE FROM kv_store WHERE substr(key, 1, length(?1)) = ?1")
                .bind(prefix)
                .execute(&self.pool)
                .await?;

        debug!(prefix = %prefix, removed = result.rows_affected(), "Removed keys by prefix");
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let db = db().await;
        let kv = db.kv();

        assert_eq!(kv.get("a").await.unwrap(), None);
        kv.set("a", "1").await.unwrap();
        kv.set("a", "2").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("2"));

        assert!(kv.remove("a").await.unwrap());
        assert!(!kv.remove("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_prefix_is_literal() {
        let db = db().await;
        let kv = db.kv();

        kv.set("app/cache/challenge/c1", "{}").await.unwrap();
        kv.set("app/cache/challenge/list/all", "[]").await.unwrap();
        kv.set("app/cache/challenges_x", "{}").await.unwrap();
        kv.set("app/cache/ch%llenge/c2", "{}").await.unwrap();

        let keys = kv.keys("app/cache/challenge/").await.unwrap();
        assert_eq!(keys, vec!["app/cache/challenge/c1", "app/cache/challenge/list/all"]);

        // '%' is not a wildcard
        assert_eq!(kv.keys("app/cache/ch%").await.unwrap(), vec!["app/cache/ch%llenge/c2"]);

        assert_eq!(kv.remove_prefix("app/cache/challenge/").await.unwrap(), 2);
        assert_eq!(kv.keys("app/").await.unwrap().len(), 2);
    }
}
