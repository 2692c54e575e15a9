//! # Database Handle
//!
//! ```text
//!  DbConfig::new(path) / DbConfig::in_memory()
//!       │
//!       ▼
//!  Database::new(config) ── open pool (WAL) ── apply migrations
//!       │
//!       ├── kv()          → KvRepository            (CacheManager)
//!       └── operations()  → SyncOperationRepository (SyncQueue)
//! ```
//!
//! WAL lets cache reads proceed while the queue is writing. The queue
//! itself serialises its writes, so a small pool is enough.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::kv::KvRepository;
use crate::repository::operations::SyncOperationRepository;

// =============================================================================
// Configuration
// =============================================================================

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    File(PathBuf),
    /// Private to one connection; gone when the pool closes.
    Memory,
}

/// ```rust,ignore
/// let config = DbConfig::new(data_dir.join("tether.db"))
///     .max_connections(2)
///     .busy_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub location: DbLocation,
    pub max_connections: u32,
    /// Acquire timeout for a pooled connection.
    pub acquire_timeout: Duration,
    /// How long SQLite waits on a locked file before returning `SQLITE_BUSY`.
    pub busy_timeout: Duration,
    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            location: DbLocation::File(path.into()),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    /// A throwaway store for tests and previews.
    ///
    /// Every in-memory connection is a separate database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub fn in_memory() -> Self {
        DbConfig {
            location: DbLocation::Memory,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(1),
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let base = match &self.location {
            DbLocation::Memory => SqliteConnectOptions::new().in_memory(true),
            DbLocation::File(path) => {
                ensure_parent_dir(path)?;
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
            }
        };

        Ok(base
            // Can drop the last commit on power loss, never corrupts.
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout))
    }
}

fn ensure_parent_dir(path: &Path) -> DbResult<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(DbError::open)
        }
        _ => Ok(()),
    }
}

// =============================================================================
// Database
// =============================================================================

/// Pool handle and repository factory. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(location = ?config.location, "Opening local store");

        let mut options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout);
        if config.location == DbLocation::Memory {
            options = options.min_connections(1).idle_timeout(None).max_lifetime(None);
        }

        let pool = options
            .connect_with(config.connect_options()?)
            .await
            .map_err(DbError::open)?;
        debug!(max_connections = config.max_connections, "Pool ready");

        let db = Database { pool };
        if config.run_migrations {
            migrations::run_migrations(&db.pool).await?;
        }
        Ok(db)
    }

    /// Raw pool, for diagnostics and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn kv(&self) -> KvRepository {
        KvRepository::new(self.pool.clone())
    }

    pub fn operations(&self) -> SyncOperationRepository {
        SyncOperationRepository::new(self.pool.clone())
    }

    /// Waits for checked-out connections, then closes. Repository calls
    /// fail with [`DbError::Closed`] afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Local store closed");
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_is_migrated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);

        let (total, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert!(total >= 1);
        assert_eq!(total, applied);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("data/tether.db")
            .max_connections(0)
            .busy_timeout(Duration::from_millis(250))
            .run_migrations(false);

        assert_eq!(config.location, DbLocation::File(PathBuf::from("data/tether.db")));
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert!(!config.run_migrations);
        assert_eq!(DbConfig::in_memory().location, DbLocation::Memory);
    }

    #[tokio::test]
    async fn test_closed_store_fails_health_check() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.close().await;
        assert!(!db.health_check().await);
        assert!(matches!(db.kv().get("k").await, Err(DbError::Closed)));
    }
}
