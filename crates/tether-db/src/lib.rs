//! # tether-db: Local Storage for Tether
//!
//! SQLite persistence for the cache and the sync queue, via sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CacheManager            SyncQueue                  (tether-sync)      │
//! │       │                      │                                          │
//! │       ▼                      ▼                                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tether-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌─────────────────────┐  ┌────────────┐ │   │
//! │  │   │   Database    │    │    Repositories     │  │ Migrations │ │   │
//! │  │   │   (pool.rs)   │◄───│  KvRepository       │  │ (embedded) │ │   │
//! │  │   │   SqlitePool  │    │  SyncOperationRepo  │  │            │ │   │
//! │  │   └───────────────┘    └─────────────────────┘  └────────────┘ │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL): kv_store, sync_operations                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/tether.db")).await?;
//! db.kv().set("app/cache/profile/u1", "{...}").await?;
//! let scan = db.operations().scan().await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig, DbLocation};

pub use repository::kv::KvRepository;
pub use repository::operations::{CorruptOperation, OperationScan, SyncOperationRepository};
