//! # tether-sync: Offline Cache and Sync Engine
//!
//! Keeps an app usable without a connection: reads are served from a
//! TTL cache, writes are queued durably and replayed against the remote
//! backend when connectivity returns.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ProfileService  ChallengeService  ActivityService      (data::*)      │
//! │        └────────────────┼────────────────┘                              │
//! │                         ▼                                               │
//! │                   DataService ──── cache-first reads ───┐              │
//! │                         │         optimistic writes     │              │
//! │                         ▼                               ▼              │
//! │  ┌──────────────────────────────────────┐      ┌─────────────────┐     │
//! │  │             SyncService              │─────►│  CacheManager   │     │
//! │  │  queue_operation / sync / retry      │      │  (kv_store)     │     │
//! │  │  network flag, events, retry worker  │      └─────────────────┘     │
//! │  └──────┬──────────────────────┬────────┘                              │
//! │         ▼                      ▼                                        │
//! │  ┌─────────────┐      ┌─────────────────┐   ┌───────────────────────┐  │
//! │  │  SyncQueue  │      │  RemoteBackend  │   │  SyncStatusFacade     │  │
//! │  │ (sync_ops)  │      │  (trait)        │   │  badge + actions      │  │
//! │  └─────────────┘      └─────────────────┘   └───────────────────────┘  │
//! │                                                                         │
//! │  NetworkMonitor: watch<bool> ──► SyncService::apply_network_status     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`cache`] - TTL entries over the key/value store
//! - [`config`] - TOML + environment configuration
//! - [`data`] - Generic data service and per-entity services
//! - [`error`] - Sync error types
//! - [`events`] - Observer lists and service events
//! - [`network`] - Connectivity bridge
//! - [`queue`] - Persisted operation queue
//! - [`remote`] - Backend trait and in-memory backend
//! - [`retry`] - Attempt cap and exponential backoff
//! - [`service`] - The sync service
//! - [`status`] - Status badge and actions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_sync::{ChallengeService, InMemoryBackend, SyncService, TetherConfig};
//!
//! let config = TetherConfig::load_or_default(None);
//! let db = tether_db::Database::new(tether_db::DbConfig::new("tether.db")).await?;
//! let sync = SyncService::builder(config)
//!     .with_database(db)
//!     .with_remote(Arc::new(InMemoryBackend::new()))
//!     .build()?;
//! sync.initialize().await?;
//!
//! let challenges = ChallengeService::new(sync.clone());
//! let list = challenges.list_challenges(&Default::default(), Default::default()).await;
//! ```

pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod network;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod service;
pub mod status;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::{CacheManager, CachedValue};
pub use config::{AppSettings, CacheSettings, SyncSettings, TetherConfig};
pub use data::{
    Activity, ActivityService, ActivityUpdate, Challenge, ChallengeService, ChallengeUpdate,
    DataResult, DataService, EntityConfig, FetchOptions, NewActivity, NewChallenge, Participant,
    Profile, ProfileService, ProfileUpdate, WriteResult, WriteStatus,
};
pub use error::{SyncError, SyncResult};
pub use events::{ListenerId, Observers, SyncEvent};
pub use network::NetworkMonitor;
pub use queue::{Claim, LoadReport, SyncQueue};
pub use remote::{replay, InMemoryBackend, RemoteBackend, RemoteCall};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{
    AttemptOutcome, NetworkStatus, QueueOptions, QueuedOperation, SyncService,
    SyncServiceBuilder, SyncState, SyncSummary,
};
pub use status::{SyncStatusFacade, SyncStatusSnapshot};
