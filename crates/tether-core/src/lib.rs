//! # tether-core: Pure Types for the Offline Cache and Sync Queue
//!
//! Everything here is deterministic and free of I/O: the queued operation
//! model and its state machine, cache entries and their staleness rule,
//! the cache key layout, payload validation, and the shallow merge used
//! for optimistic updates.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  tether-sync ───► tether-db ───► SQLite                                │
//! │       │               │                                                 │
//! │       └───────┬───────┘                                                 │
//! │               ▼                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 tether-core (THIS CRATE)                        │   │
//! │  │  SyncOperation · OperationState · CacheEntry · CacheKeys        │   │
//! │  │  QueueCounts · SyncStatusType · validation · merge_shallow      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tether_core::{CacheEntry, CacheKeys};
//!
//! let keys = CacheKeys::new("app");
//! let entry = CacheEntry::new(keys.entity("profile", "u1"), serde_json::json!({"id": "u1"}), Duration::from_secs(60));
//! assert!(!entry.is_stale_at(entry.stored_at));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache_key;
pub mod error;
pub mod patch;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache_key::{CacheKeys, ListQuery};
pub use error::{CoreError, CoreResult, ValidationError};
pub use patch::merge_shallow;
pub use types::*;
pub use validation::{resource_id_of, validate_id, validate_payload};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Attempts before a retryable failure becomes terminal.
pub const MAX_SYNC_ATTEMPTS: u32 = 5;
