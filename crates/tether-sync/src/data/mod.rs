//! # Data Services
//!
//! Cache-first reads and optimistic writes, shared by every entity.
//!
//! ## Reads
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  fetch_with_cache(key, fetch, options)                                 │
//! │                                                                         │
//! │  cache hit, fresh (or use_stale) and not force_refresh                 │
//! │      └──► { data, from_cache: true, is_stale }                         │
//! │                                                                         │
//! │  offline ─────────────────────────────┐                                │
//! │  fetch() ── ok ──► cache with TTL     │                                │
//! │      │             { data, from_cache: false }                         │
//! │      └── err ─────────────────────────┴──► fallback                    │
//! │                                           { cached or None, error,     │
//! │                                             is_stale: true }           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Writes
//! ```text
//!   update:  cache ← merge(snapshot, patch) ─► enqueue + attempt
//!              Completed → Confirmed (server row cached)
//!              Failed    → Rejected, cache ← snapshot
//!              otherwise → Pending, optimistic value kept
//!
//!   insert:  enqueue + attempt ─► Confirmed | Rejected | Pending
//!   delete:  drop cached row ─► enqueue + attempt ─► Confirmed | Rejected | Pending
//! ```
//!
//! Offline and transient failures never surface as `Err`; only bad
//! arguments and local storage failures do.

pub mod activity;
pub mod challenge;
pub mod profile;

pub use activity::{Activity, ActivityService, ActivityUpdate, NewActivity};
pub use challenge::{Challenge, ChallengeService, ChallengeUpdate, NewChallenge, Participant};
pub use profile::{Profile, ProfileService, ProfileUpdate};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use tether_core::{
    merge_shallow, resource_id_of, validate_id, ListQuery, OperationKind, SyncTable,
};

use crate::cache::CachedValue;
use crate::config::TetherConfig;
use crate::error::{SyncError, SyncResult};
use crate::service::{AttemptOutcome, QueueOptions, SyncService};

// =============================================================================
// Entity Configuration
// =============================================================================

/// Where an entity lives remotely and in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityConfig {
    pub table: SyncTable,
    /// Cache key segment, e.g. `challenge`.
    pub entity: &'static str,
    pub default_ttl: Duration,
}

impl EntityConfig {
    pub fn for_table(table: SyncTable, config: &TetherConfig) -> Self {
        EntityConfig {
            table,
            entity: table.cache_entity(),
            default_ttl: config.ttl_for(table),
        }
    }
}

// =============================================================================
// Options and Envelopes
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip the cache and go to the backend.
    pub force_refresh: bool,
    /// Serve a stale cache entry without asking the backend.
    pub use_stale: bool,
}

impl FetchOptions {
    pub fn force_refresh() -> Self {
        FetchOptions {
            force_refresh: true,
            ..Default::default()
        }
    }

    pub fn use_stale() -> Self {
        FetchOptions {
            use_stale: true,
            ..Default::default()
        }
    }
}

/// Read envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DataResult<T> {
    pub data: Option<T>,
    pub error: Option<SyncError>,
    pub from_cache: bool,
    pub is_stale: bool,
}

impl<T> DataResult<T> {
    fn fresh(data: T) -> Self {
        DataResult {
            data: Some(data),
            error: None,
            from_cache: false,
            is_stale: false,
        }
    }

    fn cached(hit: CachedValue<T>) -> Self {
        DataResult {
            data: Some(hit.value),
            error: None,
            from_cache: true,
            is_stale: hit.is_stale,
        }
    }

    /// Any cached value, stale or not, with the error attached.
    fn fallback(cached: Option<CachedValue<T>>, error: SyncError) -> Self {
        let has_data = cached.is_some();
        DataResult {
            data: cached.map(|hit| hit.value),
            error: Some(error),
            from_cache: has_data,
            is_stale: has_data,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DataResult<U> {
        DataResult {
            data: self.data.map(f),
            error: self.error,
            from_cache: self.from_cache,
            is_stale: self.is_stale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// The backend accepted the write.
    Confirmed,
    /// Queued; the backend has not confirmed it yet.
    Pending,
    /// The backend refused it. The operation is marked failed.
    Rejected,
}

/// Write envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult<T> {
    pub data: Option<T>,
    pub error: Option<SyncError>,
    pub status: WriteStatus,
    pub operation_id: String,
    pub is_stale: bool,
}

impl WriteResult<Value> {
    /// Converts the row into an entity type.
    pub fn decode<T: DeserializeOwned>(self) -> WriteResult<T> {
        let data = self.data.and_then(|row| match serde_json::from_value(row) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(op_id = %self.operation_id, error = %e, "Row does not match entity shape");
                None
            }
        });
        WriteResult {
            data,
            error: self.error,
            status: self.status,
            operation_id: self.operation_id,
            is_stale: self.is_stale,
        }
    }
}

impl<T> WriteResult<T> {
    pub fn is_confirmed(&self) -> bool {
        self.status == WriteStatus::Confirmed
    }
}

// =============================================================================
// Data Service
// =============================================================================

/// Cache and queue plumbing for one entity.
#[derive(Clone)]
pub struct DataService {
    sync: SyncService,
    entity: EntityConfig,
}

impl DataService {
    pub fn new(sync: SyncService, table: SyncTable) -> Self {
        let entity = EntityConfig::for_table(table, sync.config());
        DataService { sync, entity }
    }

    pub fn entity(&self) -> &EntityConfig {
        &self.entity
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn key_for(&self, id: &str) -> String {
        self.sync.cache().keys().entity(self.entity.entity, id)
    }

    pub fn list_key(&self, query: &ListQuery) -> String {
        self.sync.cache().keys().list(self.entity.entity, query)
    }

    pub fn count_key(&self, query: &ListQuery) -> String {
        self.sync.cache().keys().count(self.entity.entity, query)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn fetch_with_cache<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: FetchOptions,
    ) -> DataResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let cache = self.sync.cache();

        let cached: Option<CachedValue<T>> = cache.get_with_metadata(key).await;
        let cached = match cached {
            Some(hit) if !options.force_refresh && (!hit.is_stale || options.use_stale) => {
                debug!(key = %key, stale = hit.is_stale, "Cache hit");
                return DataResult::cached(hit);
            }
            other => other,
        };

        if !self.sync.is_online() {
            debug!(key = %key, "Offline, serving cache fallback");
            return DataResult::fallback(cached, SyncError::Offline);
        }

        let timeout = self.sync.config().remote_timeout();
        let fetched = match tokio::time::timeout(timeout, fetch()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        match fetched {
            Ok(value) => {
                if let Err(e) = cache.set(key, &value, self.entity.default_ttl).await {
                    warn!(key = %key, error = %e, "Failed to cache fetched value");
                }
                DataResult::fresh(value)
            }
            Err(error) => {
                warn!(key = %key, error = %error, cached = cached.is_some(), "Fetch failed");
                DataResult::fallback(cached, error)
            }
        }
    }

    /// One row by id.
    pub async fn fetch_by_id<T>(&self, id: &str, options: FetchOptions) -> SyncResult<DataResult<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        validate_id(id)?;
        let table = self.entity.table;
        let remote = self.sync.remote();

        let result = self
            .fetch_with_cache(
                &self.key_for(id),
                || async move {
                    let rows = remote.select(table, &ListQuery::new().where_eq("id", id)).await?;
                    let row = rows
                        .into_iter()
                        .next()
                        .ok_or_else(|| SyncError::rejected("not_found", format!("{table} {id}")))?;
                    Ok(serde_json::from_value(row)?)
                },
                options,
            )
            .await;
        Ok(result)
    }

    /// Rows matching `query`, cached under the list key.
    pub async fn fetch_list<T>(&self, query: &ListQuery, options: FetchOptions) -> DataResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let table = self.entity.table;
        let remote = self.sync.remote();

        self.fetch_with_cache(
            &self.list_key(query),
            || async move {
                let rows = remote.select(table, query).await?;
                rows.into_iter()
                    .map(|row| serde_json::from_value(row).map_err(SyncError::from))
                    .collect()
            },
            options,
        )
        .await
    }

    /// Number of rows matching `query`, cached under the count key.
    pub async fn fetch_count(&self, query: &ListQuery, options: FetchOptions) -> DataResult<u64> {
        let table = self.entity.table;
        let remote = self.sync.remote();

        self.fetch_with_cache(
            &self.count_key(query),
            || async move {
                let rows = remote.select(table, query).await?;
                Ok(rows.len() as u64)
            },
            options,
        )
        .await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Applies `patch` to the cached row at once, then syncs it.
    pub async fn update_with_optimistic_cache(
        &self,
        id: &str,
        patch: Value,
    ) -> SyncResult<WriteResult<Value>> {
        validate_id(id)?;
        let mut fields = into_object(patch, "update patch")?;
        fields.insert("id".into(), Value::String(id.to_string()));
        let patch = Value::Object(fields);

        let cache = self.sync.cache();
        let key = self.key_for(id);
        let snapshot: Option<Value> = cache.get(&key).await;
        let optimistic = merge_shallow(snapshot.as_ref(), &patch);
        if let Err(e) = cache.set(&key, &optimistic, self.entity.default_ttl).await {
            warn!(key = %key, error = %e, "Optimistic cache write failed");
        }

        let queued = match self
            .sync
            .queue_operation(self.entity.table, OperationKind::Update, patch, QueueOptions::immediate())
            .await
        {
            Ok(queued) => queued,
            Err(e) => {
                self.restore(&key, snapshot.as_ref()).await;
                return Err(e);
            }
        };
        let operation_id = queued.operation.id;

        let result = match queued.outcome {
            AttemptOutcome::Completed(row) => WriteResult {
                data: Some(row.unwrap_or(optimistic)),
                error: None,
                status: WriteStatus::Confirmed,
                operation_id,
                is_stale: false,
            },
            AttemptOutcome::Failed(error) => {
                self.restore(&key, snapshot.as_ref()).await;
                WriteResult {
                    data: snapshot,
                    error: Some(error),
                    status: WriteStatus::Rejected,
                    operation_id,
                    is_stale: false,
                }
            }
            outcome => WriteResult {
                data: Some(optimistic),
                error: deferred_error(outcome),
                status: WriteStatus::Pending,
                operation_id,
                is_stale: true,
            },
        };

        debug!(id = %id, status = ?result.status, "Optimistic update");
        Ok(result)
    }

    /// Creates a row, assigning a client id when `data` has none.
    pub async fn insert_with_cache(&self, data: Value) -> SyncResult<WriteResult<Value>> {
        let mut fields = into_object(data, "insert data")?;
        if fields.get("id").and_then(resource_id_of).is_none() {
            fields.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        let data = Value::Object(fields);

        let queued = self
            .sync
            .queue_operation(self.entity.table, OperationKind::Insert, data.clone(), QueueOptions::immediate())
            .await?;
        let operation_id = queued.operation.id;

        let result = match queued.outcome {
            AttemptOutcome::Completed(row) => WriteResult {
                data: Some(row.unwrap_or(data)),
                error: None,
                status: WriteStatus::Confirmed,
                operation_id,
                is_stale: false,
            },
            AttemptOutcome::Failed(error) => WriteResult {
                data: Some(data),
                error: Some(error),
                status: WriteStatus::Rejected,
                operation_id,
                is_stale: true,
            },
            outcome => WriteResult {
                data: Some(data),
                error: deferred_error(outcome),
                status: WriteStatus::Pending,
                operation_id,
                is_stale: true,
            },
        };

        debug!(table = %self.entity.table, status = ?result.status, "Insert");
        Ok(result)
    }

    /// Drops the cached row at once, then syncs the delete. A delete that
    /// could not reach the backend is reported as pending, not as an error.
    pub async fn delete_with_cache(&self, id: &str) -> SyncResult<WriteResult<()>> {
        validate_id(id)?;

        let key = self.key_for(id);
        if let Err(e) = self.sync.cache().remove(&key).await {
            warn!(key = %key, error = %e, "Failed to drop cached row");
        }

        let queued = self
            .sync
            .queue_operation(self.entity.table, OperationKind::Delete, json!({ "id": id }), QueueOptions::immediate())
            .await?;
        let operation_id = queued.operation.id;

        let (status, error) = match queued.outcome {
            AttemptOutcome::Completed(_) => (WriteStatus::Confirmed, None),
            AttemptOutcome::Failed(error) => (WriteStatus::Rejected, Some(error)),
            _ => (WriteStatus::Pending, None),
        };

        debug!(id = %id, status = ?status, "Delete");
        Ok(WriteResult {
            data: None,
            error,
            status,
            operation_id,
            is_stale: false,
        })
    }

    async fn restore(&self, key: &str, snapshot: Option<&Value>) {
        let cache = self.sync.cache();
        let result = match snapshot {
            Some(value) => cache.set(key, value, self.entity.default_ttl).await,
            None => cache.remove(key).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(key = %key, error = %e, "Failed to revert optimistic cache entry");
        }
    }
}

fn into_object(value: Value, what: &str) -> SyncResult<Map<String, Value>> {
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(SyncError::Validation(format!(
            "{what} must be a JSON object, got {other}"
        ))),
    }
}

fn deferred_error(outcome: AttemptOutcome) -> Option<SyncError> {
    match outcome {
        AttemptOutcome::Deferred(error) => Some(error),
        _ => None,
    }
}

/// Serializes an entity struct for a write.
pub(crate) fn to_row<T: Serialize>(value: &T) -> SyncResult<Value> {
    Ok(serde_json::to_value(value)?)
}
