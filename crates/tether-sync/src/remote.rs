//! # Remote Backend
//!
//! The row store the queue replays against.
//!
//! ## Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       RemoteBackend (trait)                             │
//! │                                                                         │
//! │  select(table, query)      -> rows matching every equality filter      │
//! │  insert(table, row)        -> the stored row (server may add fields)   │
//! │  update(table, id, patch)  -> the stored row after the patch           │
//! │  delete(table, id)         -> ()                                        │
//! │                                                                         │
//! │  Errors: Network / Timeout  -> transient, the operation is retried     │
//! │          Rejected           -> terminal for that operation             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`InMemoryBackend`] is a scriptable implementation used by tests, the
//! CLI demo and anyone embedding the engine without a server.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use tether_core::{merge_shallow, resource_id_of, ListQuery, OperationKind, SyncOperation, SyncTable};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Backend Trait
// =============================================================================

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn select(&self, table: SyncTable, query: &ListQuery) -> SyncResult<Vec<Value>>;

    async fn insert(&self, table: SyncTable, row: &Value) -> SyncResult<Value>;

    async fn update(&self, table: SyncTable, id: &str, patch: &Value) -> SyncResult<Value>;

    async fn delete(&self, table: SyncTable, id: &str) -> SyncResult<()>;
}

/// Executes one queued operation against the backend.
///
/// Returns the server's row for inserts and updates, `None` for deletes.
pub async fn replay(remote: &dyn RemoteBackend, op: &SyncOperation) -> SyncResult<Option<Value>> {
    match op.kind {
        OperationKind::Insert => remote.insert(op.table, &op.payload).await.map(Some),
        OperationKind::Update => {
            let id = require_resource_id(op)?;
            remote.update(op.table, id, &op.payload).await.map(Some)
        }
        OperationKind::Delete => {
            let id = require_resource_id(op)?;
            remote.delete(op.table, id).await.map(|_| None)
        }
    }
}

fn require_resource_id(op: &SyncOperation) -> SyncResult<&str> {
    op.resource_id.as_deref().ok_or_else(|| {
        SyncError::InvalidOperation(format!("{} {} has no resource id", op.kind, op.id))
    })
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// One call observed by [`InMemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteCall {
    pub table: SyncTable,
    pub action: &'static str,
    /// Row id for insert/update/delete, `None` for select.
    pub id: Option<String>,
}

#[derive(Default)]
struct BackendState {
    tables: HashMap<SyncTable, BTreeMap<String, Value>>,
    online: bool,
    failures: VecDeque<SyncError>,
    calls: Vec<RemoteCall>,
    latency: Option<Duration>,
}

/// Row store kept in memory, with switchable connectivity and scripted
/// failures.
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend {
            state: Mutex::new(BackendState {
                online: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While offline every call fails with a network error.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Queues an error returned by the next call instead of its result.
    pub fn fail_next(&self, error: SyncError) {
        self.lock().failures.push_back(error);
    }

    /// Delay applied to every call before it completes.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Stores a row directly, bypassing the call log.
    pub fn seed(&self, table: SyncTable, row: Value) {
        if let Some(id) = resource_id_of(&row) {
            self.lock().tables.entry(table).or_default().insert(id, row);
        }
    }

    pub fn rows(&self, table: SyncTable) -> Vec<Value> {
        self.lock()
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: SyncTable, id: &str) -> Option<Value> {
        self.lock().tables.get(&table).and_then(|rows| rows.get(id).cloned())
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Number of mutating calls (everything except select).
    pub fn write_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.action != "select").count()
    }

    /// Records the call, sleeps for the configured latency, then reports
    /// whether it should fail.
    async fn begin(&self, table: SyncTable, action: &'static str, id: Option<String>) -> SyncResult<()> {
        let latency = {
            let mut state = self.lock();
            state.calls.push(RemoteCall { table, action, id });
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if !state.online {
            return Err(SyncError::network("backend unreachable"));
        }
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn select(&self, table: SyncTable, query: &ListQuery) -> SyncResult<Vec<Value>> {
        self.begin(table, "select", None).await?;

        let rows: Vec<Value> = self
            .rows(table)
            .into_iter()
            .filter(|row| query.matches(row))
            .collect();
        debug!(table = %table, filter = %query.key_segment(), rows = rows.len(), "select");
        Ok(rows)
    }

    async fn insert(&self, table: SyncTable, row: &Value) -> SyncResult<Value> {
        let mut stored = row.clone();
        let id = match resource_id_of(row) {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Value::Object(map) = &mut stored {
                    map.insert("id".into(), Value::String(id.clone()));
                }
                id
            }
        };

        self.begin(table, "insert", Some(id.clone())).await?;

        let mut state = self.lock();
        let rows = state.tables.entry(table).or_default();
        if rows.contains_key(&id) {
            return Err(SyncError::rejected("conflict", format!("{table} {id} already exists")));
        }
        rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, table: SyncTable, id: &str, patch: &Value) -> SyncResult<Value> {
        self.begin(table, "update", Some(id.to_string())).await?;

        let mut state = self.lock();
        let rows = state.tables.entry(table).or_default();
        let current = rows
            .get(id)
            .ok_or_else(|| SyncError::rejected("not_found", format!("{table} {id}")))?;
        let merged = merge_shallow(Some(current), patch);
        rows.insert(id.to_string(), merged.clone());
        Ok(merged)
    }

    async fn delete(&self, table: SyncTable, id: &str) -> SyncResult<()> {
        self.begin(table, "delete", Some(id.to_string())).await?;

        if let Some(rows) = self.lock().tables.get_mut(&table) {
            rows.remove(id);
        }
        Ok(())
    }
}
