//! # Sync Queue
//!
//! Ordered, persisted list of pending mutations.
//!
//! ## Ownership
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncQueue                                       │
//! │                                                                         │
//! │  inner (tokio Mutex) ── ops in seq order + next_seq                    │
//! │     │   held across the SQLite write so append + persist is one unit   │
//! │     │   never held across a remote call                                 │
//! │     ▼                                                                   │
//! │  sync_operations table                                                  │
//! │                                                                         │
//! │  counts (std RwLock) ── cached QueueCounts, readable without awaiting  │
//! │  listeners ─────────── called after the mutex is released              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## State Machine
//! ```text
//!   pending ──claim──► in_flight ──ok──────────► completed
//!      ▲                  │
//!      │◄──── retryable ──┤
//!      │                  └──terminal──► failed ──discard_failed──► (deleted)
//!      └──────── reset_failed ◄────────────┘
//! ```
//!
//! An operation only runs once every older operation on its resource has
//! completed. A failed one holds the rest back until it is reset or discarded.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tether_core::{
    validate_payload, CoreResult, OperationKind, OperationState, QueueCounts, SyncOperation,
    SyncTable,
};
use tether_db::{CorruptOperation, SyncOperationRepository};

use crate::error::{SyncError, SyncResult};
use crate::events::{ListenerId, Observers};

/// What `load` found on disk.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// In-flight rows returned to pending (interrupted by a crash).
    pub requeued: u64,
    /// Rows that could not be decoded; now marked failed on disk.
    pub corrupt: Vec<CorruptOperation>,
}

/// Result of trying to take an operation for execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Now in flight.
    Acquired(SyncOperation),
    /// An older operation on the same resource is pending, in flight or
    /// failed, and must complete first.
    Blocked { blocking_id: String },
    /// Missing, not pending, or waiting out its backoff.
    Unavailable,
}

struct QueueInner {
    ops: Vec<SyncOperation>,
    next_seq: i64,
    /// Corrupt rows counted as failed but kept out of `ops`.
    quarantined: usize,
}

impl QueueInner {
    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::tally(&self.ops);
        counts.failed += self.quarantined;
        counts
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.ops.iter().position(|op| op.id == id)
    }
}

pub struct SyncQueue {
    repo: SyncOperationRepository,
    inner: Mutex<QueueInner>,
    counts: RwLock<QueueCounts>,
    listeners: Observers<QueueCounts>,
}

impl SyncQueue {
    pub fn new(repo: SyncOperationRepository) -> Self {
        SyncQueue {
            repo,
            inner: Mutex::new(QueueInner {
                ops: Vec::new(),
                next_seq: 1,
                quarantined: 0,
            }),
            counts: RwLock::new(QueueCounts::default()),
            listeners: Observers::new(),
        }
    }

    /// Reads the persisted queue, replacing anything held in memory.
    pub async fn load(&self) -> SyncResult<LoadReport> {
        let (counts, report) = {
            let mut inner = self.inner.lock().await;

            let requeued = self.repo.requeue_in_flight().await?;
            if requeued > 0 {
                info!(requeued, "Returned interrupted operations to pending");
            }

            let scan = self.repo.scan().await?;
            for bad in &scan.corrupt {
                warn!(op_id = %bad.id, seq = bad.seq, reason = %bad.reason, "Quarantining corrupt operation");
                self.repo.quarantine(&bad.id, &bad.reason).await?;
            }

            inner.next_seq = self.repo.max_seq().await? + 1;
            inner.ops = scan.operations;
            inner.quarantined = scan.corrupt.len();

            info!(
                operations = inner.ops.len(),
                corrupt = inner.quarantined,
                next_seq = inner.next_seq,
                "Sync queue loaded"
            );

            let counts = self.store_counts(&inner);
            (counts, LoadReport { requeued, corrupt: scan.corrupt })
        };

        self.listeners.emit(&counts);
        Ok(report)
    }

    /// Appends a pending operation. Durable before it returns.
    pub async fn enqueue(
        &self,
        table: SyncTable,
        kind: OperationKind,
        payload: Value,
    ) -> SyncResult<SyncOperation> {
        validate_payload(kind, &payload)?;

        let (op, counts) = {
            let mut inner = self.inner.lock().await;
            let op = SyncOperation::new(inner.next_seq, table, kind, payload);
            self.repo.insert(&op).await?;

            inner.next_seq += 1;
            inner.ops.push(op.clone());
            (op, self.store_counts(&inner))
        };

        debug!(
            op_id = %op.id,
            seq = op.seq,
            table = %op.table,
            kind = %op.kind,
            resource = ?op.resource_id,
            "Operation enqueued"
        );
        self.listeners.emit(&counts);
        Ok(op)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Every operation, oldest first.
    pub async fn get_all(&self) -> Vec<SyncOperation> {
        self.inner.lock().await.ops.clone()
    }

    pub async fn get(&self, id: &str) -> Option<SyncOperation> {
        let inner = self.inner.lock().await;
        inner.position(id).map(|i| inner.ops[i].clone())
    }

    /// Pending operations in seq order.
    pub async fn pending(&self) -> Vec<SyncOperation> {
        self.inner
            .lock()
            .await
            .ops
            .iter()
            .filter(|op| op.state == OperationState::Pending)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> QueueCounts {
        *self.counts.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pending plus in-flight.
    pub fn pending_count(&self) -> usize {
        self.counts().pending
    }

    pub fn failed_count(&self) -> usize {
        self.counts().failed
    }

    pub fn completed_count(&self) -> usize {
        self.counts().completed
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Takes a due pending operation if every older operation on the same
    /// resource has completed, and marks it in flight.
    pub async fn claim(&self, id: &str, now: DateTime<Utc>) -> SyncResult<Claim> {
        let (op, counts) = {
            let mut inner = self.inner.lock().await;
            let Some(index) = inner.position(id) else {
                return Ok(Claim::Unavailable);
            };
            if !inner.ops[index].is_due(now) {
                return Ok(Claim::Unavailable);
            }

            let key = inner.ops[index].resource_key();
            let blocker = inner.ops[..index]
                .iter()
                .find(|earlier| earlier.state.holds_resource() && earlier.resource_key() == key);
            if let Some(blocker) = blocker {
                return Ok(Claim::Blocked {
                    blocking_id: blocker.id.clone(),
                });
            }

            let mut op = inner.ops[index].clone();
            op.transition(OperationState::InFlight)?;
            op.attempted_at = Some(now);
            self.repo.update(&op).await?;
            inner.ops[index] = op.clone();
            (op, self.store_counts(&inner))
        };

        debug!(op_id = %op.id, attempt = op.attempts + 1, "Operation in flight");
        self.listeners.emit(&counts);
        Ok(Claim::Acquired(op))
    }

    pub async fn mark_in_flight(&self, id: &str) -> SyncResult<SyncOperation> {
        self.mutate(id, |op| {
            op.transition(OperationState::InFlight)?;
            op.attempted_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    pub async fn mark_completed(&self, id: &str) -> SyncResult<SyncOperation> {
        self.mutate(id, |op| {
            op.transition(OperationState::Completed)?;
            op.completed_at = Some(Utc::now());
            op.last_error = None;
            op.next_attempt_at = None;
            Ok(())
        })
        .await
    }

    /// Terminal failure. Counts the attempt.
    pub async fn mark_failed(&self, id: &str, error: &str) -> SyncResult<SyncOperation> {
        let error = error.to_string();
        self.mutate(id, move |op| {
            op.transition(OperationState::Failed)?;
            op.attempts += 1;
            op.last_error = Some(error);
            op.next_attempt_at = None;
            Ok(())
        })
        .await
    }

    /// Retryable failure: counts the attempt and returns the operation to
    /// pending, not due before `next_attempt_at`.
    pub async fn mark_retry(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> SyncResult<SyncOperation> {
        let error = error.to_string();
        self.mutate(id, move |op| {
            op.transition(OperationState::Pending)?;
            op.attempts += 1;
            op.last_error = Some(error);
            op.next_attempt_at = next_attempt_at;
            Ok(())
        })
        .await
    }

    /// Returns an in-flight operation to pending without counting the
    /// attempt. Used when connectivity dropped under the call.
    pub async fn release(&self, id: &str, error: &str) -> SyncResult<SyncOperation> {
        let error = error.to_string();
        self.mutate(id, move |op| {
            op.transition(OperationState::Pending)?;
            op.last_error = Some(error);
            op.next_attempt_at = None;
            Ok(())
        })
        .await
    }

    /// Returns every failed operation to pending. Attempts are kept.
    ///
    /// Stops at the first write that fails. Operations reset before it stay
    /// reset, and listeners still see the new counts.
    pub async fn reset_failed(&self) -> SyncResult<usize> {
        let (reset, outcome, counts) = {
            let mut inner = self.inner.lock().await;
            let mut reset = 0;
            let mut outcome = Ok(());
            for index in 0..inner.ops.len() {
                if inner.ops[index].state != OperationState::Failed {
                    continue;
                }
                let mut op = inner.ops[index].clone();
                op.next_attempt_at = None;
                let written = match op.transition(OperationState::Pending) {
                    Ok(()) => self.repo.update(&op).await.map_err(SyncError::from),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = written {
                    warn!(op_id = %op.id, error = %e, "Could not return failed operation to pending");
                    outcome = Err(e);
                    break;
                }
                inner.ops[index] = op;
                reset += 1;
            }
            (reset, outcome, self.store_counts(&inner))
        };

        if reset > 0 {
            info!(reset, "Failed operations returned to pending");
        }
        self.listeners.emit(&counts);
        outcome.map(|()| reset)
    }

    /// Deletes failed operations, quarantined rows included, from memory and
    /// storage. Later operations on the same resources can then run.
    pub async fn discard_failed(&self) -> SyncResult<u64> {
        let (removed, counts) = {
            let mut inner = self.inner.lock().await;
            let removed = self.repo.delete_failed().await?;
            inner.ops.retain(|op| op.state != OperationState::Failed);
            inner.quarantined = 0;
            (removed, self.store_counts(&inner))
        };

        if removed > 0 {
            warn!(removed, "Failed operations discarded");
        }
        self.listeners.emit(&counts);
        Ok(removed)
    }

    /// Deletes completed operations from memory and storage.
    pub async fn clear_completed(&self) -> SyncResult<u64> {
        let (removed, counts) = {
            let mut inner = self.inner.lock().await;
            let removed = self.repo.delete_completed().await?;
            inner.ops.retain(|op| op.state != OperationState::Completed);
            (removed, self.store_counts(&inner))
        };

        debug!(removed, "Completed operations cleared");
        self.listeners.emit(&counts);
        Ok(removed)
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Called with fresh counts after every mutation.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueCounts) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn mutate<F>(&self, id: &str, change: F) -> SyncResult<SyncOperation>
    where
        F: FnOnce(&mut SyncOperation) -> CoreResult<()>,
    {
        let (op, counts) = {
            let mut inner = self.inner.lock().await;
            let index = inner
                .position(id)
                .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))?;

            let mut op = inner.ops[index].clone();
            change(&mut op)?;
            self.repo.update(&op).await?;
            inner.ops[index] = op.clone();
            (op, self.store_counts(&inner))
        };

        debug!(op_id = %op.id, state = %op.state, attempts = op.attempts, "Operation updated");
        self.listeners.emit(&counts);
        Ok(op)
    }

    fn store_counts(&self, inner: &QueueInner) -> QueueCounts {
        let counts = inner.counts();
        *self.counts.write().unwrap_or_else(PoisonError::into_inner) = counts;
        counts
    }
}
