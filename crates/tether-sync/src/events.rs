//! # Sync Events
//!
//! Synchronous observer lists for queue and service events.
//!
//! ```text
//!   emit(event)
//!       │
//!       ├── snapshot listeners (read lock, cloned Arcs)
//!       │
//!       └── call each in registration order, lock released
//! ```
//!
//! Listeners may subscribe or unsubscribe from inside a callback; the
//! change applies from the next emit.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tether_core::{QueueCounts, SyncOperation};

// =============================================================================
// Observer List
// =============================================================================

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered listener registry for events of type `E`.
pub struct Observers<E> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Observers {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the listener was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Service Events
// =============================================================================

/// Lifecycle events emitted by the sync service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStart,
    SyncComplete { processed: usize, failed: usize },
    SyncError { error: String },
    OperationComplete { operation: SyncOperation },
    /// Terminal failure. Retryable failures stay queued and emit nothing.
    OperationFailed { operation: SyncOperation, error: String },
    /// A persisted row could not be decoded and was quarantined.
    OperationCorrupt { id: String, error: String },
    QueueChanged { counts: QueueCounts },
    NetworkChanged { is_online: bool },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStart => "sync_start",
            SyncEvent::SyncComplete { .. } => "sync_complete",
            SyncEvent::SyncError { .. } => "sync_error",
            SyncEvent::OperationComplete { .. } => "operation_complete",
            SyncEvent::OperationFailed { .. } => "operation_failed",
            SyncEvent::OperationCorrupt { .. } => "operation_corrupt",
            SyncEvent::QueueChanged { .. } => "queue_changed",
            SyncEvent::NetworkChanged { .. } => "network_changed",
        }
    }
}
