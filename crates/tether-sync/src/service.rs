//! # Sync Service
//!
//! Drives the queue against the remote backend.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncServiceBuilder::new(config)                                       │
//! │      .with_database(db)                                                 │
//! │      .with_remote(backend)                                              │
//! │      .build()?                    ──► SyncService (cheap to clone)     │
//! │                                                                         │
//! │  initialize()   load queue, report corrupt rows, start retry worker,   │
//! │                 startup drain if online                                 │
//! │  shutdown()     refuse new work, stop the retry worker                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## One Attempt
//! ```text
//!   claim ──► in_flight ──► replay (bounded by remote_timeout)
//!                              │
//!          ┌───────────────────┼───────────────────────────┐
//!          ▼                   ▼                           ▼
//!       success          retryable error             terminal error
//!     completed,        offline now? release       failed, drop cached
//!   reconcile cache     else pending + backoff       row, operation_failed
//!  operation_complete   (failed once exhausted)
//! ```
//!
//! Every path that executes an operation, the inline attempt of an
//! immediate write and the drain alike, goes through the same attempt.
//!
//! ## Drain
//! Pending operations are taken in seq order. A resource whose operation
//! failed, was deferred or is waiting out its backoff is skipped for the
//! rest of the drain so later operations on it never overtake. Going
//! offline stops the drain before the next remote call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tether_core::{resource_id_of, CacheKeys, OperationKind, SyncOperation, SyncTable};
use tether_db::Database;

use crate::cache::CacheManager;
use crate::config::TetherConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{ListenerId, Observers, SyncEvent};
use crate::queue::{Claim, SyncQueue};
use crate::remote::{replay, RemoteBackend};
use crate::retry::{RetryDecision, RetryPolicy};

// =============================================================================
// Public Types
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Attempt the operation inline right after enqueueing it.
    pub immediate: bool,
}

impl QueueOptions {
    pub fn immediate() -> Self {
        QueueOptions { immediate: true }
    }
}

/// What happened to one operation on one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The backend accepted it. Carries the server row for insert/update.
    Completed(Option<Value>),
    /// Transient failure; still queued.
    Deferred(SyncError),
    /// Terminal failure; marked failed.
    Failed(SyncError),
    /// An older operation on the same resource is unsettled.
    Blocked,
    /// Not attempted: not immediate, already taken, or not yet due.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub operation: SyncOperation,
    pub outcome: AttemptOutcome,
}

/// Result of one `sync()` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSummary {
    pub success: bool,
    pub processed: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Another drain was running; this call did nothing.
    pub already_running: bool,
    /// Stopped early by going offline or shutting down.
    pub interrupted: bool,
    pub error: Option<SyncError>,
}

impl SyncSummary {
    fn skipped(error: SyncError) -> Self {
        SyncSummary {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Process-wide sync state, derived on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pending_count: usize,
    pub failed_count: usize,
    pub completed_count: usize,
}

/// Connectivity report from the platform's network observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub is_connected: bool,
}

// =============================================================================
// Internals
// =============================================================================

#[derive(Debug, Default)]
struct SyncMeta {
    last_synced_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct RetryWorker {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct ServiceInner {
    queue: SyncQueue,
    cache: CacheManager,
    remote: Arc<dyn RemoteBackend>,
    config: Arc<TetherConfig>,
    retry: RetryPolicy,
    events: Arc<Observers<SyncEvent>>,

    is_online: AtomicBool,
    is_syncing: AtomicBool,
    initialized: AtomicBool,
    shutting_down: AtomicBool,

    meta: RwLock<SyncMeta>,
    /// Also serializes initialize/shutdown.
    worker: Mutex<Option<RetryWorker>>,
}

/// Clears the syncing flag however the drain exits.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct DrainReport {
    processed: usize,
    failed: usize,
    deferred: usize,
    interrupted: Option<SyncError>,
    last_error: Option<SyncError>,
}

// =============================================================================
// Builder
// =============================================================================

type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

pub struct SyncServiceBuilder {
    config: TetherConfig,
    database: Option<Database>,
    remote: Option<Arc<dyn RemoteBackend>>,
    online: bool,
    listeners: Vec<EventListener>,
}

impl SyncServiceBuilder {
    pub fn new(config: TetherConfig) -> Self {
        SyncServiceBuilder {
            config,
            database: None,
            remote: None,
            online: true,
            listeners: Vec::new(),
        }
    }

    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Initial connectivity. Defaults to online.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Registers a listener before any event can fire.
    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
        self
    }

    pub fn build(self) -> SyncResult<SyncService> {
        self.config.validate()?;

        let database = self
            .database
            .ok_or_else(|| SyncError::InvalidConfig("a database is required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("a remote backend is required".into()))?;

        let events: Arc<Observers<SyncEvent>> = Arc::new(Observers::new());
        for listener in self.listeners {
            events.subscribe(listener);
        }

        let queue = SyncQueue::new(database.operations());
        let forward = Arc::clone(&events);
        queue.subscribe(move |counts| forward.emit(&SyncEvent::QueueChanged { counts: *counts }));

        let cache = CacheManager::new(database.kv(), CacheKeys::new(self.config.app.namespace.clone()));

        Ok(SyncService {
            inner: Arc::new(ServiceInner {
                queue,
                cache,
                remote,
                retry: RetryPolicy::from_settings(&self.config.sync),
                config: Arc::new(self.config),
                events,
                is_online: AtomicBool::new(self.online),
                is_syncing: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                meta: RwLock::new(SyncMeta::default()),
                worker: Mutex::new(None),
            }),
        })
    }
}

// =============================================================================
// Sync Service
// =============================================================================

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl SyncService {
    pub fn builder(config: TetherConfig) -> SyncServiceBuilder {
        SyncServiceBuilder::new(config)
    }

    /// Loads the persisted queue and starts the retry worker. Idempotent.
    pub async fn initialize(&self) -> SyncResult<()> {
        {
            let mut worker = self.inner.worker.lock().await;
            if self.inner.shutting_down.load(Ordering::Acquire) {
                return Err(SyncError::ShuttingDown);
            }
            if self.inner.initialized.load(Ordering::Acquire) {
                return Ok(());
            }

            let report = self.inner.queue.load().await?;
            for bad in report.corrupt {
                self.inner.events.emit(&SyncEvent::OperationCorrupt {
                    id: bad.id,
                    error: bad.reason,
                });
            }

            *worker = Some(self.spawn_retry_worker());
            self.inner.initialized.store(true, Ordering::Release);

            let counts = self.inner.queue.counts();
            info!(
                pending = counts.pending,
                failed = counts.failed,
                online = self.is_online(),
                "Sync service initialized"
            );
        }

        if self.inner.config.sync.sync_on_startup
            && self.is_online()
            && self.inner.queue.pending_count() > 0
        {
            let summary = self.sync().await;
            debug!(processed = summary.processed, failed = summary.failed, "Startup sync finished");
        }

        Ok(())
    }

    /// Refuses new work and stops the retry worker. A running drain stops
    /// before its next remote call.
    pub async fn shutdown(&self) {
        let mut worker = self.inner.worker.lock().await;
        self.inner.shutting_down.store(true, Ordering::Release);

        if let Some(RetryWorker { shutdown_tx, handle }) = worker.take() {
            let _ = shutdown_tx.send(()).await;
            if let Err(e) = handle.await {
                warn!(error = %e, "Retry worker did not stop cleanly");
            }
        }
        info!("Sync service shut down");
    }

    fn ensure_ready(&self) -> SyncResult<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(SyncError::ShuttingDown);
        }
        if !self.inner.initialized.load(Ordering::Acquire) {
            return Err(SyncError::NotInitialized);
        }
        Ok(())
    }

    // =========================================================================
    // Queueing
    // =========================================================================

    /// Enqueues a mutation, then optionally attempts it inline.
    ///
    /// Only enqueue failures are errors; a failed inline attempt is
    /// reported through the outcome.
    pub async fn queue_operation(
        &self,
        table: SyncTable,
        kind: OperationKind,
        payload: Value,
        options: QueueOptions,
    ) -> SyncResult<QueuedOperation> {
        self.ensure_ready()?;

        let operation = self.inner.queue.enqueue(table, kind, payload).await?;

        let outcome = if !options.immediate {
            AttemptOutcome::NotAttempted
        } else if !self.is_online() {
            debug!(op_id = %operation.id, "Offline, operation left queued");
            AttemptOutcome::Deferred(SyncError::Offline)
        } else {
            match self.attempt(&operation.id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(op_id = %operation.id, error = %e, "Inline attempt failed locally");
                    AttemptOutcome::Deferred(e)
                }
            }
        };

        Ok(QueuedOperation { operation, outcome })
    }

    /// Claims and executes a single operation.
    async fn attempt(&self, id: &str) -> SyncResult<AttemptOutcome> {
        let inner = &self.inner;

        let op = match inner.queue.claim(id, Utc::now()).await? {
            Claim::Acquired(op) => op,
            Claim::Blocked { blocking_id } => {
                debug!(op_id = %id, blocked_by = %blocking_id, "Operation waits for an older one");
                return Ok(AttemptOutcome::Blocked);
            }
            Claim::Unavailable => return Ok(AttemptOutcome::NotAttempted),
        };

        let timeout = inner.config.remote_timeout();
        let result = match tokio::time::timeout(timeout, replay(inner.remote.as_ref(), &op)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        let error = match result {
            Ok(row) => {
                let completed = inner.queue.mark_completed(&op.id).await?;
                self.reconcile_cache(&completed, row.as_ref()).await;
                info!(
                    op_id = %completed.id,
                    table = %completed.table,
                    kind = %completed.kind,
                    "Operation synced"
                );
                inner.events.emit(&SyncEvent::OperationComplete { operation: completed });
                return Ok(AttemptOutcome::Completed(row));
            }
            Err(error) => error,
        };

        if error.is_retryable() && !self.is_online() {
            inner.queue.release(&op.id, &error.to_string()).await?;
            debug!(op_id = %op.id, error = %error, "Connectivity lost, operation released");
            return Ok(AttemptOutcome::Deferred(error));
        }

        match inner.retry.decide(&error, op.attempts + 1, Utc::now()) {
            RetryDecision::RetryAt(at) => {
                let op = inner.queue.mark_retry(&op.id, &error.to_string(), Some(at)).await?;
                warn!(
                    op_id = %op.id,
                    attempts = op.attempts,
                    retry_at = %at,
                    error = %error,
                    "Operation deferred"
                );
                Ok(AttemptOutcome::Deferred(error))
            }
            RetryDecision::GiveUp => {
                let failed = inner.queue.mark_failed(&op.id, &error.to_string()).await?;
                error!(
                    op_id = %failed.id,
                    attempts = failed.attempts,
                    error = %error,
                    "Operation failed"
                );
                self.discard_cached_row(&failed).await;
                self.record_error(Some(&error));
                inner.events.emit(&SyncEvent::OperationFailed {
                    operation: failed,
                    error: error.to_string(),
                });
                Ok(AttemptOutcome::Failed(error))
            }
        }
    }

    /// Writes the server's row into the cache and drops stale list results.
    async fn reconcile_cache(&self, op: &SyncOperation, row: Option<&Value>) {
        let cache = &self.inner.cache;
        let entity = op.table.cache_entity();
        let id = row.and_then(resource_id_of).or_else(|| op.resource_id.clone());

        let result: SyncResult<()> = async {
            match (op.kind, id, row) {
                (OperationKind::Delete, Some(id), _) => {
                    cache.remove(&cache.keys().entity(entity, &id)).await?;
                }
                (_, Some(id), Some(row)) => {
                    let ttl = self.inner.config.ttl_for(op.table);
                    cache.set(&cache.keys().entity(entity, &id), row, ttl).await?;
                }
                _ => {}
            }
            cache.invalidate_lists(entity).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(op_id = %op.id, error = %e, "Cache reconcile failed");
        }
    }

    /// After a terminal failure the cached row may hold an unconfirmed
    /// value; drop it so the next read goes to the backend.
    async fn discard_cached_row(&self, op: &SyncOperation) {
        let Some(id) = &op.resource_id else { return };
        let cache = &self.inner.cache;
        let key = cache.keys().entity(op.table.cache_entity(), id);
        if let Err(e) = cache.remove(&key).await {
            warn!(op_id = %op.id, error = %e, "Failed to drop cached row");
        }
    }

    // =========================================================================
    // Draining
    // =========================================================================

    /// Drains pending operations in order. Never runs two drains at once.
    pub async fn sync(&self) -> SyncSummary {
        let inner = &self.inner;

        if let Err(e) = self.ensure_ready() {
            return SyncSummary::skipped(e);
        }
        if !self.is_online() {
            debug!("Offline, sync skipped");
            return SyncSummary::skipped(SyncError::Offline);
        }
        if inner
            .is_syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already running");
            return SyncSummary {
                already_running: true,
                ..Default::default()
            };
        }

        let report = {
            let _syncing = SyncingGuard(&inner.is_syncing);
            inner.events.emit(&SyncEvent::SyncStart);
            info!(pending = inner.queue.pending_count(), "Sync started");
            self.drain().await
        };

        let error = report.interrupted.clone().or_else(|| report.last_error.clone());
        if report.interrupted.is_none() {
            inner.meta.write().unwrap_or_else(PoisonError::into_inner).last_synced_at = Some(Utc::now());
        }
        self.record_error(error.as_ref());

        match &report.interrupted {
            Some(reason) => {
                warn!(processed = report.processed, reason = %reason, "Sync interrupted");
                inner.events.emit(&SyncEvent::SyncError {
                    error: reason.to_string(),
                });
            }
            None => {
                info!(
                    processed = report.processed,
                    failed = report.failed,
                    deferred = report.deferred,
                    "Sync complete"
                );
                inner.events.emit(&SyncEvent::SyncComplete {
                    processed: report.processed,
                    failed: report.failed,
                });
            }
        }

        SyncSummary {
            success: report.interrupted.is_none() && report.failed == 0 && report.deferred == 0,
            processed: report.processed,
            failed: report.failed,
            deferred: report.deferred,
            already_running: false,
            interrupted: report.interrupted.is_some(),
            error,
        }
    }

    /// Sets the error shown by `state()`. Clearing is ignored while failed
    /// operations remain, so an earlier failure stays visible.
    fn record_error(&self, error: Option<&SyncError>) {
        let mut meta = self.inner.meta.write().unwrap_or_else(PoisonError::into_inner);
        match error {
            Some(e) => meta.last_error = Some(e.to_string()),
            None if self.inner.queue.failed_count() > 0 => {}
            None => meta.last_error = None,
        }
    }

    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let now = Utc::now();

        for op in self.inner.queue.pending().await {
            if self.inner.shutting_down.load(Ordering::Acquire) {
                report.interrupted = Some(SyncError::ShuttingDown);
                break;
            }
            if !self.is_online() {
                report.interrupted = Some(SyncError::Offline);
                break;
            }

            let key = op.resource_key();
            if blocked.contains(&key) {
                continue;
            }
            if !op.is_due(now) {
                blocked.insert(key);
                continue;
            }

            match self.attempt(&op.id).await {
                Ok(AttemptOutcome::Completed(_)) => report.processed += 1,
                Ok(AttemptOutcome::NotAttempted) => {}
                Ok(AttemptOutcome::Blocked) => {
                    blocked.insert(key);
                }
                Ok(AttemptOutcome::Deferred(e)) => {
                    report.deferred += 1;
                    report.last_error = Some(e);
                    blocked.insert(key);
                }
                Ok(AttemptOutcome::Failed(e)) => {
                    report.failed += 1;
                    report.last_error = Some(e);
                    blocked.insert(key);
                }
                Err(e) => {
                    error!(op_id = %op.id, error = %e, "Operation could not be processed");
                    report.failed += 1;
                    report.last_error = Some(e);
                    blocked.insert(key);
                }
            }
        }

        report
    }

    /// Returns failed operations to pending, then drains.
    pub async fn retry_failed(&self) -> SyncResult<SyncSummary> {
        self.ensure_ready()?;
        let reset = self.inner.queue.reset_failed().await?;
        debug!(reset, "Retrying failed operations");
        Ok(self.sync().await)
    }

    pub async fn clear_completed(&self) -> SyncResult<u64> {
        self.inner.queue.clear_completed().await
    }

    /// Deletes failed operations and quarantined rows for good. Later
    /// operations they were holding back become eligible again.
    pub async fn discard_failed(&self) -> SyncResult<u64> {
        self.ensure_ready()?;
        let removed = self.inner.queue.discard_failed().await?;
        self.record_error(None);
        info!(removed, "Failed operations discarded");
        Ok(removed)
    }

    fn spawn_retry_worker(&self) -> RetryWorker {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let service: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.retry_poll_interval();

        let handle = tokio::spawn(async move {
            debug!(period_secs = period.as_secs(), "Retry worker started");
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(inner) = service.upgrade() else { break };
                        let service = SyncService { inner };
                        if service.is_online() && service.inner.queue.pending_count() > 0 {
                            let summary = service.sync().await;
                            debug!(processed = summary.processed, deferred = summary.deferred, "Retry pass finished");
                        }
                    }

                    _ = shutdown_rx.recv() => break,
                }
            }

            debug!("Retry worker stopped");
        });

        RetryWorker { shutdown_tx, handle }
    }

    // =========================================================================
    // Network
    // =========================================================================

    /// Records connectivity. Returns true on an offline to online edge.
    pub fn apply_network_status(&self, is_connected: bool) -> bool {
        let was_online = self.inner.is_online.swap(is_connected, Ordering::AcqRel);
        if was_online != is_connected {
            info!(online = is_connected, "Network status changed");
            self.inner.events.emit(&SyncEvent::NetworkChanged {
                is_online: is_connected,
            });
        }
        !was_online && is_connected
    }

    /// Records connectivity and drains on reconnect when work is queued.
    pub async fn set_network_status(&self, status: NetworkStatus) -> Option<SyncSummary> {
        if self.apply_network_status(status.is_connected) && self.inner.queue.pending_count() > 0 {
            Some(self.sync().await)
        } else {
            None
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_online(&self) -> bool {
        self.inner.is_online.load(Ordering::Acquire)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.is_syncing.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SyncState {
        let counts = self.inner.queue.counts();
        let meta = self.inner.meta.read().unwrap_or_else(PoisonError::into_inner);
        SyncState {
            is_online: self.is_online(),
            is_syncing: self.is_syncing(),
            last_synced_at: meta.last_synced_at,
            last_error: meta.last_error.clone(),
            pending_count: counts.pending,
            failed_count: counts.failed,
            completed_count: counts.completed,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    pub fn cache(&self) -> &CacheManager {
        &self.inner.cache
    }

    pub fn remote(&self) -> &Arc<dyn RemoteBackend> {
        &self.inner.remote
    }

    pub fn config(&self) -> &TetherConfig {
        &self.inner.config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryBackend;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tether_core::OperationState;
    use tether_db::DbConfig;

    struct Harness {
        service: SyncService,
        backend: Arc<InMemoryBackend>,
        events: Arc<StdMutex<Vec<&'static str>>>,
    }

    async fn harness(online: bool) -> Harness {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let service = SyncService::builder(TetherConfig::default())
            .with_database(db)
            .with_remote(backend.clone())
            .online(online)
            .with_listener(move |event| {
                if !matches!(event, SyncEvent::QueueChanged { .. }) {
                    sink.lock().unwrap().push(event.name());
                }
            })
            .build()
            .unwrap();
        service.initialize().await.unwrap();

        Harness { service, backend, events }
    }

    #[tokio::test]
    async fn test_builder_requires_database() {
        let err = SyncService::builder(TetherConfig::default())
            .with_remote(Arc::new(InMemoryBackend::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_queue_operation_requires_initialize() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let service = SyncService::builder(TetherConfig::default())
            .with_database(db)
            .with_remote(Arc::new(InMemoryBackend::new()))
            .build()
            .unwrap();

        let err = service
            .queue_operation(SyncTable::Profiles, OperationKind::Delete, json!("u1"), QueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::NotInitialized);
    }

    #[tokio::test]
    async fn test_immediate_success_completes_and_caches() {
        let h = harness(true).await;
        h.backend.seed(SyncTable::Profiles, json!({"id": "u1", "name": "Ann"}));

        let queued = h
            .service
            .queue_operation(
                SyncTable::Profiles,
                OperationKind::Update,
                json!({"id": "u1", "name": "Bo"}),
                QueueOptions::immediate(),
            )
            .await
            .unwrap();

        assert_eq!(
            queued.outcome,
            AttemptOutcome::Completed(Some(json!({"id": "u1", "name": "Bo"})))
        );
        assert_eq!(h.service.state().completed_count, 1);

        let key = h.service.cache().keys().entity("profile", "u1");
        assert_eq!(h.service.cache().get::<Value>(&key).await, Some(json!({"id": "u1", "name": "Bo"})));
        assert_eq!(*h.events.lock().unwrap(), vec!["operation_complete"]);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal() {
        let h = harness(true).await;

        let queued = h
            .service
            .queue_operation(
                SyncTable::Challenges,
                OperationKind::Update,
                json!({"id": "missing", "title": "x"}),
                QueueOptions::immediate(),
            )
            .await
            .unwrap();

        assert!(matches!(queued.outcome, AttemptOutcome::Failed(SyncError::Rejected { .. })));
        let op = h.service.queue().get(&queued.operation.id).await.unwrap();
        assert_eq!(op.state, OperationState::Failed);
        assert_eq!(op.attempts, 1);
        assert_eq!(*h.events.lock().unwrap(), vec!["operation_failed"]);
    }

    #[tokio::test]
    async fn test_network_error_defers_with_backoff() {
        let h = harness(true).await;
        h.backend.fail_next(SyncError::network("reset"));

        let queued = h
            .service
            .queue_operation(SyncTable::Activities, OperationKind::Delete, json!("a1"), QueueOptions::immediate())
            .await
            .unwrap();

        assert!(matches!(queued.outcome, AttemptOutcome::Deferred(SyncError::Network(_))));
        let op = h.service.queue().get(&queued.operation.id).await.unwrap();
        assert_eq!(op.state, OperationState::Pending);
        assert_eq!(op.attempts, 1);
        assert!(op.next_attempt_at.is_some());

        // Not due yet: the drain leaves it alone.
        let summary = h.service.sync().await;
        assert_eq!(summary.processed, 0);
        assert!(summary.success);
    }

    #[tokio::test]
    async fn test_retryable_error_fails_after_max_attempts() {
        let h = harness(true).await;
        let queued = h
            .service
            .queue_operation(SyncTable::Activities, OperationKind::Delete, json!("a1"), QueueOptions::default())
            .await
            .unwrap();
        let id = queued.operation.id;

        for _ in 0..5 {
            h.backend.fail_next(SyncError::Timeout(1));
        }
        for attempt in 1..=5u32 {
            let outcome = h.service.attempt(&id).await.unwrap();
            let op = h.service.queue().get(&id).await.unwrap();
            assert_eq!(op.attempts, attempt);
            if attempt < 5 {
                assert!(matches!(outcome, AttemptOutcome::Deferred(_)));
                force_due(&h.service, &id).await;
            } else {
                assert!(matches!(outcome, AttemptOutcome::Failed(_)));
            }
        }

        let op = h.service.queue().get(&id).await.unwrap();
        assert_eq!(op.state, OperationState::Failed);
        assert_eq!(op.attempts, 5);
    }

    /// Skips the backoff window.
    async fn force_due(service: &SyncService, id: &str) {
        service.queue().mark_in_flight(id).await.unwrap();
        service.queue().release(id, "test").await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_queue_then_reconnect_drains_once() {
        let h = harness(false).await;

        for id in ["c1", "c2", "c3"] {
            let queued = h
                .service
                .queue_operation(
                    SyncTable::Challenges,
                    OperationKind::Insert,
                    json!({"id": id, "title": id}),
                    QueueOptions::immediate(),
                )
                .await
                .unwrap();
            assert_eq!(queued.outcome, AttemptOutcome::Deferred(SyncError::Offline));
        }
        assert_eq!(h.service.state().pending_count, 3);
        assert!(h.backend.calls().is_empty());

        let summary = h
            .service
            .set_network_status(NetworkStatus { is_connected: true })
            .await
            .unwrap();
        assert!(summary.success);
        assert_eq!(summary.processed, 3);
        assert_eq!(h.service.state().pending_count, 0);

        // Already online: no second drain.
        assert!(h.service.set_network_status(NetworkStatus { is_connected: true }).await.is_none());

        let events = h.events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| **e == "sync_start").count(), 1);
        assert_eq!(events.first(), Some(&"network_changed"));
        assert_eq!(events.last(), Some(&"sync_complete"));
    }

    #[tokio::test]
    async fn test_failed_resource_blocks_its_later_ops_in_drain() {
        let h = harness(true).await;
        let queue = |payload: Value, kind| {
            let service = h.service.clone();
            async move {
                service
                    .queue_operation(SyncTable::Challenges, kind, payload, QueueOptions::default())
                    .await
                    .unwrap()
                    .operation
            }
        };

        // c1 does not exist remotely: the update is rejected.
        let first = queue(json!({"id": "c1", "title": "a"}), OperationKind::Update).await;
        let second = queue(json!("c1"), OperationKind::Delete).await;
        let other = queue(json!({"id": "c2", "title": "b"}), OperationKind::Insert).await;

        let summary = h.service.sync().await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.success);

        let state_of = |id: String| {
            let service = h.service.clone();
            async move { service.queue().get(&id).await.unwrap().state }
        };
        assert_eq!(state_of(first.id.clone()).await, OperationState::Failed);
        assert_eq!(state_of(second.id.clone()).await, OperationState::Pending);
        assert_eq!(state_of(other.id).await, OperationState::Completed);
        assert!(h.service.state().last_error.is_some());

        // The failed update still holds c1 on the next drain.
        let again = h.service.sync().await;
        assert_eq!((again.processed, again.failed), (0, 0));
        assert_eq!(state_of(second.id.clone()).await, OperationState::Pending);
        assert!(h.service.state().last_error.is_some());
        let c1_calls = || {
            h.backend
                .calls()
                .into_iter()
                .filter(|c| c.id.as_deref() == Some("c1"))
                .map(|c| c.action)
                .collect::<Vec<_>>()
        };
        assert_eq!(c1_calls(), vec!["update"]);

        // Once the update goes through, the delete follows it.
        h.backend.seed(SyncTable::Challenges, json!({"id": "c1", "title": "old"}));
        let retried = h.service.retry_failed().await.unwrap();
        assert!(retried.success);
        assert_eq!(retried.processed, 2);
        assert_eq!(c1_calls(), vec!["update", "update", "delete"]);
        assert_eq!(state_of(first.id).await, OperationState::Completed);
        assert_eq!(state_of(second.id).await, OperationState::Completed);
        assert!(h.backend.row(SyncTable::Challenges, "c1").is_none());
        assert_eq!(h.service.state().last_error, None);
    }

    #[tokio::test]
    async fn test_discard_failed_releases_held_resource() {
        let h = harness(true).await;
        let rejected = h
            .service
            .queue_operation(
                SyncTable::Challenges,
                OperationKind::Update,
                json!({"id": "c1", "title": "a"}),
                QueueOptions::immediate(),
            )
            .await
            .unwrap();
        assert!(matches!(rejected.outcome, AttemptOutcome::Failed(_)));
        h.service
            .queue_operation(SyncTable::Challenges, OperationKind::Delete, json!("c1"), QueueOptions::default())
            .await
            .unwrap();
        assert!(h.service.state().last_error.is_some());

        assert_eq!(h.service.discard_failed().await.unwrap(), 1);
        let state = h.service.state();
        assert_eq!((state.pending_count, state.failed_count), (1, 0));
        assert_eq!(state.last_error, None);

        let summary = h.service.sync().await;
        assert_eq!(summary.processed, 1);
        assert!(h.service.queue().get(&rejected.operation.id).await.is_none());
    }

    #[tokio::test]
    async fn test_sync_skipped_when_offline_or_shut_down() {
        let h = harness(false).await;
        let summary = h.service.sync().await;
        assert_eq!(summary.error, Some(SyncError::Offline));

        h.service.shutdown().await;
        h.service.apply_network_status(true);
        assert_eq!(h.service.sync().await.error, Some(SyncError::ShuttingDown));
        assert_eq!(h.service.initialize().await, Err(SyncError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_retry_failed_resets_and_drains() {
        let h = harness(true).await;
        let queued = h
            .service
            .queue_operation(
                SyncTable::Challenges,
                OperationKind::Update,
                json!({"id": "c9", "title": "x"}),
                QueueOptions::immediate(),
            )
            .await
            .unwrap();
        assert!(matches!(queued.outcome, AttemptOutcome::Failed(_)));

        h.backend.seed(SyncTable::Challenges, json!({"id": "c9", "title": "old"}));
        let summary = h.service.retry_failed().await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.processed, 1);
        let op = h.service.queue().get(&queued.operation.id).await.unwrap();
        assert_eq!(op.state, OperationState::Completed);
        assert_eq!(op.attempts, 1);
    }
}
