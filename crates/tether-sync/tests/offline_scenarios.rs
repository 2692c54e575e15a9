//! End-to-end offline behaviour: cache fallback, optimistic writes,
//! ordered replay, drain exclusivity and reconnect handling.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_core::{ListQuery, OperationKind, OperationState, SyncTable};
use tether_db::{Database, DbConfig};
use tether_sync::{
    ChallengeService, DataResult, DataService, FetchOptions, InMemoryBackend, NetworkStatus,
    NewChallenge, ProfileService, ProfileUpdate, QueueOptions, SyncError, SyncEvent, SyncService,
    TetherConfig, WriteStatus,
};

// =============================================================================
// Harness
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

struct Harness {
    sync: SyncService,
    backend: Arc<InMemoryBackend>,
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl Harness {
    async fn start(online: bool) -> Self {
        init_tracing();

        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let sync = SyncService::builder(TetherConfig::default())
            .with_database(db)
            .with_remote(backend.clone())
            .online(online)
            .with_listener(move |event| sink.lock().unwrap().push(event.clone()))
            .build()
            .unwrap();
        sync.initialize().await.unwrap();

        Harness { sync, backend, events }
    }

    fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.name() == name).count()
    }

    async fn pending_for(&self, table: SyncTable, id: &str) -> usize {
        self.sync
            .queue()
            .get_all()
            .await
            .iter()
            .filter(|op| {
                op.table == table
                    && op.resource_id.as_deref() == Some(id)
                    && op.state == OperationState::Pending
            })
            .count()
    }
}

// =============================================================================
// Reads
// =============================================================================

#[tokio::test]
async fn cached_value_is_returned_when_fetch_fails() {
    let h = Harness::start(true).await;
    let data = DataService::new(h.sync.clone(), SyncTable::Profiles);
    let key = data.key_for("u1");
    h.sync
        .cache()
        .set(&key, &json!({"id": "u1", "display_name": "Ann"}), Duration::from_secs(600))
        .await
        .unwrap();

    h.backend.fail_next(SyncError::network("connection reset"));
    let result: DataResult<Value> = data
        .fetch_by_id("u1", FetchOptions::force_refresh())
        .await
        .unwrap();

    assert_eq!(result.data, Some(json!({"id": "u1", "display_name": "Ann"})));
    assert!(result.is_stale);
    assert!(result.from_cache);
    assert_eq!(result.error, Some(SyncError::network("connection reset")));
}

// =============================================================================
// Optimistic Writes
// =============================================================================

async fn seeded_profiles() -> (Harness, ProfileService, Value) {
    let h = Harness::start(true).await;
    let original = json!({"id": "u1", "display_name": "Ann", "total_xp": 10, "level": 1});
    h.backend.seed(SyncTable::Profiles, original.clone());

    let profiles = ProfileService::new(h.sync.clone());
    profiles.get_profile("u1", FetchOptions::default()).await.unwrap();
    (h, profiles, original)
}

fn rename(name: &str) -> ProfileUpdate {
    ProfileUpdate {
        display_name: Some(name.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn rejected_update_reverts_cache() {
    let (h, profiles, original) = seeded_profiles().await;
    h.backend.fail_next(SyncError::rejected("validation", "name taken"));

    let result = profiles.update_profile("u1", &rename("Bo")).await.unwrap();

    assert_eq!(result.status, WriteStatus::Rejected);
    assert!(result.error.unwrap().is_rejection());
    let cached: Value = h.sync.cache().get(&profiles.data().key_for("u1")).await.unwrap();
    assert_eq!(cached, original);
    assert_eq!(h.count("operation_failed"), 1);
}

#[tokio::test]
async fn network_failure_keeps_optimistic_value_and_one_pending_op() {
    let (h, profiles, _original) = seeded_profiles().await;
    h.backend.fail_next(SyncError::network("connection reset"));

    let result = profiles.update_profile("u1", &rename("Bo")).await.unwrap();

    assert_eq!(result.status, WriteStatus::Pending);
    assert!(result.is_stale);
    let cached: Value = h.sync.cache().get(&profiles.data().key_for("u1")).await.unwrap();
    assert_eq!(
        cached,
        json!({"id": "u1", "display_name": "Bo", "total_xp": 10, "level": 1})
    );
    assert_eq!(h.pending_for(SyncTable::Profiles, "u1").await, 1);
    assert_eq!(h.count("operation_failed"), 0);
}

// =============================================================================
// Queue Ordering and Draining
// =============================================================================

#[tokio::test]
async fn same_resource_operations_replay_in_enqueue_order() {
    let h = Harness::start(false).await;

    for (kind, payload) in [
        (OperationKind::Insert, json!({"id": "c1", "title": "a"})),
        (OperationKind::Update, json!({"id": "c1", "title": "b"})),
        (OperationKind::Delete, json!({"id": "c1"})),
    ] {
        h.sync
            .queue_operation(SyncTable::Challenges, kind, payload, QueueOptions::immediate())
            .await
            .unwrap();
    }

    h.sync.apply_network_status(true);
    let summary = h.sync.sync().await;

    assert!(summary.success);
    assert_eq!(summary.processed, 3);
    let actions: Vec<_> = h.backend.calls().iter().map(|c| c.action).collect();
    assert_eq!(actions, vec!["insert", "update", "delete"]);
    assert!(h.backend.row(SyncTable::Challenges, "c1").is_none());
}

#[tokio::test]
async fn rejected_update_holds_later_delete_until_retried() {
    let h = Harness::start(false).await;
    for (kind, payload) in [
        (OperationKind::Update, json!({"id": "c1", "title": "renamed"})),
        (OperationKind::Delete, json!({"id": "c1"})),
    ] {
        h.sync
            .queue_operation(SyncTable::Challenges, kind, payload, QueueOptions::default())
            .await
            .unwrap();
    }
    h.sync.apply_network_status(true);

    // c1 is not on the server yet, so the update is rejected.
    let first = h.sync.sync().await;
    assert_eq!((first.processed, first.failed), (0, 1));

    let second = h.sync.sync().await;
    assert_eq!((second.processed, second.failed), (0, 0));
    let actions: Vec<_> = h.backend.calls().iter().map(|c| c.action).collect();
    assert_eq!(actions, vec!["update"]);
    assert_eq!(h.pending_for(SyncTable::Challenges, "c1").await, 1);
    assert!(h.sync.state().last_error.is_some());

    h.backend.seed(SyncTable::Challenges, json!({"id": "c1", "title": "old"}));
    let retried = h.sync.retry_failed().await.unwrap();

    assert!(retried.success);
    assert_eq!(retried.processed, 2);
    let actions: Vec<_> = h.backend.calls().iter().map(|c| c.action).collect();
    assert_eq!(actions, vec!["update", "update", "delete"]);
    assert!(h.backend.row(SyncTable::Challenges, "c1").is_none());
    let state = h.sync.state();
    assert_eq!((state.pending_count, state.failed_count), (0, 0));
    assert_eq!(state.last_error, None);
}

#[tokio::test]
async fn concurrent_sync_calls_run_one_drain() {
    let h = Harness::start(false).await;
    for id in ["a1", "a2", "a3"] {
        h.sync
            .queue_operation(
                SyncTable::Activities,
                OperationKind::Insert,
                json!({"id": id, "user_id": "u1"}),
                QueueOptions::default(),
            )
            .await
            .unwrap();
    }
    h.backend.set_latency(Some(Duration::from_millis(20)));
    h.sync.apply_network_status(true);

    let (first, second) = tokio::join!(h.sync.sync(), h.sync.sync());

    let (ran, skipped) = if first.already_running { (second, first) } else { (first, second) };
    assert!(skipped.already_running);
    assert!(!skipped.success);
    assert_eq!(ran.processed, 3);
    assert_eq!(h.backend.write_count(), 3);
    assert_eq!(h.count("sync_start"), 1);
    assert_eq!(h.sync.state().completed_count, 3);
}

#[tokio::test]
async fn reconnect_triggers_exactly_one_sync() {
    let h = Harness::start(false).await;
    for id in ["a1", "a2", "a3"] {
        h.sync
            .queue_operation(
                SyncTable::Activities,
                OperationKind::Insert,
                json!({"id": id, "user_id": "u1"}),
                QueueOptions::immediate(),
            )
            .await
            .unwrap();
    }
    assert_eq!(h.sync.state().pending_count, 3);
    assert_eq!(h.count("sync_start"), 0);

    let summary = h.sync.set_network_status(NetworkStatus { is_connected: true }).await;

    assert_eq!(summary.map(|s| s.processed), Some(3));
    assert_eq!(h.count("sync_start"), 1);
    assert_eq!(h.count("sync_complete"), 1);
    assert_eq!(h.sync.state().pending_count, 0);
}

#[tokio::test]
async fn going_offline_mid_drain_stops_and_keeps_remaining_ops() {
    let h = Harness::start(true).await;
    let trigger = Mutex::new(Some(h.sync.clone()));
    h.sync.subscribe(move |event| {
        if let SyncEvent::OperationComplete { .. } = event {
            if let Some(sync) = trigger.lock().unwrap().take() {
                sync.apply_network_status(false);
            }
        }
    });

    h.sync.apply_network_status(false);
    for id in ["a1", "a2", "a3"] {
        h.sync
            .queue_operation(
                SyncTable::Activities,
                OperationKind::Insert,
                json!({"id": id, "user_id": "u1"}),
                QueueOptions::default(),
            )
            .await
            .unwrap();
    }
    h.sync.apply_network_status(true);

    let summary = h.sync.sync().await;

    assert!(summary.interrupted);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.error, Some(SyncError::Offline));
    assert_eq!(h.count("sync_error"), 1);
    let state = h.sync.state();
    assert_eq!((state.pending_count, state.completed_count), (2, 1));
    assert!(!state.is_syncing);
}

// =============================================================================
// End to End
// =============================================================================

#[tokio::test]
async fn offline_create_syncs_on_reconnect_and_invalidates_lists() {
    let h = Harness::start(true).await;
    let challenges = ChallengeService::new(h.sync.clone());
    let all = ListQuery::new();

    let before = challenges.list_challenges(&all, FetchOptions::default()).await;
    assert_eq!(before.data.map(|rows| rows.len()), Some(0));

    h.sync.apply_network_status(false);
    let created = challenges
        .create_challenge(&NewChallenge {
            id: None,
            title: "30 day plank".into(),
            description: None,
            creator_id: "u1".into(),
            goal: Some(30),
            ends_at: None,
        })
        .await
        .unwrap();

    assert_eq!(created.status, WriteStatus::Pending);
    let optimistic = created.data.unwrap();
    assert_eq!(optimistic.title, "30 day plank");
    assert_eq!(h.sync.state().pending_count, 1);

    let summary = h
        .sync
        .set_network_status(NetworkStatus { is_connected: true })
        .await
        .unwrap();
    assert!(summary.success);

    let state = h.sync.state();
    assert_eq!((state.pending_count, state.completed_count), (0, 1));

    let list_prefix = h.sync.cache().keys().list_prefix("challenge");
    assert!(h.sync.cache().entries(&list_prefix).await.unwrap().is_empty());

    let after = challenges.list_challenges(&all, FetchOptions::default()).await;
    assert!(!after.from_cache);
    assert_eq!(after.data.unwrap(), vec![optimistic]);
}
