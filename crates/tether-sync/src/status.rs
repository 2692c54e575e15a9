//! # Sync Status
//!
//! The single badge a UI shows for sync health, plus the actions behind it.
//!
//! ```text
//!   first match wins
//!   ─────────────────────────────────────────────
//!   offline   not online
//!   error     failed > 0 and a sync error is set
//!   syncing   a drain is running
//!   pending   pending > 0
//!   synced    otherwise
//! ```

use serde::Serialize;

use tether_core::{QueueCounts, SyncStatusType};

use crate::error::SyncResult;
use crate::service::{SyncService, SyncState, SyncSummary};

/// Everything a status badge needs, read at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusSnapshot {
    pub status: SyncStatusType,
    pub label: String,
    pub state: SyncState,
}

/// Thin pass-through over [`SyncService`]; owns no state.
#[derive(Clone)]
pub struct SyncStatusFacade {
    service: SyncService,
}

impl SyncStatusFacade {
    pub fn new(service: SyncService) -> Self {
        SyncStatusFacade { service }
    }

    pub fn snapshot(&self) -> SyncStatusSnapshot {
        let state = self.service.state();
        let status = status_of(&state);
        SyncStatusSnapshot {
            label: label_for(status, &state),
            status,
            state,
        }
    }

    pub fn status_type(&self) -> SyncStatusType {
        status_of(&self.service.state())
    }

    pub async fn sync(&self) -> SyncSummary {
        self.service.sync().await
    }

    pub async fn retry(&self) -> SyncResult<SyncSummary> {
        self.service.retry_failed().await
    }

    /// Drops completed operations. Returns how many were removed.
    pub async fn clear(&self) -> SyncResult<u64> {
        self.service.clear_completed().await
    }

    /// Gives up on failed operations for good, quarantined rows included.
    pub async fn discard(&self) -> SyncResult<u64> {
        self.service.discard_failed().await
    }
}

fn status_of(state: &SyncState) -> SyncStatusType {
    let counts = QueueCounts {
        pending: state.pending_count,
        failed: state.failed_count,
        completed: state.completed_count,
    };
    SyncStatusType::derive(state.is_online, state.is_syncing, counts, state.last_error.is_some())
}

fn label_for(status: SyncStatusType, state: &SyncState) -> String {
    match status {
        SyncStatusType::Offline if state.pending_count > 0 => {
            format!("Offline, {} change(s) waiting", state.pending_count)
        }
        SyncStatusType::Offline => "Offline".to_string(),
        SyncStatusType::Error => format!("{} change(s) failed to sync", state.failed_count),
        SyncStatusType::Syncing => "Syncing".to_string(),
        SyncStatusType::Pending => format!("{} change(s) pending", state.pending_count),
        SyncStatusType::Synced => "All changes synced".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TetherConfig;
    use crate::remote::InMemoryBackend;
    use crate::service::QueueOptions;
    use serde_json::json;
    use std::sync::Arc;
    use tether_core::{OperationKind, SyncTable};
    use tether_db::{Database, DbConfig};

    async fn facade(online: bool) -> SyncStatusFacade {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let service = SyncService::builder(TetherConfig::default())
            .with_database(db)
            .with_remote(Arc::new(InMemoryBackend::new()))
            .online(online)
            .build()
            .unwrap();
        service.initialize().await.unwrap();
        SyncStatusFacade::new(service)
    }

    fn state(is_online: bool, pending: usize, failed: usize, error: bool) -> SyncState {
        SyncState {
            is_online,
            pending_count: pending,
            failed_count: failed,
            last_error: error.then(|| "boom".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_labels() {
        assert_eq!(
            label_for(SyncStatusType::Offline, &state(false, 2, 0, false)),
            "Offline, 2 change(s) waiting"
        );
        assert_eq!(status_of(&state(true, 0, 1, true)), SyncStatusType::Error);
        assert_eq!(status_of(&state(true, 0, 1, false)), SyncStatusType::Synced);
        assert_eq!(status_of(&state(true, 3, 0, false)), SyncStatusType::Pending);
    }

    #[tokio::test]
    async fn test_offline_pending_then_synced() {
        let facade = facade(false).await;
        facade
            .service
            .queue_operation(
                SyncTable::Activities,
                OperationKind::Insert,
                json!({"id": "a1"}),
                QueueOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(facade.status_type(), SyncStatusType::Offline);

        facade.service.apply_network_status(true);
        assert_eq!(facade.snapshot().label, "1 change(s) pending");

        let summary = facade.sync().await;
        assert!(summary.success);
        assert_eq!(facade.status_type(), SyncStatusType::Synced);
        assert_eq!(facade.clear().await.unwrap(), 1);
        assert_eq!(facade.snapshot().state.completed_count, 0);
    }

    #[tokio::test]
    async fn test_rejection_shows_error_until_retried() {
        let facade = facade(true).await;
        facade
            .service
            .queue_operation(
                SyncTable::Profiles,
                OperationKind::Update,
                json!({"id": "ghost", "name": "x"}),
                QueueOptions::default(),
            )
            .await
            .unwrap();

        let summary = facade.sync().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(facade.status_type(), SyncStatusType::Error);

        let retried = facade.retry().await.unwrap();
        assert_eq!(retried.failed, 1);
        assert_eq!(facade.snapshot().state.failed_count, 1);
    }

    #[tokio::test]
    async fn test_inline_rejection_shows_error_until_discarded() {
        let facade = facade(true).await;
        facade
            .service
            .queue_operation(
                SyncTable::Profiles,
                OperationKind::Update,
                json!({"id": "ghost", "name": "x"}),
                QueueOptions::immediate(),
            )
            .await
            .unwrap();

        let snapshot = facade.snapshot();
        assert_eq!(snapshot.status, SyncStatusType::Error);
        assert_eq!(snapshot.label, "1 change(s) failed to sync");
        assert!(snapshot.state.last_error.is_some());

        // A clean drain does not hide the failure.
        assert!(facade.sync().await.success);
        assert_eq!(facade.status_type(), SyncStatusType::Error);

        assert_eq!(facade.discard().await.unwrap(), 1);
        let snapshot = facade.snapshot();
        assert_eq!(snapshot.status, SyncStatusType::Synced);
        assert_eq!(snapshot.state.last_error, None);
    }
}
