//! # Network Monitor
//!
//! Bridges a platform connectivity signal into the sync service.
//!
//! ```text
//!   platform observer ──► watch::Sender<bool> ──► NetworkMonitor task
//!                                                      │
//!                                   apply_network_status(is_connected)
//!                                                      │
//!                              offline → online edge with pending work
//!                                                      │
//!                                          spawn service.sync()
//! ```
//!
//! The sync runs on its own task so a slow drain never delays the next
//! connectivity change; an overlapping drain is refused by the service.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::service::SyncService;

pub struct NetworkMonitor {
    handle: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Applies the current value, then follows every change until the
    /// sender is dropped.
    pub fn spawn(service: SyncService, mut status: watch::Receiver<bool>) -> Self {
        let handle = tokio::spawn(async move {
            let initial = *status.borrow_and_update();
            Self::apply(&service, initial);

            while status.changed().await.is_ok() {
                let is_connected = *status.borrow_and_update();
                Self::apply(&service, is_connected);
            }

            debug!("Network status sender dropped, monitor stopped");
        });

        info!("Network monitor started");
        NetworkMonitor { handle }
    }

    fn apply(service: &SyncService, is_connected: bool) {
        if service.apply_network_status(is_connected) && service.queue().pending_count() > 0 {
            let service = service.clone();
            tokio::spawn(async move {
                let summary = service.sync().await;
                debug!(processed = summary.processed, "Reconnect sync finished");
            });
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
