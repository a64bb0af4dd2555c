//! Server-side consumer of new notifications.
//!
//! [`DispatchWorker`] subscribes to every user's notification INSERTs
//! through the [`RealtimeManager`] (so it inherits the same reconnection
//! policy) and hands each new row to the [`DeliveryOrchestrator`]. Rows
//! whose channels already left `pending` are skipped by the orchestrator,
//! so replayed INSERTs after a reconnect do not re-send.

use std::sync::Arc;

use beacon_core::notification::Notification;
use beacon_core::store::{Change, ChangeOp, Table};

use crate::orchestrator::DeliveryOrchestrator;
use crate::realtime::{
    ChannelKey, ChannelStatus, RealtimeError, RealtimeManager, SubscriptionHandle,
    SubscriptionHandler,
};

pub struct DispatchWorker {
    realtime: Arc<RealtimeManager>,
    orchestrator: Arc<DeliveryOrchestrator>,
}

impl DispatchWorker {
    pub fn new(realtime: Arc<RealtimeManager>, orchestrator: Arc<DeliveryOrchestrator>) -> Self {
        Self {
            realtime,
            orchestrator,
        }
    }

    pub fn key() -> ChannelKey {
        ChannelKey::all(Table::Notifications).with_scope("dispatch")
    }

    /// Start consuming. Dropping the handle does not stop the worker; call
    /// [`SubscriptionHandle::unsubscribe`] or shut the manager down.
    pub async fn start(&self) -> SubscriptionHandle {
        let handler = Arc::new(DispatchHandler {
            orchestrator: Arc::clone(&self.orchestrator),
        });
        let handle = self.realtime.subscribe(Self::key(), handler).await;
        tracing::info!(channel = %handle.key(), "Dispatch worker started");
        handle
    }
}

struct DispatchHandler {
    orchestrator: Arc<DeliveryOrchestrator>,
}

impl SubscriptionHandler for DispatchHandler {
    fn on_event(&self, change: Change) {
        if change.op != ChangeOp::Insert {
            return;
        }
        let notification: Notification = match serde_json::from_value(change.record) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(user_id = change.user_id, error = %e, "Unreadable notification payload");
                return;
            }
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.dispatch(&notification).await {
                tracing::error!(notification_id = notification.id, error = %e, "Dispatch failed");
            }
        });
    }

    fn on_error(&self, error: RealtimeError) {
        tracing::error!(error = %error, "Dispatch worker lost its change feed");
    }

    fn on_status(&self, status: ChannelStatus) {
        tracing::debug!(status = ?status, "Dispatch feed status changed");
    }
}
