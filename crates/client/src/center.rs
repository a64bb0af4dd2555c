//! Presentation-facing notification center.
//!
//! Every mutation applies an optimistic local [`Action`] first and then
//! writes to the store. Failed writes are never rolled back: the failure is
//! recorded in [`NotificationState::error`] and the next
//! [`NotificationCenter::refresh_notifications`] or
//! [`NotificationCenter::reconcile`] converges the view.
//!
//! Single-row mutations return `Ok(false)` when the store matched zero rows.
//! A row that does not exist and a row owned by another user are reported
//! the same way.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use beacon_core::delivery::ChannelDelivery;
use beacon_core::notification::{Notification, NotificationPatch, NotificationQuery};
use beacon_core::preferences::{Preferences, PreferencesUpdate};
use beacon_core::store::{Change, RecordStore, StoreError};
use beacon_core::types::DbId;
use beacon_events::delivery::{PushOutcome, PushService};
use beacon_events::realtime::{
    ChannelKey, ChannelStatus, RealtimeError, RealtimeManager, SubscriptionHandle,
    SubscriptionHandler,
};
use chrono::Utc;
use tokio::sync::watch;

use crate::state::{apply_change, reduce, Action, Effect, NotificationState};

#[derive(Debug, thiserror::Error)]
pub enum CenterError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CenterResult<T> = Result<T, CenterError>;

pub struct NotificationCenter {
    user_id: DbId,
    store: Arc<dyn RecordStore>,
    realtime: Arc<RealtimeManager>,
    push: Option<Arc<PushService>>,
    state: watch::Sender<NotificationState>,
    /// Filters of the last fetch, reused by refreshes.
    filters: Mutex<NotificationQuery>,
    subscription: tokio::sync::Mutex<Option<SubscriptionHandle>>,
}

impl NotificationCenter {
    pub fn new(
        user_id: DbId,
        store: Arc<dyn RecordStore>,
        realtime: Arc<RealtimeManager>,
    ) -> Arc<Self> {
        Self::build(user_id, store, realtime, None)
    }

    /// Like [`new`](Self::new), additionally displaying pushes for new
    /// unread notifications through `push`.
    pub fn with_push(
        user_id: DbId,
        store: Arc<dyn RecordStore>,
        realtime: Arc<RealtimeManager>,
        push: Arc<PushService>,
    ) -> Arc<Self> {
        Self::build(user_id, store, realtime, Some(push))
    }

    fn build(
        user_id: DbId,
        store: Arc<dyn RecordStore>,
        realtime: Arc<RealtimeManager>,
        push: Option<Arc<PushService>>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(NotificationState::default());
        Arc::new(Self {
            user_id,
            store,
            realtime,
            push,
            state,
            filters: Mutex::new(NotificationQuery::default()),
            subscription: tokio::sync::Mutex::new(None),
        })
    }

    pub fn user_id(&self) -> DbId {
        self.user_id
    }

    pub fn snapshot(&self) -> NotificationState {
        self.state.borrow().clone()
    }

    /// Receiver of state snapshots, notified after every transition.
    pub fn watch(&self) -> watch::Receiver<NotificationState> {
        self.state.subscribe()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Replace the list with the result of `filters` (or the previous
    /// filters when `None`). On failure the previous list is kept.
    pub async fn fetch_notifications(&self, filters: Option<NotificationQuery>) -> CenterResult<()> {
        let query = match filters {
            Some(filters) => {
                *self.filters() = filters.clone();
                filters
            }
            None => self.filters().clone(),
        };

        self.dispatch(Action::SetLoading(true));
        match self.store.query_notifications(self.user_id, &query).await {
            Ok(notifications) => {
                tracing::debug!(user_id = self.user_id, count = notifications.len(), "Notifications fetched");
                self.dispatch(Action::SetNotifications(notifications));
                Ok(())
            }
            Err(e) => Err(self.fail("Failed to fetch notifications", e)),
        }
    }

    pub async fn refresh_notifications(&self) -> CenterResult<()> {
        self.fetch_notifications(None).await
    }

    pub async fn fetch_preferences(&self) -> CenterResult<Preferences> {
        let prefs = match self.store.get_preferences(self.user_id).await {
            Ok(prefs) => prefs.unwrap_or_else(|| Preferences::defaults_for(self.user_id)),
            Err(e) => return Err(self.fail("Failed to fetch preferences", e)),
        };
        self.dispatch(Action::SetPreferences(prefs.clone()));
        Ok(prefs)
    }

    pub async fn fetch_summary(&self) -> CenterResult<()> {
        match self.store.notification_summary(self.user_id).await {
            Ok(summary) => {
                self.dispatch(Action::SetSummary(summary));
                Ok(())
            }
            Err(e) => Err(self.fail("Failed to fetch summary", e)),
        }
    }

    /// Per-channel delivery rows of one of this user's notifications.
    /// Empty for another user's notification.
    pub async fn delivery_status(&self, notification_id: DbId) -> CenterResult<Vec<ChannelDelivery>> {
        Ok(self.store.list_deliveries(self.user_id, notification_id).await?)
    }

    /// Reload the list, preferences and summary from the store.
    pub async fn reconcile(&self) -> CenterResult<()> {
        self.refresh_notifications().await?;
        self.fetch_preferences().await?;
        self.fetch_summary().await
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn mark_as_read(&self, id: DbId) -> CenterResult<bool> {
        self.patch(NotificationPatch::read(id, Utc::now())).await
    }

    /// Hide a notification without deleting it.
    pub async fn dismiss_notification(&self, id: DbId) -> CenterResult<bool> {
        self.patch(NotificationPatch::dismissed(id, Utc::now())).await
    }

    /// Returns how many rows the store marked.
    pub async fn mark_all_as_read(&self) -> CenterResult<u64> {
        let now = Utc::now();
        let unread: Vec<DbId> = self
            .state
            .borrow()
            .notifications
            .iter()
            .filter(|n| !n.read)
            .map(|n| n.id)
            .collect();
        for id in unread {
            self.dispatch(Action::UpdateNotification(NotificationPatch::read(id, now)));
        }

        match self.store.mark_all_read(self.user_id, now).await {
            Ok(count) => {
                tracing::info!(user_id = self.user_id, count, "Marked all notifications read");
                Ok(count)
            }
            Err(e) => Err(self.fail("Failed to mark all notifications read", e)),
        }
    }

    pub async fn delete_notification(&self, id: DbId) -> CenterResult<bool> {
        self.dispatch(Action::RemoveNotification(id));
        match self.store.delete_notification(self.user_id, id).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(user_id = self.user_id, notification_id = id, "Delete matched no rows");
                Ok(false)
            }
            Err(e) => Err(self.fail("Failed to delete notification", e)),
        }
    }

    /// Merge `update` into the stored document, upsert it, then reload.
    pub async fn update_preferences(&self, update: &PreferencesUpdate) -> CenterResult<Preferences> {
        let mut prefs = match self.store.get_preferences(self.user_id).await {
            Ok(prefs) => prefs.unwrap_or_else(|| Preferences::defaults_for(self.user_id)),
            Err(e) => return Err(self.fail("Failed to update preferences", e)),
        };
        update.apply_to(&mut prefs);
        if let Err(e) = self.store.upsert_preferences(&prefs).await {
            return Err(self.fail("Failed to update preferences", e));
        }
        tracing::info!(user_id = self.user_id, "Preferences updated");
        self.fetch_preferences().await
    }

    // -----------------------------------------------------------------------
    // Realtime
    // -----------------------------------------------------------------------

    /// Start applying this user's change feed. Calling it again replaces the
    /// previous subscription.
    pub async fn subscribe_to_notifications(self: &Arc<Self>) {
        let mut slot = self.subscription.lock().await;
        if let Some(previous) = slot.take() {
            previous.unsubscribe().await;
        }
        let handler = Arc::new(FeedHandler {
            center: Arc::downgrade(self),
            interrupted: Mutex::new(false),
        });
        let handle = self
            .realtime
            .subscribe(ChannelKey::notifications(self.user_id), handler)
            .await;
        *slot = Some(handle);
    }

    /// Stop the feed subscription. Safe to call repeatedly.
    pub async fn unsubscribe(&self) {
        if let Some(handle) = self.subscription.lock().await.take() {
            handle.unsubscribe().await;
        }
        self.dispatch(Action::SetSubscribed(false));
    }

    /// Unsubscribe every channel tracked by the realtime manager.
    pub async fn teardown(&self) {
        self.unsubscribe().await;
        self.realtime.unsubscribe_all().await;
    }

    // ---- private helpers ----

    fn filters(&self) -> MutexGuard<'_, NotificationQuery> {
        self.filters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, action: Action) {
        self.state
            .send_modify(|state| *state = reduce(std::mem::take(state), action));
    }

    /// Record a transport failure in the state and hand the error back.
    fn fail(&self, context: &str, error: StoreError) -> CenterError {
        tracing::error!(user_id = self.user_id, error = %error, "{context}");
        self.dispatch(Action::SetError(Some(format!("{context}: {error}"))));
        CenterError::Store(error)
    }

    async fn patch(&self, patch: NotificationPatch) -> CenterResult<bool> {
        let id = patch.id;
        self.dispatch(Action::UpdateNotification(patch.clone()));
        match self.store.update_notification(self.user_id, &patch).await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => {
                tracing::warn!(user_id = self.user_id, notification_id = id, "Update matched no rows");
                Ok(false)
            }
            Err(e) => Err(self.fail("Failed to update notification", e)),
        }
    }

    fn apply(self: &Arc<Self>, change: &Change) {
        let mut effects = Vec::new();
        self.state.send_modify(|state| {
            let transition = apply_change(std::mem::take(state), change);
            *state = transition.state;
            effects = transition.effects;
        });
        for effect in effects {
            self.run_effect(effect);
        }
    }

    /// Effects run detached so a slow or failing push never delays state.
    fn run_effect(self: &Arc<Self>, effect: Effect) {
        let center = Arc::clone(self);
        match effect {
            Effect::ShowPush(notification) => {
                if self.push.is_some() {
                    tokio::spawn(async move { center.show_push(notification).await });
                }
            }
            Effect::Refresh => {
                tokio::spawn(async move {
                    let _ = center.refresh_notifications().await;
                });
            }
        }
    }

    async fn show_push(&self, notification: Notification) {
        let Some(push) = &self.push else {
            return;
        };
        let prefs = self
            .state
            .borrow()
            .preferences
            .clone()
            .unwrap_or_else(|| Preferences::defaults_for(self.user_id));
        match push.show(&prefs, &notification, Utc::now()).await {
            Ok(PushOutcome::Shown(_)) => {}
            Ok(PushOutcome::Suppressed(reason)) => {
                tracing::debug!(notification_id = notification.id, reason = %reason, "Push suppressed");
            }
            Err(e) => {
                tracing::warn!(notification_id = notification.id, error = %e, "Push display failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Feed handler
// ---------------------------------------------------------------------------

struct FeedHandler {
    center: Weak<NotificationCenter>,
    /// Set once the feed drops, so the next `Subscribed` triggers a
    /// catch-up refresh for events missed while disconnected.
    interrupted: Mutex<bool>,
}

impl FeedHandler {
    fn interrupted(&self) -> MutexGuard<'_, bool> {
        self.interrupted.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SubscriptionHandler for FeedHandler {
    fn on_event(&self, change: Change) {
        if let Some(center) = self.center.upgrade() {
            center.apply(&change);
        }
    }

    fn on_error(&self, error: RealtimeError) {
        let Some(center) = self.center.upgrade() else {
            return;
        };
        tracing::error!(user_id = center.user_id, error = %error, "Notification feed lost");
        center.dispatch(Action::SetSubscribed(false));
        center.dispatch(Action::SetError(Some(error.to_string())));
    }

    fn on_status(&self, status: ChannelStatus) {
        let Some(center) = self.center.upgrade() else {
            return;
        };
        match status {
            ChannelStatus::Subscribed => {
                center.dispatch(Action::SetSubscribed(true));
                if std::mem::take(&mut *self.interrupted()) {
                    tracing::info!(user_id = center.user_id, "Feed restored, refreshing");
                    center.run_effect(Effect::Refresh);
                }
            }
            ChannelStatus::Reconnecting { .. } | ChannelStatus::Failed => {
                *self.interrupted() = true;
                center.dispatch(Action::SetSubscribed(false));
            }
            ChannelStatus::Closed => center.dispatch(Action::SetSubscribed(false)),
            ChannelStatus::Connecting => {}
        }
    }
}
