//! Client-side notification state.
//!
//! [`reduce`] is a pure `(state, action) -> state` function. Change-feed
//! events go through [`apply_change`], which returns the next state together
//! with the side effects the caller must run (push display, catch-up
//! refresh). Neither function performs I/O.

use beacon_core::notification::{Notification, NotificationPatch, NotificationSummary};
use beacon_core::preferences::Preferences;
use beacon_core::store::{Change, ChangeOp, Table};
use beacon_core::types::DbId;

/// Snapshot of one user's notification view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationState {
    /// Most recent first.
    pub notifications: Vec<Notification>,
    /// Always `count(!read)` over `notifications`.
    pub unread_count: usize,
    pub loading: bool,
    pub error: Option<String>,
    pub preferences: Option<Preferences>,
    pub summary: Option<NotificationSummary>,
    pub is_subscribed: bool,
}

impl NotificationState {
    pub fn get(&self, id: DbId) -> Option<&Notification> {
        self.notifications.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: DbId) -> bool {
        self.get(id).is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SetLoading(bool),
    SetError(Option<String>),
    SetNotifications(Vec<Notification>),
    AddNotification(Notification),
    UpdateNotification(NotificationPatch),
    RemoveNotification(DbId),
    SetPreferences(Preferences),
    SetSummary(NotificationSummary),
    SetSubscribed(bool),
}

pub fn reduce(mut state: NotificationState, action: Action) -> NotificationState {
    match action {
        Action::SetLoading(loading) => state.loading = loading,
        Action::SetError(error) => {
            state.error = error;
            state.loading = false;
        }
        Action::SetNotifications(notifications) => {
            state.notifications = notifications;
            state.loading = false;
            state.error = None;
        }
        Action::AddNotification(notification) => {
            if !state.contains(notification.id) {
                state.notifications.insert(0, notification);
            }
        }
        Action::UpdateNotification(patch) => {
            if let Some(target) = state.notifications.iter_mut().find(|n| n.id == patch.id) {
                patch.apply_to(target);
            }
        }
        Action::RemoveNotification(id) => state.notifications.retain(|n| n.id != id),
        Action::SetPreferences(prefs) => state.preferences = Some(prefs),
        Action::SetSummary(summary) => state.summary = Some(summary),
        Action::SetSubscribed(subscribed) => state.is_subscribed = subscribed,
    }
    state.unread_count = state.notifications.iter().filter(|n| !n.read).count();
    state
}

// ---------------------------------------------------------------------------
// Change application
// ---------------------------------------------------------------------------

/// Work requested by a state transition, executed by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// A new unread notification arrived; ask the push service to display
    /// it (subject to quiet hours and rate limits).
    ShowPush(Notification),
    /// The payload could not be applied locally; reload from the store.
    Refresh,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: NotificationState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: NotificationState) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }
}

/// Apply one change-feed event.
///
/// INSERT prepends (a repeated id is ignored), UPDATE merges the partial
/// record into the matching row, DELETE removes by id. Deliveries table
/// events do not touch the list. A record cut down by the change feed
/// (`"truncated": true`) only requests a refresh.
pub fn apply_change(state: NotificationState, change: &Change) -> Transition {
    if change.table != Table::Notifications {
        return Transition::unchanged(state);
    }
    if change.op != ChangeOp::Delete && is_truncated(&change.record) {
        tracing::debug!(op = ?change.op, "Truncated change payload, refreshing");
        return refresh(state);
    }

    match change.op {
        ChangeOp::Insert => match serde_json::from_value::<Notification>(change.record.clone()) {
            Ok(notification) => {
                let show = !notification.read && !state.contains(notification.id);
                let effects = if show {
                    vec![Effect::ShowPush(notification.clone())]
                } else {
                    Vec::new()
                };
                Transition {
                    state: reduce(state, Action::AddNotification(notification)),
                    effects,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable INSERT payload, refreshing");
                refresh(state)
            }
        },
        ChangeOp::Update => {
            match serde_json::from_value::<NotificationPatch>(change.record.clone()) {
                Ok(patch) => Transition::unchanged(reduce(state, Action::UpdateNotification(patch))),
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable UPDATE payload, refreshing");
                    refresh(state)
                }
            }
        }
        ChangeOp::Delete => match change.record.get("id").and_then(|id| id.as_i64()) {
            Some(id) => Transition::unchanged(reduce(state, Action::RemoveNotification(id))),
            None => refresh(state),
        },
    }
}

fn is_truncated(record: &serde_json::Value) -> bool {
    record.get("truncated") == Some(&serde_json::Value::Bool(true))
}

fn refresh(state: NotificationState) -> Transition {
    Transition {
        state,
        effects: vec![Effect::Refresh],
    }
}
