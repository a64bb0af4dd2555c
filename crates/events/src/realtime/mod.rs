//! Event bus client: keyed change-feed subscriptions with automatic
//! reconnection.
//!
//! A [`RealtimeManager`] owns one task per [`ChannelKey`]. Each task opens a
//! change-feed subscription, forwards row changes to its
//! [`SubscriptionHandler`] in feed order, and reconnects with exponential
//! backoff when the feed reports `CHANNEL_ERROR` / `TIMED_OUT` or drops.

mod backoff;
mod manager;

use std::fmt;

use beacon_core::store::{Change, FeedFilter, Table};
use beacon_core::types::DbId;

pub use backoff::{backoff_delay, RealtimeConfig, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
pub use manager::{RealtimeManager, SubscriptionHandle};

// ---------------------------------------------------------------------------
// ChannelKey
// ---------------------------------------------------------------------------

/// Identity of a logical subscription: `(resource, user[, scope])`.
///
/// At most one live subscription exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub resource: Table,
    /// `None` subscribes to every user's rows (server-side consumers).
    pub user_id: Option<DbId>,
    pub scope_id: Option<String>,
}

impl ChannelKey {
    pub fn notifications(user_id: DbId) -> Self {
        Self {
            resource: Table::Notifications,
            user_id: Some(user_id),
            scope_id: None,
        }
    }

    pub fn deliveries(user_id: DbId) -> Self {
        Self {
            resource: Table::ChannelDeliveries,
            user_id: Some(user_id),
            scope_id: None,
        }
    }

    /// Every user's changes on `resource`.
    pub fn all(resource: Table) -> Self {
        Self {
            resource,
            user_id: None,
            scope_id: None,
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Stable channel name, e.g. `notifications:42` or `notifications:*:inbox`.
    pub fn name(&self) -> String {
        let user = self
            .user_id
            .map_or_else(|| "*".to_string(), |id| id.to_string());
        match &self.scope_id {
            Some(scope) => format!("{}:{user}:{scope}", self.resource.as_str()),
            None => format!("{}:{user}", self.resource.as_str()),
        }
    }

    pub fn filter(&self) -> FeedFilter {
        FeedFilter {
            table: self.resource,
            user_id: self.user_id,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

// ---------------------------------------------------------------------------
// Status and errors
// ---------------------------------------------------------------------------

/// Observable lifecycle of one keyed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    /// Waiting out the backoff before reconnection attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// Reconnection attempts exhausted; only `force_reconnect` revives it.
    Failed,
    Closed,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RealtimeError {
    #[error("Channel {channel} failed after {attempts} reconnection attempts: {last_error}")]
    Exhausted {
        channel: String,
        attempts: u32,
        last_error: String,
    },
}

// ---------------------------------------------------------------------------
// SubscriptionHandler
// ---------------------------------------------------------------------------

/// Consumer side of a keyed subscription.
///
/// Callbacks run on the subscription task, one at a time and in feed
/// order, so implementations should hand slow work off to another task.
pub trait SubscriptionHandler: Send + Sync + 'static {
    fn on_event(&self, change: Change);

    /// Called exactly once when reconnection attempts are exhausted.
    fn on_error(&self, error: RealtimeError);

    fn on_status(&self, _status: ChannelStatus) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_stable() {
        assert_eq!(ChannelKey::notifications(42).name(), "notifications:42");
        assert_eq!(
            ChannelKey::all(Table::Notifications).with_scope("dispatch").name(),
            "notifications:*:dispatch"
        );
        assert_eq!(ChannelKey::deliveries(7).to_string(), "channel_deliveries:7");
    }

    #[test]
    fn key_maps_to_feed_filter() {
        let filter = ChannelKey::notifications(3).filter();
        assert_eq!(filter.table, Table::Notifications);
        assert_eq!(filter.user_id, Some(3));
    }
}
