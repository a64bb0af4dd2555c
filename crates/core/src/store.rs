//! Capability traits for the external record store.
//!
//! The engine never talks to a database directly; it consumes these traits.
//! `beacon-db` provides the in-memory and PostgreSQL implementations.
//!
//! Every method is an asynchronous boundary. Mutations on user-owned rows
//! take the acting `user_id` and must be scoped to it: touching another
//! user's row affects zero rows and is reported exactly like a missing row.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::channels::Channel;
use crate::delivery::{ChannelDelivery, DeliveryStatus};
use crate::error::CoreError;
use crate::notification::{
    Notification, NotificationDraft, NotificationPatch, NotificationQuery, NotificationSummary,
};
use crate::preferences::{Contact, Preferences};
use crate::template::NotificationTemplate;
use crate::types::{DbId, Timestamp};

/// Error type for record store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, pool closed, ...).
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed a query.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be mapped onto the domain model.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Range query over one user's notifications, newest first.
    async fn query_notifications(
        &self,
        user_id: DbId,
        query: &NotificationQuery,
    ) -> StoreResult<Vec<Notification>>;

    /// Insert one notification row for `user_id` together with a `pending`
    /// delivery row per requested channel, atomically.
    async fn insert_notification(
        &self,
        user_id: DbId,
        draft: &NotificationDraft,
    ) -> StoreResult<(Notification, Vec<ChannelDelivery>)>;

    /// Apply a patch to one of `user_id`'s rows. `None` when zero rows matched.
    async fn update_notification(
        &self,
        user_id: DbId,
        patch: &NotificationPatch,
    ) -> StoreResult<Option<Notification>>;

    /// Mark every unread row of `user_id` as read. Returns rows affected.
    async fn mark_all_read(&self, user_id: DbId, at: Timestamp) -> StoreResult<u64>;

    /// Delete one of `user_id`'s rows. `false` when zero rows matched.
    async fn delete_notification(&self, user_id: DbId, id: DbId) -> StoreResult<bool>;

    /// Aggregates over the user's unexpired notifications.
    async fn notification_summary(&self, user_id: DbId) -> StoreResult<NotificationSummary>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Delivery rows of `notification_id`, empty unless it belongs to `user_id`.
    async fn list_deliveries(
        &self,
        user_id: DbId,
        notification_id: DbId,
    ) -> StoreResult<Vec<ChannelDelivery>>;

    /// Move a delivery row to `status`. Only succeeds from a valid
    /// predecessor state; `None` when the row is missing or already past it.
    async fn update_delivery_status(
        &self,
        notification_id: DbId,
        channel: Channel,
        status: DeliveryStatus,
        error_message: Option<String>,
        at: Timestamp,
    ) -> StoreResult<Option<ChannelDelivery>>;

    /// Deliveries on `channel` for `user_id` that left `pending` successfully
    /// (sent or delivered) since `since`.
    async fn count_sent_since(
        &self,
        user_id: DbId,
        channel: Channel,
        since: Timestamp,
    ) -> StoreResult<u32>;
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_preferences(&self, user_id: DbId) -> StoreResult<Option<Preferences>>;

    /// Full-document upsert keyed by `user_id` (last writer wins).
    async fn upsert_preferences(&self, prefs: &Preferences) -> StoreResult<Preferences>;

    /// Preference rows with a digest due at `now`.
    async fn digest_due(&self, now: Timestamp) -> StoreResult<Vec<Preferences>>;

    async fn mark_digest_sent(&self, user_id: DbId, at: Timestamp) -> StoreResult<()>;
}

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn contact(&self, user_id: DbId) -> StoreResult<Option<Contact>>;

    async fn company_members(&self, company_id: DbId) -> StoreResult<Vec<DbId>>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn template(&self, key: &str) -> StoreResult<Option<NotificationTemplate>>;
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

/// Tables whose row changes are published on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Notifications,
    ChannelDeliveries,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Notifications => "notifications",
            Table::ChannelDeliveries => "channel_deliveries",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A single row-level change, as published by the store.
///
/// `record` holds the new row for INSERT/UPDATE (possibly partial) and the
/// old row, or at least its key, for DELETE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub table: Table,
    pub op: ChangeOp,
    pub user_id: DbId,
    pub record: serde_json::Value,
}

/// Lifecycle signal of a feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Status(FeedStatus),
    Change(Change),
}

/// Which changes a subscription wants. `user_id: None` means every user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedFilter {
    pub table: Table,
    pub user_id: Option<DbId>,
}

impl FeedFilter {
    pub fn accepts(&self, change: &Change) -> bool {
        change.table == self.table && self.user_id.map_or(true, |id| id == change.user_id)
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription. The first message on a healthy subscription is
    /// `Status(Subscribed)`; the stream ending without a status is a
    /// transport drop. Dropping the receiver ends the subscription.
    async fn subscribe(&self, filter: FeedFilter) -> StoreResult<mpsc::Receiver<FeedMessage>>;
}

/// The whole record store surface, implemented by every backend.
pub trait RecordStore:
    NotificationStore + DeliveryStore + PreferenceStore + DirectoryStore + TemplateStore + ChangeFeed
{
}

impl<T> RecordStore for T where
    T: NotificationStore
        + DeliveryStore
        + PreferenceStore
        + DirectoryStore
        + TemplateStore
        + ChangeFeed
{
}
