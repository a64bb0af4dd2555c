//! In-process record store.
//!
//! [`MemoryStore`] keeps every table in a mutex-guarded map and publishes
//! row changes to open change-feed subscriptions over bounded `mpsc`
//! channels. It also exposes fault-injection switches (offline mode,
//! directory failures, feed status signals) so reconnection and partial
//! failure paths can be exercised without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use beacon_core::channels::Channel;
use beacon_core::delivery::{ChannelDelivery, DeliveryStatus};
use beacon_core::notification::{
    Notification, NotificationDraft, NotificationPatch, NotificationQuery, NotificationSummary,
};
use beacon_core::preferences::{Contact, Preferences};
use beacon_core::store::{
    Change, ChangeFeed, ChangeOp, DeliveryStore, DirectoryStore, FeedFilter, FeedMessage,
    FeedStatus, NotificationStore, PreferenceStore, StoreError, StoreResult, Table,
    TemplateStore,
};
use beacon_core::template::NotificationTemplate;
use beacon_core::types::{DbId, Timestamp};
use chrono::Utc;
use tokio::sync::mpsc;

/// Buffer per feed subscription before changes are dropped.
const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    notifications: BTreeMap<DbId, Notification>,
    deliveries: BTreeMap<(DbId, Channel), ChannelDelivery>,
    preferences: HashMap<DbId, Preferences>,
    contacts: HashMap<DbId, Contact>,
    companies: HashMap<DbId, Vec<DbId>>,
    templates: HashMap<String, NotificationTemplate>,
}

struct FeedSink {
    filter: FeedFilter,
    tx: mpsc::Sender<FeedMessage>,
}

/// In-memory implementation of every record store capability.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    feeds: Mutex<Vec<FeedSink>>,
    next_id: AtomicI64,
    offline: AtomicBool,
    directory_down: AtomicBool,
    feed_subscribe_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            feeds: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            offline: AtomicBool::new(false),
            directory_down: AtomicBool::new(false),
            feed_subscribe_calls: AtomicUsize::new(0),
        }
    }

    // ---- seeding ----

    pub fn add_contact(&self, contact: Contact) {
        self.tables().contacts.insert(contact.user_id, contact);
    }

    pub fn add_company_member(&self, company_id: DbId, user_id: DbId) {
        self.tables()
            .companies
            .entry(company_id)
            .or_default()
            .push(user_id);
    }

    pub fn put_template(&self, template: NotificationTemplate) {
        self.tables()
            .templates
            .insert(template.key.clone(), template);
    }

    pub fn put_preferences(&self, prefs: Preferences) {
        self.tables().preferences.insert(prefs.user_id, prefs);
    }

    // ---- fault injection ----

    /// While offline every operation, including feed subscription, fails
    /// with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make contact lookups fail while leaving the rest of the store up.
    pub fn set_directory_down(&self, down: bool) {
        self.directory_down.store(down, Ordering::SeqCst);
    }

    /// Push a status signal to every open subscription. Any status other
    /// than `Subscribed` also closes those subscriptions.
    pub fn emit_status(&self, status: FeedStatus) {
        let mut feeds = self.feeds();
        for sink in feeds.iter() {
            let _ = sink.tx.try_send(FeedMessage::Status(status));
        }
        if status != FeedStatus::Subscribed {
            feeds.clear();
        }
    }

    /// Drop every open subscription without a status, like a dead socket.
    pub fn drop_feeds(&self) {
        self.feeds().clear();
    }

    /// Number of times [`ChangeFeed::subscribe`] has been called.
    pub fn feed_subscribe_calls(&self) -> usize {
        self.feed_subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of currently open feed subscriptions.
    pub fn open_feeds(&self) -> usize {
        let mut feeds = self.feeds();
        feeds.retain(|sink| !sink.tx.is_closed());
        feeds.len()
    }

    /// Publish a change as if another writer had produced it.
    pub fn inject_change(&self, change: Change) {
        self.publish(change);
    }

    // ---- private helpers ----

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn feeds(&self) -> MutexGuard<'_, Vec<FeedSink>> {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, change: Change) {
        let mut feeds = self.feeds();
        feeds.retain(|sink| {
            if !sink.filter.accepts(&change) {
                return !sink.tx.is_closed();
            }
            match sink.tx.try_send(FeedMessage::Change(change.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(table = change.table.as_str(), "Feed subscriber lagged, change dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn notification_change(op: ChangeOp, n: &Notification) -> Change {
        Change {
            table: Table::Notifications,
            op,
            user_id: n.user_id,
            record: serde_json::to_value(n).unwrap_or_default(),
        }
    }

    fn delivery_change(op: ChangeOp, user_id: DbId, d: &ChannelDelivery) -> Change {
        Change {
            table: Table::ChannelDeliveries,
            op,
            user_id,
            record: serde_json::to_value(d).unwrap_or_default(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn query_notifications(
        &self,
        user_id: DbId,
        query: &NotificationQuery,
    ) -> StoreResult<Vec<Notification>> {
        self.ensure_online()?;
        let now = Utc::now();
        let tables = self.tables();
        let mut rows: Vec<Notification> = tables
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && query.matches(n, now))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn insert_notification(
        &self,
        user_id: DbId,
        draft: &NotificationDraft,
    ) -> StoreResult<(Notification, Vec<ChannelDelivery>)> {
        self.ensure_online()?;
        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let channels = draft.normalized_channels();
        let notification = Notification {
            id,
            user_id,
            company_id: draft.company_id,
            company_wide: draft.company_wide,
            title: draft.title.clone(),
            message: draft.message.clone(),
            notification_type: draft.notification_type,
            category: draft.category,
            priority: draft.priority,
            channels: channels.clone(),
            read: false,
            dismissed_at: None,
            clicked_at: None,
            metadata: draft.metadata.clone(),
            expires_at: draft.expires_at,
            source_type: draft.source_type.clone(),
            source_id: draft.source_id.clone(),
            action_url: draft.action_url.clone(),
            created_at: now,
            updated_at: now,
        };
        let deliveries: Vec<ChannelDelivery> = channels
            .iter()
            .map(|&ch| ChannelDelivery::pending(id, ch, now))
            .collect();

        {
            let mut tables = self.tables();
            tables.notifications.insert(id, notification.clone());
            for d in &deliveries {
                tables.deliveries.insert((id, d.channel), d.clone());
            }
        }

        self.publish(Self::notification_change(ChangeOp::Insert, &notification));
        for d in &deliveries {
            self.publish(Self::delivery_change(ChangeOp::Insert, user_id, d));
        }
        Ok((notification, deliveries))
    }

    async fn update_notification(
        &self,
        user_id: DbId,
        patch: &NotificationPatch,
    ) -> StoreResult<Option<Notification>> {
        self.ensure_online()?;
        let updated = {
            let mut tables = self.tables();
            match tables.notifications.get_mut(&patch.id) {
                Some(n) if n.user_id == user_id => {
                    patch.apply_to(n);
                    n.updated_at = Utc::now();
                    Some(n.clone())
                }
                _ => None,
            }
        };
        if let Some(n) = &updated {
            self.publish(Self::notification_change(ChangeOp::Update, n));
        }
        Ok(updated)
    }

    async fn mark_all_read(&self, user_id: DbId, at: Timestamp) -> StoreResult<u64> {
        self.ensure_online()?;
        let changed: Vec<Notification> = {
            let mut tables = self.tables();
            tables
                .notifications
                .values_mut()
                .filter(|n| n.user_id == user_id && !n.read)
                .map(|n| {
                    NotificationPatch::read(n.id, at).apply_to(n);
                    n.updated_at = at;
                    n.clone()
                })
                .collect()
        };
        for n in &changed {
            self.publish(Self::notification_change(ChangeOp::Update, n));
        }
        Ok(changed.len() as u64)
    }

    async fn delete_notification(&self, user_id: DbId, id: DbId) -> StoreResult<bool> {
        self.ensure_online()?;
        let removed = {
            let mut tables = self.tables();
            let owned = tables
                .notifications
                .get(&id)
                .is_some_and(|n| n.user_id == user_id);
            if owned {
                tables.deliveries.retain(|(nid, _), _| *nid != id);
                tables.notifications.remove(&id)
            } else {
                None
            }
        };
        match removed {
            Some(n) => {
                self.publish(Change {
                    table: Table::Notifications,
                    op: ChangeOp::Delete,
                    user_id: n.user_id,
                    record: serde_json::json!({ "id": n.id }),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn notification_summary(&self, user_id: DbId) -> StoreResult<NotificationSummary> {
        self.ensure_online()?;
        let now = Utc::now();
        let tables = self.tables();
        Ok(NotificationSummary::from_notifications(
            tables
                .notifications
                .values()
                .filter(|n| n.user_id == user_id && !n.is_expired(now)),
        ))
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn list_deliveries(
        &self,
        user_id: DbId,
        notification_id: DbId,
    ) -> StoreResult<Vec<ChannelDelivery>> {
        self.ensure_online()?;
        let tables = self.tables();
        let owned = tables
            .notifications
            .get(&notification_id)
            .is_some_and(|n| n.user_id == user_id);
        if !owned {
            return Ok(Vec::new());
        }
        Ok(tables
            .deliveries
            .range((notification_id, Channel::InApp)..=(notification_id, Channel::Sms))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn update_delivery_status(
        &self,
        notification_id: DbId,
        channel: Channel,
        status: DeliveryStatus,
        error_message: Option<String>,
        at: Timestamp,
    ) -> StoreResult<Option<ChannelDelivery>> {
        self.ensure_online()?;
        let updated = {
            let mut tables = self.tables();
            let user_id = tables.notifications.get(&notification_id).map(|n| n.user_id);
            match (user_id, tables.deliveries.get_mut(&(notification_id, channel))) {
                (Some(user_id), Some(row)) if row.status.can_transition(status) => {
                    row.advance(status, error_message, at)?;
                    Some((user_id, row.clone()))
                }
                _ => None,
            }
        };
        Ok(updated.map(|(user_id, row)| {
            self.publish(Self::delivery_change(ChangeOp::Update, user_id, &row));
            row
        }))
    }

    async fn count_sent_since(
        &self,
        user_id: DbId,
        channel: Channel,
        since: Timestamp,
    ) -> StoreResult<u32> {
        self.ensure_online()?;
        let tables = self.tables();
        let count = tables
            .deliveries
            .values()
            .filter(|d| d.channel == channel)
            .filter(|d| {
                tables
                    .notifications
                    .get(&d.notification_id)
                    .is_some_and(|n| n.user_id == user_id)
            })
            .filter(|d| match d.status {
                DeliveryStatus::Sent => d.sent_at.is_some_and(|at| at >= since),
                DeliveryStatus::Delivered => d
                    .sent_at
                    .or(d.delivered_at)
                    .is_some_and(|at| at >= since),
                _ => false,
            })
            .count();
        Ok(count as u32)
    }
}

#[async_trait]
impl PreferenceStore for MemoryStore {
    async fn get_preferences(&self, user_id: DbId) -> StoreResult<Option<Preferences>> {
        self.ensure_online()?;
        Ok(self.tables().preferences.get(&user_id).cloned())
    }

    async fn upsert_preferences(&self, prefs: &Preferences) -> StoreResult<Preferences> {
        self.ensure_online()?;
        self.tables()
            .preferences
            .insert(prefs.user_id, prefs.clone());
        Ok(prefs.clone())
    }

    async fn digest_due(&self, now: Timestamp) -> StoreResult<Vec<Preferences>> {
        self.ensure_online()?;
        let mut due: Vec<Preferences> = self
            .tables()
            .preferences
            .values()
            .filter(|p| p.digest_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|p| p.user_id);
        Ok(due)
    }

    async fn mark_digest_sent(&self, user_id: DbId, at: Timestamp) -> StoreResult<()> {
        self.ensure_online()?;
        if let Some(prefs) = self.tables().preferences.get_mut(&user_id) {
            prefs.digest_last_sent_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn contact(&self, user_id: DbId) -> StoreResult<Option<Contact>> {
        self.ensure_online()?;
        if self.directory_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("contact directory unavailable".into()));
        }
        Ok(self.tables().contacts.get(&user_id).cloned())
    }

    async fn company_members(&self, company_id: DbId) -> StoreResult<Vec<DbId>> {
        self.ensure_online()?;
        Ok(self
            .tables()
            .companies
            .get(&company_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn template(&self, key: &str) -> StoreResult<Option<NotificationTemplate>> {
        self.ensure_online()?;
        Ok(self.tables().templates.get(key).cloned())
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self, filter: FeedFilter) -> StoreResult<mpsc::Receiver<FeedMessage>> {
        self.feed_subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let _ = tx.try_send(FeedMessage::Status(FeedStatus::Subscribed));
        self.feeds().push(FeedSink { filter, tx });
        Ok(rx)
    }
}
