//! PostgreSQL record store.
//!
//! Queries follow the repository pattern: one SQL string per operation,
//! column lists shared through constants, rows mapped through
//! [`rows`] into domain types. Ownership scoping is part of every
//! `WHERE` clause, so a foreign row behaves exactly like a missing one.

mod feed;
mod rows;

use async_trait::async_trait;
use beacon_core::channels::Channel;
use beacon_core::delivery::{ChannelDelivery, DeliveryStatus};
use beacon_core::notification::{
    Notification, NotificationDraft, NotificationPatch, NotificationQuery, NotificationSummary,
};
use beacon_core::preferences::{Contact, Preferences};
use beacon_core::store::{
    DeliveryStore, DirectoryStore, NotificationStore, PreferenceStore, StoreError, StoreResult,
    TemplateStore,
};
use beacon_core::template::NotificationTemplate;
use beacon_core::types::{DbId, Timestamp};
use sqlx::{PgPool, Postgres, QueryBuilder};

use self::rows::{
    to_text, DeliveryRow, NotificationRow, PreferencesRow, TemplateRow, DELIVERY_COLUMNS,
    NOTIFICATION_COLUMNS, PREFERENCE_COLUMNS,
};

pub use self::feed::CHANGE_CHANNEL;

/// Map a driver error onto the store error taxonomy.
pub(crate) fn store_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

/// Record store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn query_notifications(
        &self,
        user_id: DbId,
        query: &NotificationQuery,
    ) -> StoreResult<Vec<Notification>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE user_id = "
        ));
        qb.push_bind(user_id);

        if let Some(read) = query.read {
            qb.push(" AND read = ").push_bind(read);
        }
        if !query.types.is_empty() {
            qb.push(" AND type = ANY(").push_bind(to_text(&query.types)).push(")");
        }
        if !query.categories.is_empty() {
            qb.push(" AND category = ANY(")
                .push_bind(to_text(&query.categories))
                .push(")");
        }
        if !query.priorities.is_empty() {
            qb.push(" AND priority = ANY(")
                .push_bind(to_text(&query.priorities))
                .push(")");
        }
        if let Some(from) = query.date_from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = query.date_to {
            qb.push(" AND created_at <= ").push_bind(to);
        }
        if !query.include_expired {
            qb.push(" AND (expires_at IS NULL OR expires_at > NOW())");
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(query.limit.max(0))
            .push(" OFFSET ")
            .push_bind(query.offset.max(0));

        let rows: Vec<NotificationRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn insert_notification(
        &self,
        user_id: DbId,
        draft: &NotificationDraft,
    ) -> StoreResult<(Notification, Vec<ChannelDelivery>)> {
        let channels = draft.normalized_channels();
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let row: NotificationRow = sqlx::query_as(&format!(
            "INSERT INTO notifications \
             (user_id, company_id, company_wide, title, message, type, category, priority, \
              channels, metadata, expires_at, source_type, source_id, action_url) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             RETURNING {NOTIFICATION_COLUMNS}"
        ))
        .bind(user_id)
        .bind(draft.company_id)
        .bind(draft.company_wide)
        .bind(&draft.title)
        .bind(&draft.message)
        .bind(draft.notification_type.as_str())
        .bind(draft.category.as_str())
        .bind(draft.priority.as_str())
        .bind(to_text(&channels))
        .bind(serde_json::Value::Object(draft.metadata.clone()))
        .bind(draft.expires_at)
        .bind(&draft.source_type)
        .bind(&draft.source_id)
        .bind(&draft.action_url)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;

        let delivery_rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "INSERT INTO channel_deliveries (notification_id, channel) \
             SELECT $1, UNNEST($2::text[]) \
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(row.id)
        .bind(to_text(&channels))
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;

        let notification = Notification::try_from(row)?;
        let deliveries = delivery_rows
            .into_iter()
            .map(ChannelDelivery::try_from)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok((notification, deliveries))
    }

    async fn update_notification(
        &self,
        user_id: DbId,
        patch: &NotificationPatch,
    ) -> StoreResult<Option<Notification>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE notifications SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(title) = &patch.title {
                set.push("title = ").push_bind_unseparated(title.clone());
            }
            if let Some(message) = &patch.message {
                set.push("message = ").push_bind_unseparated(message.clone());
            }
            if let Some(t) = patch.notification_type {
                set.push("type = ").push_bind_unseparated(t.as_str());
            }
            if let Some(c) = patch.category {
                set.push("category = ").push_bind_unseparated(c.as_str());
            }
            if let Some(p) = patch.priority {
                set.push("priority = ").push_bind_unseparated(p.as_str());
            }
            if let Some(read) = patch.read {
                set.push("read = ").push_bind_unseparated(read);
            }
            if let Some(dismissed_at) = patch.dismissed_at {
                set.push("dismissed_at = ").push_bind_unseparated(dismissed_at);
            }
            if let Some(clicked_at) = patch.clicked_at {
                set.push("clicked_at = ").push_bind_unseparated(clicked_at);
            }
            if let Some(metadata) = &patch.metadata {
                set.push("metadata = ")
                    .push_bind_unseparated(serde_json::Value::Object(metadata.clone()));
            }
            if let Some(action_url) = &patch.action_url {
                set.push("action_url = ").push_bind_unseparated(action_url.clone());
            }
            set.push("updated_at = NOW()");
        }
        qb.push(" WHERE id = ")
            .push_bind(patch.id)
            .push(" AND user_id = ")
            .push_bind(user_id)
            .push(format!(" RETURNING {NOTIFICATION_COLUMNS}"));

        let row: Option<NotificationRow> = qb
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(Notification::try_from).transpose()
    }

    async fn mark_all_read(&self, user_id: DbId, at: Timestamp) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE notifications \
             SET read = true, clicked_at = $2, updated_at = NOW() \
             WHERE user_id = $1 AND read = false",
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_notification(&self, user_id: DbId, id: DbId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn notification_summary(&self, user_id: DbId) -> StoreResult<NotificationSummary> {
        let rows: Vec<(String, String, String, bool)> = sqlx::query_as(
            "SELECT type, category, priority, read FROM notifications \
             WHERE user_id = $1 AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut summary = NotificationSummary::default();
        for (t, c, p, read) in rows {
            summary.record(t.parse()?, c.parse()?, p.parse()?, read);
        }
        Ok(summary)
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn list_deliveries(
        &self,
        user_id: DbId,
        notification_id: DbId,
    ) -> StoreResult<Vec<ChannelDelivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM channel_deliveries \
             WHERE notification_id = $1 \
               AND EXISTS (SELECT 1 FROM notifications n WHERE n.id = $1 AND n.user_id = $2) \
             ORDER BY channel"
        ))
        .bind(notification_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(ChannelDelivery::try_from).collect()
    }

    async fn update_delivery_status(
        &self,
        notification_id: DbId,
        channel: Channel,
        status: DeliveryStatus,
        error_message: Option<String>,
        at: Timestamp,
    ) -> StoreResult<Option<ChannelDelivery>> {
        let from = DeliveryStatus::predecessors(status);
        if from.is_empty() {
            return Ok(None);
        }
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            "UPDATE channel_deliveries SET \
               status = $3::text, \
               sent_at = CASE WHEN $3::text = 'sent' THEN $5 ELSE sent_at END, \
               delivered_at = CASE WHEN $3::text = 'delivered' THEN $5 ELSE delivered_at END, \
               failed_at = CASE WHEN $3::text IN ('failed', 'bounced') THEN $5 ELSE failed_at END, \
               error_message = CASE WHEN $3::text IN ('failed', 'bounced') THEN $4 ELSE error_message END \
             WHERE notification_id = $1 AND channel = $2 AND status = ANY($6) \
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(notification_id)
        .bind(channel.as_str())
        .bind(status.as_str())
        .bind(error_message)
        .bind(at)
        .bind(to_text(&from))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(ChannelDelivery::try_from).transpose()
    }

    async fn count_sent_since(
        &self,
        user_id: DbId,
        channel: Channel,
        since: Timestamp,
    ) -> StoreResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_deliveries d \
             JOIN notifications n ON n.id = d.notification_id \
             WHERE n.user_id = $1 AND d.channel = $2 \
               AND d.status IN ('sent', 'delivered') \
               AND COALESCE(d.sent_at, d.delivered_at) >= $3",
        )
        .bind(user_id)
        .bind(channel.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[async_trait]
impl PreferenceStore for PgStore {
    async fn get_preferences(&self, user_id: DbId) -> StoreResult<Option<Preferences>> {
        let row: Option<PreferencesRow> = sqlx::query_as(&format!(
            "SELECT {PREFERENCE_COLUMNS} FROM notification_preferences WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(Preferences::try_from).transpose()
    }

    async fn upsert_preferences(&self, prefs: &Preferences) -> StoreResult<Preferences> {
        let matrix = serde_json::to_value(&prefs.channel_matrix)
            .map_err(|e| StoreError::Decode(format!("channel_matrix: {e}")))?;
        let row: PreferencesRow = sqlx::query_as(&format!(
            "INSERT INTO notification_preferences \
             (user_id, email_enabled, push_enabled, sms_enabled, channel_matrix, priority_filter, \
              quiet_hours_enabled, quiet_hours_start, quiet_hours_end, timezone, \
              max_notifications_per_hour, digest_enabled, digest_frequency, digest_last_sent_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (user_id) DO UPDATE SET \
               email_enabled = EXCLUDED.email_enabled, \
               push_enabled = EXCLUDED.push_enabled, \
               sms_enabled = EXCLUDED.sms_enabled, \
               channel_matrix = EXCLUDED.channel_matrix, \
               priority_filter = EXCLUDED.priority_filter, \
               quiet_hours_enabled = EXCLUDED.quiet_hours_enabled, \
               quiet_hours_start = EXCLUDED.quiet_hours_start, \
               quiet_hours_end = EXCLUDED.quiet_hours_end, \
               timezone = EXCLUDED.timezone, \
               max_notifications_per_hour = EXCLUDED.max_notifications_per_hour, \
               digest_enabled = EXCLUDED.digest_enabled, \
               digest_frequency = EXCLUDED.digest_frequency, \
               digest_last_sent_at = EXCLUDED.digest_last_sent_at, \
               updated_at = NOW() \
             RETURNING {PREFERENCE_COLUMNS}"
        ))
        .bind(prefs.user_id)
        .bind(prefs.email_enabled)
        .bind(prefs.push_enabled)
        .bind(prefs.sms_enabled)
        .bind(matrix)
        .bind(to_text(&prefs.priority_filter))
        .bind(prefs.quiet_hours_enabled)
        .bind(prefs.quiet_hours_start)
        .bind(prefs.quiet_hours_end)
        .bind(&prefs.timezone)
        .bind(i32::try_from(prefs.max_notifications_per_hour).unwrap_or(i32::MAX))
        .bind(prefs.digest_enabled)
        .bind(prefs.digest_frequency.as_str())
        .bind(prefs.digest_last_sent_at)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Preferences::try_from(row)
    }

    async fn digest_due(&self, now: Timestamp) -> StoreResult<Vec<Preferences>> {
        let rows: Vec<PreferencesRow> = sqlx::query_as(&format!(
            "SELECT {PREFERENCE_COLUMNS} FROM notification_preferences \
             WHERE digest_enabled = true ORDER BY user_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut due = Vec::new();
        for row in rows {
            let prefs = Preferences::try_from(row)?;
            if prefs.digest_due(now) {
                due.push(prefs);
            }
        }
        Ok(due)
    }

    async fn mark_digest_sent(&self, user_id: DbId, at: Timestamp) -> StoreResult<()> {
        sqlx::query(
            "UPDATE notification_preferences \
             SET digest_last_sent_at = $2, updated_at = NOW() \
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryStore for PgStore {
    async fn contact(&self, user_id: DbId) -> StoreResult<Option<Contact>> {
        let row: Option<(DbId, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT user_id, email, phone FROM user_contacts WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        Ok(row.map(|(user_id, email, phone)| Contact {
            user_id,
            email,
            phone,
        }))
    }

    async fn company_members(&self, company_id: DbId) -> StoreResult<Vec<DbId>> {
        sqlx::query_scalar(
            "SELECT user_id FROM company_members WHERE company_id = $1 ORDER BY user_id",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }
}

#[async_trait]
impl TemplateStore for PgStore {
    async fn template(&self, key: &str) -> StoreResult<Option<NotificationTemplate>> {
        let row: Option<TemplateRow> = sqlx::query_as(
            "SELECT key, title_template, message_template, type, category, priority, channels \
             FROM notification_templates WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(NotificationTemplate::try_from).transpose()
    }
}
