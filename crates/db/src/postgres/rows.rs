//! Row structs for the PostgreSQL store and their mapping onto domain types.
//!
//! Enum-valued columns are stored as TEXT and parsed on the way out, so a
//! bad value surfaces as [`StoreError::Decode`] instead of a panic.

use std::collections::BTreeSet;
use std::str::FromStr;

use beacon_core::channels::Channel;
use beacon_core::delivery::{ChannelDelivery, DeliveryStatus};
use beacon_core::notification::{Category, Notification, NotificationType, Priority};
use beacon_core::preferences::{ChannelMatrix, DigestFrequency, Preferences};
use beacon_core::store::StoreError;
use beacon_core::template::NotificationTemplate;
use beacon_core::types::{DbId, Metadata, Timestamp};
use chrono::NaiveTime;
use sqlx::FromRow;

/// Column list for `notifications` queries.
pub(crate) const NOTIFICATION_COLUMNS: &str = "id, user_id, company_id, company_wide, title, \
     message, type, category, priority, channels, read, dismissed_at, clicked_at, metadata, \
     expires_at, source_type, source_id, action_url, created_at, updated_at";

/// Column list for `channel_deliveries` queries.
pub(crate) const DELIVERY_COLUMNS: &str = "notification_id, channel, status, error_message, \
     created_at, sent_at, delivered_at, failed_at";

/// Column list for `notification_preferences` queries.
pub(crate) const PREFERENCE_COLUMNS: &str = "user_id, email_enabled, push_enabled, sms_enabled, \
     channel_matrix, priority_filter, quiet_hours_enabled, quiet_hours_start, quiet_hours_end, \
     timezone, max_notifications_per_hour, digest_enabled, digest_frequency, digest_last_sent_at";

fn parse<T>(value: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = beacon_core::CoreError>,
{
    value.parse::<T>().map_err(StoreError::from)
}

fn parse_all<T>(values: &[String]) -> Result<Vec<T>, StoreError>
where
    T: FromStr<Err = beacon_core::CoreError>,
{
    values.iter().map(|v| parse(v)).collect()
}

pub(crate) fn to_text<T: ToString>(values: impl IntoIterator<Item = T>) -> Vec<String> {
    values.into_iter().map(|v| v.to_string()).collect()
}

// ---------------------------------------------------------------------------
// notifications
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
pub(crate) struct NotificationRow {
    pub id: DbId,
    pub user_id: DbId,
    pub company_id: Option<DbId>,
    pub company_wide: bool,
    pub title: String,
    pub message: String,
    #[sqlx(rename = "type")]
    pub notification_type: String,
    pub category: String,
    pub priority: String,
    pub channels: Vec<String>,
    pub read: bool,
    pub dismissed_at: Option<Timestamp>,
    pub clicked_at: Option<Timestamp>,
    pub metadata: serde_json::Value,
    pub expires_at: Option<Timestamp>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub action_url: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let metadata: Metadata = match row.metadata {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => Metadata::new(),
            other => {
                return Err(StoreError::Decode(format!(
                    "notification {} metadata is not an object: {other}",
                    row.id
                )))
            }
        };
        Ok(Notification {
            id: row.id,
            user_id: row.user_id,
            company_id: row.company_id,
            company_wide: row.company_wide,
            title: row.title,
            message: row.message,
            notification_type: parse::<NotificationType>(&row.notification_type)?,
            category: parse::<Category>(&row.category)?,
            priority: parse::<Priority>(&row.priority)?,
            channels: parse_all::<Channel>(&row.channels)?,
            read: row.read,
            dismissed_at: row.dismissed_at,
            clicked_at: row.clicked_at,
            metadata,
            expires_at: row.expires_at,
            source_type: row.source_type,
            source_id: row.source_id,
            action_url: row.action_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// channel_deliveries
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
pub(crate) struct DeliveryRow {
    pub notification_id: DbId,
    pub channel: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub sent_at: Option<Timestamp>,
    pub delivered_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
}

impl TryFrom<DeliveryRow> for ChannelDelivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(ChannelDelivery {
            notification_id: row.notification_id,
            channel: parse::<Channel>(&row.channel)?,
            status: parse::<DeliveryStatus>(&row.status)?,
            error_message: row.error_message,
            created_at: row.created_at,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            failed_at: row.failed_at,
        })
    }
}

// ---------------------------------------------------------------------------
// notification_preferences
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
pub(crate) struct PreferencesRow {
    pub user_id: DbId,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub sms_enabled: bool,
    pub channel_matrix: serde_json::Value,
    pub priority_filter: Vec<String>,
    pub quiet_hours_enabled: bool,
    pub quiet_hours_start: NaiveTime,
    pub quiet_hours_end: NaiveTime,
    pub timezone: String,
    pub max_notifications_per_hour: i32,
    pub digest_enabled: bool,
    pub digest_frequency: String,
    pub digest_last_sent_at: Option<Timestamp>,
}

impl TryFrom<PreferencesRow> for Preferences {
    type Error = StoreError;

    fn try_from(row: PreferencesRow) -> Result<Self, Self::Error> {
        let channel_matrix: ChannelMatrix = serde_json::from_value(row.channel_matrix)
            .map_err(|e| StoreError::Decode(format!("channel_matrix: {e}")))?;
        let priority_filter: BTreeSet<Priority> =
            parse_all::<Priority>(&row.priority_filter)?.into_iter().collect();
        let digest_frequency = DigestFrequency::parse(&row.digest_frequency).ok_or_else(|| {
            StoreError::Decode(format!("unknown digest frequency: {}", row.digest_frequency))
        })?;

        Ok(Preferences {
            user_id: row.user_id,
            email_enabled: row.email_enabled,
            push_enabled: row.push_enabled,
            sms_enabled: row.sms_enabled,
            channel_matrix,
            priority_filter,
            quiet_hours_enabled: row.quiet_hours_enabled,
            quiet_hours_start: row.quiet_hours_start,
            quiet_hours_end: row.quiet_hours_end,
            timezone: row.timezone,
            max_notifications_per_hour: u32::try_from(row.max_notifications_per_hour)
                .unwrap_or_default(),
            digest_enabled: row.digest_enabled,
            digest_frequency,
            digest_last_sent_at: row.digest_last_sent_at,
        })
    }
}

// ---------------------------------------------------------------------------
// notification_templates
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
pub(crate) struct TemplateRow {
    pub key: String,
    pub title_template: String,
    pub message_template: String,
    #[sqlx(rename = "type")]
    pub notification_type: String,
    pub category: String,
    pub priority: String,
    pub channels: Vec<String>,
}

impl TryFrom<TemplateRow> for NotificationTemplate {
    type Error = StoreError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        Ok(NotificationTemplate {
            key: row.key,
            title_template: row.title_template,
            message_template: row.message_template,
            notification_type: parse::<NotificationType>(&row.notification_type)?,
            category: parse::<Category>(&row.category)?,
            priority: parse::<Priority>(&row.priority)?,
            channels: parse_all::<Channel>(&row.channels)?,
        })
    }
}
