//! Notification records, drafts, partial updates and list queries.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use validator::Validate;

use crate::channels::Channel;
use crate::error::CoreError;
use crate::types::{DbId, Metadata, Timestamp};

/// Default page size for notification list queries.
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Declares a snake_case string enum with `as_str`, `ALL`, `Display` and
/// `FromStr` so the store layer can map it to a TEXT column.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CoreError::unknown($kind, other)),
                }
            }
        }
    };
}

string_enum!(
    /// Visual classification of a notification.
    NotificationType, "notification type" {
        Info => "info",
        Success => "success",
        Warning => "warning",
        Error => "error",
        System => "system",
    }
);

string_enum!(
    /// Functional area a notification originates from. Drives the
    /// category x channel preference matrix.
    Category, "category" {
        Project => "project",
        Task => "task",
        Invoice => "invoice",
        System => "system",
        Chat => "chat",
        Comment => "comment",
        File => "file",
        Milestone => "milestone",
        Deadline => "deadline",
        Integration => "integration",
    }
);

string_enum!(
    /// Urgency of a notification, filtered by `Preferences::priority_filter`.
    Priority, "priority" {
        Low => "low",
        Medium => "medium",
        High => "high",
        Urgent => "urgent",
    }
);

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// A row from the `notifications` table.
///
/// A row always belongs to exactly one user. Company-wide notifications are
/// stored as one independent row per member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: DbId,
    pub user_id: DbId,
    #[serde(default)]
    pub company_id: Option<DbId>,
    #[serde(default)]
    pub company_wide: bool,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: Category,
    pub priority: Priority,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub dismissed_at: Option<Timestamp>,
    #[serde(default)]
    pub clicked_at: Option<Timestamp>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub action_url: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Notification {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// NotificationDraft
// ---------------------------------------------------------------------------

/// Producer-side input for creating a notification.
///
/// Either targets a single `user_id`, or (with `company_wide`) every member
/// of `company_id`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NotificationDraft {
    pub user_id: Option<DbId>,
    pub company_id: Option<DbId>,
    #[serde(default)]
    pub company_wide: bool,
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    #[validate(length(min = 1))]
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: Category,
    pub priority: Priority,
    #[validate(length(min = 1))]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub metadata: Metadata,
    pub expires_at: Option<Timestamp>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    #[validate(url)]
    pub action_url: Option<String>,
}

impl NotificationDraft {
    /// Draft an in-app, medium priority `info`/`system` notification for one user.
    pub fn for_user(user_id: DbId, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            company_id: None,
            company_wide: false,
            title: title.into(),
            message: message.into(),
            notification_type: NotificationType::Info,
            category: Category::System,
            priority: Priority::Medium,
            channels: vec![Channel::InApp],
            metadata: Metadata::new(),
            expires_at: None,
            source_type: None,
            source_id: None,
            action_url: None,
        }
    }

    /// Draft a notification for every member of a company.
    pub fn for_company(company_id: DbId, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: None,
            company_id: Some(company_id),
            company_wide: true,
            ..Self::for_user(0, title, message)
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = Channel>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_type(mut self, notification_type: NotificationType) -> Self {
        self.notification_type = notification_type;
        self
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    pub fn with_source(mut self, source_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_expiry(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Field validation plus the ownership rules the derive cannot express.
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()?;
        if self.company_wide {
            if self.company_id.is_none() {
                return Err(CoreError::Validation(
                    "company-wide notifications require a company_id".into(),
                ));
            }
        } else if self.user_id.is_none() {
            return Err(CoreError::Validation(
                "notification must target a user_id unless company_wide is set".into(),
            ));
        }
        Ok(())
    }

    /// Requested channels with duplicates removed, in stable order.
    pub fn normalized_channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// NotificationPatch
// ---------------------------------------------------------------------------

/// Partial update for a notification, keyed by id.
///
/// Absent fields are left untouched when merged, so change-feed payloads
/// that only carry the modified columns are tolerated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPatch {
    pub id: DbId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<NotificationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub dismissed_at: Option<Option<Timestamp>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub clicked_at: Option<Option<Timestamp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub action_url: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

/// Distinguishes an explicit `null` (`Some(None)`) from an absent field (`None`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl NotificationPatch {
    /// Mark as read, stamping `clicked_at`.
    pub fn read(id: DbId, at: Timestamp) -> Self {
        Self {
            id,
            read: Some(true),
            clicked_at: Some(Some(at)),
            ..Default::default()
        }
    }

    /// Stamp `dismissed_at`, leaving the row in the list.
    pub fn dismissed(id: DbId, at: Timestamp) -> Self {
        Self {
            id,
            dismissed_at: Some(Some(at)),
            ..Default::default()
        }
    }

    /// Merge the present fields into `target`.
    pub fn apply_to(&self, target: &mut Notification) {
        if let Some(title) = &self.title {
            target.title.clone_from(title);
        }
        if let Some(message) = &self.message {
            target.message.clone_from(message);
        }
        if let Some(t) = self.notification_type {
            target.notification_type = t;
        }
        if let Some(c) = self.category {
            target.category = c;
        }
        if let Some(p) = self.priority {
            target.priority = p;
        }
        if let Some(read) = self.read {
            target.read = read;
        }
        if let Some(dismissed_at) = self.dismissed_at {
            target.dismissed_at = dismissed_at;
        }
        if let Some(clicked_at) = self.clicked_at {
            target.clicked_at = clicked_at;
        }
        if let Some(metadata) = &self.metadata {
            target.metadata.clone_from(metadata);
        }
        if let Some(action_url) = &self.action_url {
            target.action_url.clone_from(action_url);
        }
        if let Some(updated_at) = self.updated_at {
            target.updated_at = updated_at;
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationQuery
// ---------------------------------------------------------------------------

/// Filters and pagination for listing a user's notifications.
///
/// Empty `types` / `categories` / `priorities` mean "any".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationQuery {
    pub read: Option<bool>,
    #[serde(default)]
    pub types: Vec<NotificationType>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub priorities: Vec<Priority>,
    pub date_from: Option<Timestamp>,
    pub date_to: Option<Timestamp>,
    pub limit: i64,
    pub offset: i64,
    #[serde(default)]
    pub include_expired: bool,
}

impl Default for NotificationQuery {
    fn default() -> Self {
        Self {
            read: None,
            types: Vec::new(),
            categories: Vec::new(),
            priorities: Vec::new(),
            date_from: None,
            date_to: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
            include_expired: false,
        }
    }
}

impl NotificationQuery {
    pub fn unread() -> Self {
        Self {
            read: Some(false),
            ..Default::default()
        }
    }

    /// Evaluate the non-pagination predicates against a single row.
    pub fn matches(&self, n: &Notification, now: Timestamp) -> bool {
        if let Some(read) = self.read {
            if n.read != read {
                return false;
            }
        }
        if !self.types.is_empty() && !self.types.contains(&n.notification_type) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&n.category) {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&n.priority) {
            return false;
        }
        if self.date_from.is_some_and(|from| n.created_at < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| n.created_at > to) {
            return false;
        }
        self.include_expired || !n.is_expired(now)
    }
}

// ---------------------------------------------------------------------------
// NotificationSummary
// ---------------------------------------------------------------------------

/// Aggregate counts over a user's notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSummary {
    pub total: usize,
    pub unread: usize,
    pub urgent_unread: usize,
    pub by_type: BTreeMap<NotificationType, usize>,
    pub by_category: BTreeMap<Category, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
}

impl NotificationSummary {
    pub fn from_notifications<'a>(notifications: impl IntoIterator<Item = &'a Notification>) -> Self {
        let mut summary = Self::default();
        for n in notifications {
            summary.record(n.notification_type, n.category, n.priority, n.read);
        }
        summary
    }

    /// Count a single row. Exposed so stores can aggregate projected columns.
    pub fn record(&mut self, t: NotificationType, c: Category, p: Priority, read: bool) {
        self.total += 1;
        if !read {
            self.unread += 1;
            if p == Priority::Urgent {
                self.urgent_unread += 1;
            }
        }
        *self.by_type.entry(t).or_default() += 1;
        *self.by_category.entry(c).or_default() += 1;
        *self.by_priority.entry(p).or_default() += 1;
    }
}
