//! Per-user notification preferences and recipient contact data.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::channels::Channel;
use crate::notification::{Category, Priority};
use crate::types::{DbId, Timestamp};

/// Default cap for push notifications in a trailing hour.
pub const DEFAULT_MAX_PER_HOUR: u32 = 10;

/// Default quiet-hours window, applied only once enabled.
pub const DEFAULT_QUIET_START: (u32, u32) = (22, 0);
pub const DEFAULT_QUIET_END: (u32, u32) = (8, 0);

/// Timezone assumed when a preference row does not name one.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Category x channel allow matrix. A missing entry means "not allowed".
pub type ChannelMatrix = BTreeMap<Category, BTreeMap<Channel, bool>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    Daily,
    Weekly,
}

impl DigestFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestFrequency::Daily => "daily",
            DigestFrequency::Weekly => "weekly",
        }
    }

    pub fn period(self) -> chrono::Duration {
        match self {
            DigestFrequency::Daily => chrono::Duration::days(1),
            DigestFrequency::Weekly => chrono::Duration::weeks(1),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(DigestFrequency::Daily),
            "weekly" => Some(DigestFrequency::Weekly),
            _ => None,
        }
    }
}

/// A row from the `notification_preferences` table.
///
/// Only ever written as a whole document (last writer wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub user_id: DbId,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub sms_enabled: bool,
    pub channel_matrix: ChannelMatrix,
    pub priority_filter: BTreeSet<Priority>,
    pub quiet_hours_enabled: bool,
    pub quiet_hours_start: NaiveTime,
    pub quiet_hours_end: NaiveTime,
    pub timezone: String,
    pub max_notifications_per_hour: u32,
    pub digest_enabled: bool,
    pub digest_frequency: DigestFrequency,
    pub digest_last_sent_at: Option<Timestamp>,
}

impl Preferences {
    /// Preferences assumed for a user with no stored row.
    pub fn defaults_for(user_id: DbId) -> Self {
        let all_allowed: ChannelMatrix = Category::ALL
            .iter()
            .map(|&category| {
                let row = Channel::CONTACTABLE.iter().map(|&ch| (ch, true)).collect();
                (category, row)
            })
            .collect();

        Self {
            user_id,
            email_enabled: true,
            push_enabled: true,
            sms_enabled: false,
            channel_matrix: all_allowed,
            priority_filter: Priority::ALL.iter().copied().collect(),
            quiet_hours_enabled: false,
            quiet_hours_start: hm(DEFAULT_QUIET_START),
            quiet_hours_end: hm(DEFAULT_QUIET_END),
            timezone: DEFAULT_TIMEZONE.to_string(),
            max_notifications_per_hour: DEFAULT_MAX_PER_HOUR,
            digest_enabled: false,
            digest_frequency: DigestFrequency::Daily,
            digest_last_sent_at: None,
        }
    }

    /// Global on/off toggle for a channel. In-app cannot be disabled.
    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::InApp => true,
            Channel::Email => self.email_enabled,
            Channel::Push => self.push_enabled,
            Channel::Sms => self.sms_enabled,
        }
    }

    pub fn set_category_channel(&mut self, category: Category, channel: Channel, allowed: bool) {
        self.channel_matrix
            .entry(category)
            .or_default()
            .insert(channel, allowed);
    }

    /// Whether a digest is owed at `now`.
    pub fn digest_due(&self, now: Timestamp) -> bool {
        if !self.digest_enabled {
            return false;
        }
        match self.digest_last_sent_at {
            None => true,
            Some(last) => now - last >= self.digest_frequency.period(),
        }
    }
}

fn hm((h, m): (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

/// Partial preference edit from the UI, merged client-side into a full
/// document before the upsert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferencesUpdate {
    pub email_enabled: Option<bool>,
    pub push_enabled: Option<bool>,
    pub sms_enabled: Option<bool>,
    pub channel_matrix: Option<ChannelMatrix>,
    pub priority_filter: Option<BTreeSet<Priority>>,
    pub quiet_hours_enabled: Option<bool>,
    pub quiet_hours_start: Option<NaiveTime>,
    pub quiet_hours_end: Option<NaiveTime>,
    pub timezone: Option<String>,
    pub max_notifications_per_hour: Option<u32>,
    pub digest_enabled: Option<bool>,
    pub digest_frequency: Option<DigestFrequency>,
}

impl PreferencesUpdate {
    pub fn apply_to(&self, prefs: &mut Preferences) {
        if let Some(v) = self.email_enabled {
            prefs.email_enabled = v;
        }
        if let Some(v) = self.push_enabled {
            prefs.push_enabled = v;
        }
        if let Some(v) = self.sms_enabled {
            prefs.sms_enabled = v;
        }
        if let Some(v) = &self.channel_matrix {
            prefs.channel_matrix.clone_from(v);
        }
        if let Some(v) = &self.priority_filter {
            prefs.priority_filter.clone_from(v);
        }
        if let Some(v) = self.quiet_hours_enabled {
            prefs.quiet_hours_enabled = v;
        }
        if let Some(v) = self.quiet_hours_start {
            prefs.quiet_hours_start = v;
        }
        if let Some(v) = self.quiet_hours_end {
            prefs.quiet_hours_end = v;
        }
        if let Some(v) = &self.timezone {
            prefs.timezone.clone_from(v);
        }
        if let Some(v) = self.max_notifications_per_hour {
            prefs.max_notifications_per_hour = v;
        }
        if let Some(v) = self.digest_enabled {
            prefs.digest_enabled = v;
        }
        if let Some(v) = self.digest_frequency {
            prefs.digest_frequency = v;
        }
    }
}

/// Recipient directory entry used by the delivery orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: DbId,
    pub email: Option<String>,
    pub phone: Option<String>,
}
