//! Delivery channel names.
//!
//! The string forms must match the values stored in `notifications.channels`
//! and `channel_deliveries.channel`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// In-app notification, satisfied by the notification row itself.
pub const CHANNEL_IN_APP: &str = "in_app";

/// Email notification delivered via SMTP.
pub const CHANNEL_EMAIL: &str = "email";

/// Push notification shown by the client-side push service.
pub const CHANNEL_PUSH: &str = "push";

/// SMS notification delivered via the SMS provider.
pub const CHANNEL_SMS: &str = "sms";

/// A delivery mechanism for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Push,
    Sms,
}

impl Channel {
    /// Every channel, in dispatch order.
    pub const ALL: [Channel; 4] = [Channel::InApp, Channel::Email, Channel::Push, Channel::Sms];

    /// Channels that leave the application and are subject to preferences.
    pub const CONTACTABLE: [Channel; 3] = [Channel::Email, Channel::Push, Channel::Sms];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::InApp => CHANNEL_IN_APP,
            Channel::Email => CHANNEL_EMAIL,
            Channel::Push => CHANNEL_PUSH,
            Channel::Sms => CHANNEL_SMS,
        }
    }

    /// Whether dispatch needs recipient contact data (email address, phone).
    pub fn needs_contact(self) -> bool {
        matches!(self, Channel::Email | Channel::Sms)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            CHANNEL_IN_APP => Ok(Channel::InApp),
            CHANNEL_EMAIL => Ok(Channel::Email),
            CHANNEL_PUSH => Ok(Channel::Push),
            CHANNEL_SMS => Ok(Channel::Sms),
            other => Err(CoreError::unknown("channel", other)),
        }
    }
}
