//! Per-channel delivery rows and the delivery status state machine.
//!
//! One [`ChannelDelivery`] row exists per requested channel of a
//! notification. Status only moves forward:
//!
//! ```text
//! pending -> sent -> delivered
//!    |        \---> bounced
//!    +-> delivered
//!    +-> failed
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::channels::Channel;
use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Bounced,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Bounced => "bounced",
        }
    }

    /// Statuses reachable from `self` in one step.
    ///
    /// Terminal states (Delivered, Failed, Bounced) return an empty slice.
    pub fn valid_transitions(self) -> &'static [DeliveryStatus] {
        use DeliveryStatus::*;
        match self {
            Pending => &[Sent, Delivered, Failed],
            Sent => &[Delivered, Bounced],
            Delivered | Failed | Bounced => &[],
        }
    }

    pub fn can_transition(self, to: DeliveryStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Statuses from which `to` may be entered; used to scope store updates.
    pub fn predecessors(to: DeliveryStatus) -> Vec<DeliveryStatus> {
        [
            DeliveryStatus::Pending,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::Bounced,
        ]
        .into_iter()
        .filter(|from| from.can_transition(to))
        .collect()
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    pub fn validate_transition(self, to: DeliveryStatus) -> Result<(), CoreError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "bounced" => Ok(DeliveryStatus::Bounced),
            other => Err(CoreError::unknown("delivery status", other)),
        }
    }
}

/// A row from the `channel_deliveries` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub notification_id: DbId,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub sent_at: Option<Timestamp>,
    pub delivered_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
}

impl ChannelDelivery {
    /// A fresh `pending` row, created alongside its notification.
    pub fn pending(notification_id: DbId, channel: Channel, at: Timestamp) -> Self {
        Self {
            notification_id,
            channel,
            status: DeliveryStatus::Pending,
            error_message: None,
            created_at: at,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
        }
    }

    /// Move to `to`, stamping the matching transition timestamp.
    pub fn advance(
        &mut self,
        to: DeliveryStatus,
        error_message: Option<String>,
        at: Timestamp,
    ) -> Result<(), CoreError> {
        self.status.validate_transition(to)?;
        self.status = to;
        match to {
            DeliveryStatus::Sent => self.sent_at = Some(at),
            DeliveryStatus::Delivered => self.delivered_at = Some(at),
            DeliveryStatus::Failed | DeliveryStatus::Bounced => {
                self.failed_at = Some(at);
                self.error_message = error_message;
            }
            DeliveryStatus::Pending => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;
    use DeliveryStatus::*;

    #[test]
    fn pending_moves_to_sent_delivered_or_failed() {
        assert!(Pending.can_transition(Sent));
        assert!(Pending.can_transition(Delivered));
        assert!(Pending.can_transition(Failed));
        assert!(!Pending.can_transition(Bounced));
    }

    #[test]
    fn sent_moves_to_delivered_or_bounced() {
        assert!(Sent.can_transition(Delivered));
        assert!(Sent.can_transition(Bounced));
        assert!(!Sent.can_transition(Pending));
    }

    #[test]
    fn terminal_states_never_move() {
        for status in [Delivered, Failed, Bounced] {
            assert!(status.is_terminal());
            assert!(!status.can_transition(Pending));
        }
    }

    #[test]
    fn same_state_write_is_rejected() {
        assert_matches!(
            Sent.validate_transition(Sent),
            Err(CoreError::InvalidTransition { .. })
        );
    }

    #[test]
    fn predecessors_of_delivered() {
        assert_eq!(DeliveryStatus::predecessors(Delivered), vec![Pending, Sent]);
    }

    #[test]
    fn advance_stamps_timestamps_and_error() {
        let now = Utc::now();
        let mut row = ChannelDelivery::pending(1, Channel::Sms, now);
        row.advance(Failed, Some("no phone number".into()), now).unwrap();
        assert_eq!(row.status, Failed);
        assert_eq!(row.failed_at, Some(now));
        assert_eq!(row.error_message.as_deref(), Some("no phone number"));
        assert!(row.advance(Delivered, None, now).is_err());
    }
}
