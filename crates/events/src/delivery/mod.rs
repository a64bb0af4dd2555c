//! External delivery channels.
//!
//! The orchestrator only depends on the capability traits defined here;
//! [`email`], [`sms`] and [`push`] hold the concrete transports.

pub mod email;
pub mod push;
pub mod sms;

use async_trait::async_trait;
use beacon_core::notification::{Notification, Priority};

pub use email::{EmailConfig, EmailError, SmtpEmailSender};
pub use push::{PushOutcome, PushPayload, PushRelayConfig, PushService, RelayNotifier};
pub use sms::{format_sms, HttpSmsSender, SmsConfig, SmsError, SMS_MAX_LEN};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type shared by every sender capability.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Email(#[from] EmailError),

    #[error(transparent)]
    Sms(#[from] SmsError),

    #[error("Push delivery failed: {0}")]
    Push(String),

    /// The transport accepted the call but refused the message.
    #[error("Message rejected: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Email content for a single recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub action_url: Option<String>,
}

impl EmailMessage {
    /// Build the notification email: title as subject (tagged for high and
    /// urgent priority), message as body, followed by the action link.
    pub fn for_notification(to: impl Into<String>, notification: &Notification) -> Self {
        let subject = match notification.priority {
            Priority::High | Priority::Urgent => format!(
                "[{}] {}",
                notification.priority.as_str().to_uppercase(),
                notification.title
            ),
            Priority::Low | Priority::Medium => notification.title.clone(),
        };
        let mut body = notification.message.clone();
        if let Some(url) = &notification.action_url {
            body.push_str("\n\nView: ");
            body.push_str(url);
        }
        Self {
            to: to.into(),
            subject,
            body,
            priority: notification.priority,
            action_url: notification.action_url.clone(),
        }
    }
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_sms(&self, to: &str, text: &str) -> Result<(), DeliveryError>;
}

/// Displays a notification on the user's device. Returns the platform's
/// notification id when one is assigned.
#[async_trait]
pub trait LocalNotifier: Send + Sync {
    async fn show_local_notification(
        &self,
        payload: &PushPayload,
    ) -> Result<Option<String>, DeliveryError>;
}

#[cfg(test)]
mod tests {
    use beacon_core::notification::NotificationDraft;
    use chrono::Utc;

    use super::*;

    fn notification(priority: Priority, action_url: Option<&str>) -> Notification {
        let draft = NotificationDraft::for_user(1, "Invoice overdue", "Invoice #7 is 3 days late")
            .with_priority(priority);
        Notification {
            id: 1,
            user_id: 1,
            company_id: None,
            company_wide: false,
            title: draft.title,
            message: draft.message,
            notification_type: draft.notification_type,
            category: draft.category,
            priority,
            channels: draft.channels,
            read: false,
            dismissed_at: None,
            clicked_at: None,
            metadata: draft.metadata,
            expires_at: None,
            source_type: None,
            source_id: None,
            action_url: action_url.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn urgent_email_subject_is_tagged() {
        let msg = EmailMessage::for_notification("a@b.c", &notification(Priority::Urgent, None));
        assert_eq!(msg.subject, "[URGENT] Invoice overdue");
        assert_eq!(msg.body, "Invoice #7 is 3 days late");
    }

    #[test]
    fn email_body_carries_action_link() {
        let msg = EmailMessage::for_notification(
            "a@b.c",
            &notification(Priority::Low, Some("https://app.example.com/invoices/7")),
        );
        assert_eq!(msg.subject, "Invoice overdue");
        assert!(msg.body.ends_with("View: https://app.example.com/invoices/7"));
    }
}
