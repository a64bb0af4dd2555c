//! Digest notification scheduler.
//!
//! [`DigestScheduler`] runs as a background task, periodically checking for
//! users whose digest is due, emailing a summary of what they have not read
//! since the previous digest, and stamping `digest_last_sent_at`.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::notification::{Notification, NotificationQuery, Priority};
use beacon_core::preferences::Preferences;
use beacon_core::store::{RecordStore, StoreError};
use beacon_core::types::Timestamp;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::delivery::{DeliveryError, EmailMessage, EmailSender};

/// Default interval between digest sweeps.
pub const DEFAULT_DIGEST_INTERVAL: Duration = Duration::from_secs(3600);

/// Most notifications listed in one digest.
const DIGEST_MAX_ITEMS: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// What happened to one user's digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestOutcome {
    Sent { items: usize },
    NothingUnread,
    NoRecipient,
}

// ---------------------------------------------------------------------------
// DigestScheduler
// ---------------------------------------------------------------------------

pub struct DigestScheduler {
    store: Arc<dyn RecordStore>,
    email: Arc<dyn EmailSender>,
    interval: Duration,
}

impl DigestScheduler {
    pub fn new(store: Arc<dyn RecordStore>, email: Arc<dyn EmailSender>) -> Self {
        Self {
            store,
            email,
            interval: DEFAULT_DIGEST_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the scheduler loop until `cancel` fires. The first sweep runs
    /// immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Digest scheduler cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.process_digests(Utc::now()).await {
                        tracing::error!(error = %e, "Failed to process digests");
                    }
                }
            }
        }
    }

    /// Send every digest due at `now`. Returns how many were sent.
    pub async fn process_digests(&self, now: Timestamp) -> Result<usize, StoreError> {
        let due = self.store.digest_due(now).await?;
        let mut sent = 0;

        for prefs in &due {
            match self.send_digest(prefs, now).await {
                Ok(DigestOutcome::Sent { .. }) => sent += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(user_id = prefs.user_id, error = %e, "Failed to send digest for user");
                }
            }
        }

        if sent > 0 {
            tracing::info!(count = sent, "Processed digest deliveries");
        }
        Ok(sent)
    }

    /// Deliver one user's digest.
    pub async fn send_digest(&self, prefs: &Preferences, now: Timestamp) -> Result<DigestOutcome, DigestError> {
        let user_id = prefs.user_id;
        let query = NotificationQuery {
            read: Some(false),
            date_from: prefs.digest_last_sent_at,
            limit: DIGEST_MAX_ITEMS,
            ..Default::default()
        };
        let unread = self.store.query_notifications(user_id, &query).await?;
        if unread.is_empty() {
            return Ok(DigestOutcome::NothingUnread);
        }

        let Some(to) = self.store.contact(user_id).await?.and_then(|c| c.email) else {
            tracing::debug!(user_id, "No email address for digest");
            return Ok(DigestOutcome::NoRecipient);
        };

        self.email.send_email(&digest_email(to, &unread)).await?;
        self.store.mark_digest_sent(user_id, now).await?;

        tracing::info!(user_id, notification_count = unread.len(), "Digest delivered");
        Ok(DigestOutcome::Sent { items: unread.len() })
    }
}

fn digest_email(to: String, unread: &[Notification]) -> EmailMessage {
    let subject = match unread.len() {
        1 => "You have 1 unread notification".to_string(),
        n => format!("You have {n} unread notifications"),
    };
    let mut body = String::new();
    for n in unread {
        let _ = writeln!(body, "- [{}] {}: {}", n.priority, n.title, n.message);
    }
    let priority = unread
        .iter()
        .map(|n| n.priority)
        .max()
        .unwrap_or(Priority::Low);
    EmailMessage {
        to,
        subject,
        body,
        priority,
        action_url: None,
    }
}
