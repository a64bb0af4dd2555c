//! Delivery orchestrator.
//!
//! [`DeliveryOrchestrator::dispatch`] takes a persisted notification,
//! resolves the recipient's contact data and preferences once, then sends
//! every still-pending channel concurrently and records each outcome on its
//! `channel_deliveries` row. One channel's failure never blocks another.
//!
//! A channel denied by the recipient's preferences is left `pending`, so a
//! later dispatch of the same notification (a replayed INSERT after a feed
//! reconnect, for example) evaluates the gate again and sends if it now
//! allows the channel. Quiet hours that have ended no longer hold back a push.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use beacon_core::channels::Channel;
use beacon_core::delivery::DeliveryStatus;
use beacon_core::notification::Notification;
use beacon_core::policy::{self, DenyReason, GateDecision};
use beacon_core::preferences::{Contact, Preferences};
use beacon_core::store::{RecordStore, StoreError};
use beacon_core::types::{DbId, Timestamp};
use chrono::Utc;
use futures::future::join_all;

use crate::delivery::{
    format_sms, EmailMessage, EmailSender, PushPayload, PushService, SmsSender,
};

/// What happened to one channel during a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Delivered,
    Sent,
    Failed(String),
    /// Denied by policy; the row stays `pending`.
    Skipped(DenyReason),
    /// The row had already left `pending`, nothing was sent.
    AlreadyProcessed(DeliveryStatus),
}

impl ChannelOutcome {
    /// Status persisted for this outcome, if any.
    fn status(&self) -> Option<(DeliveryStatus, Option<String>)> {
        match self {
            ChannelOutcome::Delivered => Some((DeliveryStatus::Delivered, None)),
            ChannelOutcome::Sent => Some((DeliveryStatus::Sent, None)),
            ChannelOutcome::Failed(reason) => Some((DeliveryStatus::Failed, Some(reason.clone()))),
            ChannelOutcome::Skipped(_) | ChannelOutcome::AlreadyProcessed(_) => None,
        }
    }
}

/// Per-channel results of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub notification_id: DbId,
    pub outcomes: BTreeMap<Channel, ChannelOutcome>,
}

impl DeliveryReport {
    pub fn outcome(&self, channel: Channel) -> Option<&ChannelOutcome> {
        self.outcomes.get(&channel)
    }

    pub fn failed_channels(&self) -> Vec<Channel> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ChannelOutcome::Failed(_)))
            .map(|(&ch, _)| ch)
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything resolved once per dispatch and shared by the channel branches.
struct DispatchContext {
    prefs: Result<Preferences, String>,
    contact: Result<Option<Contact>, String>,
    recent_push: Result<u32, String>,
    now: Timestamp,
}

pub struct DeliveryOrchestrator {
    store: Arc<dyn RecordStore>,
    email: Option<Arc<dyn EmailSender>>,
    sms: Option<Arc<dyn SmsSender>>,
    push: Option<Arc<PushService>>,
}

impl DeliveryOrchestrator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            email: None,
            sms: None,
            push: None,
        }
    }

    pub fn with_email(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email = Some(sender);
        self
    }

    pub fn with_sms(mut self, sender: Arc<dyn SmsSender>) -> Self {
        self.sms = Some(sender);
        self
    }

    pub fn with_push(mut self, push: Arc<PushService>) -> Self {
        self.push = Some(push);
        self
    }

    /// Send every pending channel of `notification` and record the outcomes.
    ///
    /// Only fails when the delivery rows cannot be read; per-channel
    /// problems are reported in the returned [`DeliveryReport`].
    #[tracing::instrument(skip_all, fields(notification_id = notification.id, user_id = notification.user_id))]
    pub async fn dispatch(&self, notification: &Notification) -> Result<DeliveryReport, DispatchError> {
        let rows: HashMap<Channel, DeliveryStatus> = self
            .store
            .list_deliveries(notification.user_id, notification.id)
            .await?
            .into_iter()
            .map(|d| (d.channel, d.status))
            .collect();

        let mut outcomes = BTreeMap::new();
        let mut pending = Vec::new();
        for &channel in &notification.channels {
            match rows.get(&channel) {
                Some(DeliveryStatus::Pending) => pending.push(channel),
                Some(&status) => {
                    outcomes.insert(channel, ChannelOutcome::AlreadyProcessed(status));
                }
                None => {
                    tracing::warn!(channel = %channel, "No delivery row for requested channel");
                }
            }
        }

        if pending.is_empty() {
            tracing::debug!("Nothing pending, dispatch skipped");
            return Ok(DeliveryReport {
                notification_id: notification.id,
                outcomes,
            });
        }

        let ctx = self.resolve_context(notification, &pending).await;

        let results = join_all(pending.iter().map(|&channel| {
            let ctx = &ctx;
            async move {
                let outcome = self.deliver_channel(notification, channel, ctx).await;
                let outcome = self.record(notification.id, channel, outcome, ctx.now).await;
                (channel, outcome)
            }
        }))
        .await;
        outcomes.extend(results);

        let report = DeliveryReport {
            notification_id: notification.id,
            outcomes,
        };
        let failed = report.failed_channels();
        if failed.is_empty() {
            tracing::info!("Notification dispatched");
        } else {
            tracing::warn!(failed = ?failed, "Notification dispatched with failed channels");
        }
        Ok(report)
    }

    // ---- private helpers ----

    async fn resolve_context(&self, notification: &Notification, pending: &[Channel]) -> DispatchContext {
        let now = Utc::now();
        let user_id = notification.user_id;

        let prefs = match self.store.get_preferences(user_id).await {
            Ok(prefs) => Ok(prefs.unwrap_or_else(|| Preferences::defaults_for(user_id))),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load preferences");
                Err(format!("preferences unavailable: {e}"))
            }
        };

        let contact = if pending.iter().any(|ch| ch.needs_contact()) {
            self.store.contact(user_id).await.map_err(|e| {
                tracing::error!(error = %e, "Contact lookup failed");
                format!("contact lookup failed: {e}")
            })
        } else {
            Ok(None)
        };

        let recent_push = if pending.contains(&Channel::Push) {
            self.store
                .count_sent_since(user_id, Channel::Push, policy::rate_limit_window_start(now))
                .await
                .map_err(|e| format!("push history unavailable: {e}"))
        } else {
            Ok(0)
        };

        DispatchContext {
            prefs,
            contact,
            recent_push,
            now,
        }
    }

    async fn deliver_channel(
        &self,
        notification: &Notification,
        channel: Channel,
        ctx: &DispatchContext,
    ) -> ChannelOutcome {
        if channel == Channel::InApp {
            return ChannelOutcome::Delivered;
        }

        // Contact problems fail the channel before any policy is consulted.
        let contact = match &ctx.contact {
            Ok(contact) => contact.as_ref(),
            Err(reason) if channel.needs_contact() => return ChannelOutcome::Failed(reason.clone()),
            Err(_) => None,
        };
        let address = match channel {
            Channel::Email => match contact.and_then(|c| c.email.as_deref()) {
                Some(email) => Some(email),
                None => return ChannelOutcome::Failed("no email address on file".into()),
            },
            Channel::Sms => match contact.and_then(|c| c.phone.as_deref()) {
                Some(phone) => Some(phone),
                None => return ChannelOutcome::Failed("no phone number on file".into()),
            },
            Channel::Push | Channel::InApp => None,
        };

        let prefs = match &ctx.prefs {
            Ok(prefs) => prefs,
            Err(reason) => return ChannelOutcome::Failed(reason.clone()),
        };
        let recent = match (&ctx.recent_push, channel) {
            (Err(reason), Channel::Push) => return ChannelOutcome::Failed(reason.clone()),
            (Ok(count), _) => *count,
            (Err(_), _) => 0,
        };
        let decision = policy::evaluate(
            prefs,
            notification.category,
            notification.priority,
            channel,
            ctx.now,
            recent,
        );
        if let GateDecision::Deny(reason) = decision {
            tracing::debug!(channel = %channel, reason = %reason, "Channel denied by policy");
            return ChannelOutcome::Skipped(reason);
        }

        match (channel, address) {
            (Channel::Email, Some(to)) => self.send_email(to, notification).await,
            (Channel::Sms, Some(to)) => self.send_sms(to, notification).await,
            (Channel::Push, _) => self.send_push(notification).await,
            _ => ChannelOutcome::Failed(format!("no recipient for {channel}")),
        }
    }

    async fn send_email(&self, to: &str, notification: &Notification) -> ChannelOutcome {
        let Some(sender) = &self.email else {
            return ChannelOutcome::Failed("email not configured".into());
        };
        match sender
            .send_email(&EmailMessage::for_notification(to, notification))
            .await
        {
            Ok(()) => ChannelOutcome::Sent,
            Err(e) => ChannelOutcome::Failed(e.to_string()),
        }
    }

    async fn send_sms(&self, to: &str, notification: &Notification) -> ChannelOutcome {
        let Some(sender) = &self.sms else {
            return ChannelOutcome::Failed("sms not configured".into());
        };
        let text = format_sms(notification.priority, &notification.title, &notification.message);
        match sender.send_sms(to, &text).await {
            Ok(()) => ChannelOutcome::Sent,
            Err(e) => ChannelOutcome::Failed(e.to_string()),
        }
    }

    async fn send_push(&self, notification: &Notification) -> ChannelOutcome {
        let Some(push) = &self.push else {
            return ChannelOutcome::Failed("push not configured".into());
        };
        match push.deliver(&PushPayload::from_notification(notification)).await {
            Ok(_) => ChannelOutcome::Delivered,
            Err(e) => ChannelOutcome::Failed(e.to_string()),
        }
    }

    /// Persist the outcome. Losing the race to another dispatcher leaves the
    /// other writer's status in place.
    async fn record(
        &self,
        notification_id: DbId,
        channel: Channel,
        outcome: ChannelOutcome,
        now: Timestamp,
    ) -> ChannelOutcome {
        let Some((status, error_message)) = outcome.status() else {
            return outcome;
        };
        match self
            .store
            .update_delivery_status(notification_id, channel, status, error_message, now)
            .await
        {
            Ok(Some(_)) => outcome,
            Ok(None) => {
                tracing::warn!(channel = %channel, status = %status, "Delivery row already left pending");
                outcome
            }
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Failed to record delivery status");
                outcome
            }
        }
    }
}
