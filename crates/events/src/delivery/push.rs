//! Push notification service.
//!
//! [`PushService`] is an explicitly constructed instance with an
//! `init()`/`dispose()` lifecycle. It is shared between the delivery
//! orchestrator (ungated [`PushService::deliver`], the orchestrator gates
//! itself) and the client state engine ([`PushService::show`], gated by
//! preferences, quiet hours and the service's own trailing-hour count).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::notification::{Notification, Priority};
use beacon_core::policy::{self, DenyReason, GateDecision};
use beacon_core::preferences::Preferences;
use beacon_core::types::{DbId, Timestamp};
use beacon_core::Channel;
use serde::{Deserialize, Serialize};

use super::{DeliveryError, LocalNotifier};

/// Payload handed to the device notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub notification_id: DbId,
    pub user_id: DbId,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub action_url: Option<String>,
    /// Collapse key so repeated displays of one notification replace each other.
    pub tag: String,
}

impl PushPayload {
    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            notification_id: notification.id,
            user_id: notification.user_id,
            title: notification.title.clone(),
            body: notification.message.clone(),
            priority: notification.priority,
            action_url: notification.action_url.clone(),
            tag: format!("notification-{}", notification.id),
        }
    }
}

/// Result of a gated display request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Shown(Option<String>),
    Suppressed(DenyReason),
}

#[derive(Default)]
struct PushState {
    ready: bool,
    /// Display timestamps inside the trailing rate-limit window.
    shown_at: VecDeque<Timestamp>,
}

pub struct PushService {
    notifier: Arc<dyn LocalNotifier>,
    state: Mutex<PushState>,
}

impl PushService {
    pub fn new(notifier: Arc<dyn LocalNotifier>) -> Self {
        Self {
            notifier,
            state: Mutex::new(PushState::default()),
        }
    }

    pub fn init(&self) {
        self.state().ready = true;
        tracing::debug!("Push service initialised");
    }

    /// Stop accepting displays and forget the rate-limit history.
    pub fn dispose(&self) {
        let mut state = self.state();
        state.ready = false;
        state.shown_at.clear();
        tracing::debug!("Push service disposed");
    }

    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    /// Displays recorded since the start of the rate-limit window at `now`.
    pub fn recent_count(&self, now: Timestamp) -> u32 {
        let mut state = self.state();
        prune(&mut state.shown_at, now);
        state.shown_at.len() as u32
    }

    /// Display without consulting preferences.
    pub async fn deliver(&self, payload: &PushPayload) -> Result<Option<String>, DeliveryError> {
        if !self.is_ready() {
            return Err(DeliveryError::Push("push service is not initialised".into()));
        }
        let id = self.notifier.show_local_notification(payload).await?;
        self.record(chrono::Utc::now());
        Ok(id)
    }

    /// Display `notification` if the push gate allows it at `now`.
    pub async fn show(
        &self,
        prefs: &Preferences,
        notification: &Notification,
        now: Timestamp,
    ) -> Result<PushOutcome, DeliveryError> {
        let decision = policy::evaluate(
            prefs,
            notification.category,
            notification.priority,
            Channel::Push,
            now,
            self.recent_count(now),
        );
        if let GateDecision::Deny(reason) = decision {
            tracing::debug!(
                notification_id = notification.id,
                reason = %reason,
                "Push display suppressed",
            );
            return Ok(PushOutcome::Suppressed(reason));
        }
        let id = self
            .deliver(&PushPayload::from_notification(notification))
            .await?;
        Ok(PushOutcome::Shown(id))
    }

    // ---- private helpers ----

    fn state(&self) -> MutexGuard<'_, PushState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, at: Timestamp) {
        let mut state = self.state();
        prune(&mut state.shown_at, at);
        state.shown_at.push_back(at);
    }
}

fn prune(shown_at: &mut VecDeque<Timestamp>, now: Timestamp) {
    let window_start = policy::rate_limit_window_start(now);
    while shown_at.front().is_some_and(|&at| at < window_start) {
        shown_at.pop_front();
    }
}

// ---------------------------------------------------------------------------
// RelayNotifier
// ---------------------------------------------------------------------------

/// HTTP request timeout for the push relay.
const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PushRelayConfig {
    pub relay_url: String,
}

impl PushRelayConfig {
    /// Returns `None` if `PUSH_RELAY_URL` is not set.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            relay_url: std::env::var("PUSH_RELAY_URL").ok()?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    id: Option<String>,
}

/// Forwards push payloads to a relay that owns the device sessions.
pub struct RelayNotifier {
    client: reqwest::Client,
    relay_url: String,
}

impl RelayNotifier {
    pub fn new(config: PushRelayConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(RELAY_TIMEOUT).build()?;
        Ok(Self {
            client,
            relay_url: config.relay_url,
        })
    }
}

#[async_trait]
impl LocalNotifier for RelayNotifier {
    async fn show_local_notification(
        &self,
        payload: &PushPayload,
    ) -> Result<Option<String>, DeliveryError> {
        let response = self
            .client
            .post(&self.relay_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Push(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DeliveryError::Push(format!(
                "push relay returned HTTP {}",
                response.status().as_u16()
            )));
        }
        let body: RelayResponse = response.json().await.unwrap_or(RelayResponse { id: None });
        Ok(body.id)
    }
}
