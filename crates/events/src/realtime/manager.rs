//! Keyed subscription manager.
//!
//! [`RealtimeManager`] spawns one long-lived task per [`ChannelKey`]
//! (subscribe -> pump -> back off -> resubscribe). Every task runs under a
//! child of the manager's master [`CancellationToken`], so unsubscribing a
//! key or shutting the manager down also interrupts a pending backoff wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use beacon_core::store::{ChangeFeed, FeedMessage, FeedStatus};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::{backoff_delay, RealtimeConfig};
use super::{ChannelKey, ChannelStatus, RealtimeError, SubscriptionHandler};

/// Manages change-feed subscriptions, one per [`ChannelKey`].
pub struct RealtimeManager {
    feed: Arc<dyn ChangeFeed>,
    config: RealtimeConfig,
    channels: RwLock<HashMap<ChannelKey, TrackedChannel>>,
    /// Master cancellation token, cancelled by [`RealtimeManager::shutdown`].
    cancel: CancellationToken,
    next_generation: AtomicU64,
}

/// Bookkeeping for one tracked key.
struct TrackedChannel {
    handler: Arc<dyn SubscriptionHandler>,
    /// Identifies the `subscribe` call that installed this entry, so a stale
    /// handle cannot remove a newer subscription for the same key.
    generation: u64,
    cancel: CancellationToken,
    task_handle: JoinHandle<()>,
    status: watch::Receiver<ChannelStatus>,
}

/// Returned by [`RealtimeManager::subscribe`].
pub struct SubscriptionHandle {
    manager: Arc<RealtimeManager>,
    key: ChannelKey,
    generation: u64,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Stop event delivery for this subscription and cancel any pending
    /// reconnection. Safe to call any number of times.
    pub async fn unsubscribe(&self) {
        self.manager.remove(&self.key, Some(self.generation)).await;
    }
}

impl RealtimeManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: RealtimeConfig) -> Arc<Self> {
        Arc::new(Self {
            feed,
            config,
            channels: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Subscribe `handler` to `key`, replacing any existing subscription for
    /// the same key.
    pub async fn subscribe(
        self: &Arc<Self>,
        key: ChannelKey,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> SubscriptionHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let mut channels = self.channels.write().await;
        if let Some(previous) = channels.remove(&key) {
            tracing::debug!(channel = %key, "Replacing existing subscription");
            previous.cancel.cancel();
        }
        let tracked = self.spawn_channel(key.clone(), handler, generation);
        channels.insert(key.clone(), tracked);

        SubscriptionHandle {
            manager: Arc::clone(self),
            key,
            generation,
        }
    }

    /// Unsubscribe every tracked key.
    pub async fn unsubscribe_all(&self) {
        let mut channels = self.channels.write().await;
        for (key, tracked) in channels.drain() {
            tracing::debug!(channel = %key, "Unsubscribing");
            tracked.cancel.cancel();
        }
    }

    /// Tear down and resubscribe every tracked key from scratch, with a
    /// fresh attempt counter. Existing handles stay valid.
    pub async fn force_reconnect(&self) {
        let mut channels = self.channels.write().await;
        let keys: Vec<ChannelKey> = channels.keys().cloned().collect();
        tracing::info!(count = keys.len(), "Forcing reconnect of all channels");

        for key in keys {
            if let Some(old) = channels.remove(&key) {
                old.cancel.cancel();
                let fresh = self.spawn_channel(key.clone(), old.handler, old.generation);
                channels.insert(key, fresh);
            }
        }
    }

    /// Current status of `key`, or `None` if it is not tracked.
    pub async fn status(&self, key: &ChannelKey) -> Option<ChannelStatus> {
        self.channels
            .read()
            .await
            .get(key)
            .map(|tracked| *tracked.status.borrow())
    }

    /// Watch the status of `key` as it changes.
    pub async fn watch_status(&self, key: &ChannelKey) -> Option<watch::Receiver<ChannelStatus>> {
        self.channels
            .read()
            .await
            .get(key)
            .map(|tracked| tracked.status.clone())
    }

    pub async fn tracked_keys(&self) -> Vec<ChannelKey> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// Cancel every subscription task and wait up to `timeout` per task
    /// for a clean exit.
    pub async fn shutdown(&self, timeout: std::time::Duration) {
        tracing::info!("Shutting down realtime manager");
        self.cancel.cancel();

        let mut channels = self.channels.write().await;
        for (key, tracked) in channels.drain() {
            tracked.cancel.cancel();
            if tokio::time::timeout(timeout, tracked.task_handle).await.is_err() {
                tracing::warn!(channel = %key, "Subscription task did not stop in time");
            }
        }
        tracing::info!("Realtime manager shut down complete");
    }

    // ---- private helpers ----

    async fn remove(&self, key: &ChannelKey, generation: Option<u64>) {
        let mut channels = self.channels.write().await;
        let matches = channels
            .get(key)
            .is_some_and(|tracked| generation.map_or(true, |g| g == tracked.generation));
        if matches {
            if let Some(tracked) = channels.remove(key) {
                tracing::debug!(channel = %key, "Unsubscribed");
                tracked.cancel.cancel();
            }
        }
    }

    fn spawn_channel(
        &self,
        key: ChannelKey,
        handler: Arc<dyn SubscriptionHandler>,
        generation: u64,
    ) -> TrackedChannel {
        let cancel = self.cancel.child_token();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        let feed = Arc::clone(&self.feed);
        let config = self.config;
        let task_cancel = cancel.clone();
        let task_handler = Arc::clone(&handler);

        let task_handle = tokio::spawn(async move {
            tracing::debug!(channel = %key, "Starting subscription task");
            run_channel(&*feed, &key, &*task_handler, config, &task_cancel, &status_tx).await;
            tracing::debug!(channel = %key, "Subscription task exited");
        });

        TrackedChannel {
            handler,
            generation,
            cancel,
            task_handle,
            status: status_rx,
        }
    }
}

/// How a single feed session ended.
enum SessionEnd {
    /// The feed reported `CLOSED`; no automatic reconnection.
    Closed,
    /// Error status, failed subscribe, or the stream ended.
    Failed(String),
}

/// Core subscription loop: subscribe -> pump -> back off -> resubscribe.
///
/// Runs until cancelled, closed, or out of reconnection attempts.
async fn run_channel(
    feed: &dyn ChangeFeed,
    key: &ChannelKey,
    handler: &dyn SubscriptionHandler,
    config: RealtimeConfig,
    cancel: &CancellationToken,
    status_tx: &watch::Sender<ChannelStatus>,
) {
    let mut attempts: u32 = 0;

    loop {
        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            end = run_session(feed, key, handler, status_tx, &mut attempts) => end,
        };

        match end {
            SessionEnd::Closed => {
                tracing::info!(channel = %key, "Channel closed");
                set_status(status_tx, handler, ChannelStatus::Closed);
                return;
            }
            SessionEnd::Failed(reason) => {
                if attempts >= config.max_attempts {
                    tracing::error!(
                        channel = %key,
                        attempts,
                        error = %reason,
                        "Giving up on channel after repeated failures",
                    );
                    set_status(status_tx, handler, ChannelStatus::Failed);
                    handler.on_error(RealtimeError::Exhausted {
                        channel: key.name(),
                        attempts,
                        last_error: reason,
                    });
                    return;
                }

                let delay = backoff_delay(&config, attempts);
                attempts += 1;
                tracing::warn!(
                    channel = %key,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Channel dropped, scheduling reconnect",
                );
                set_status(status_tx, handler, ChannelStatus::Reconnecting { attempt: attempts });

                // Wait before the next attempt, respecting cancellation.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    status_tx.send_replace(ChannelStatus::Closed);
}

/// One subscribe-and-pump session.
async fn run_session(
    feed: &dyn ChangeFeed,
    key: &ChannelKey,
    handler: &dyn SubscriptionHandler,
    status_tx: &watch::Sender<ChannelStatus>,
    attempts: &mut u32,
) -> SessionEnd {
    let mut rx = match feed.subscribe(key.filter()).await {
        Ok(rx) => rx,
        Err(e) => return SessionEnd::Failed(e.to_string()),
    };

    while let Some(message) = rx.recv().await {
        match message {
            FeedMessage::Status(FeedStatus::Subscribed) => {
                if *attempts > 0 {
                    tracing::info!(channel = %key, attempts = *attempts, "Channel resubscribed");
                }
                *attempts = 0;
                set_status(status_tx, handler, ChannelStatus::Subscribed);
            }
            FeedMessage::Status(FeedStatus::ChannelError) => {
                return SessionEnd::Failed("channel error".into())
            }
            FeedMessage::Status(FeedStatus::TimedOut) => {
                return SessionEnd::Failed("subscription timed out".into())
            }
            FeedMessage::Status(FeedStatus::Closed) => return SessionEnd::Closed,
            FeedMessage::Change(change) => handler.on_event(change),
        }
    }

    SessionEnd::Failed("change feed ended".into())
}

fn set_status(
    status_tx: &watch::Sender<ChannelStatus>,
    handler: &dyn SubscriptionHandler,
    status: ChannelStatus,
) {
    status_tx.send_replace(status);
    handler.on_status(status);
}
