//! Change feed over `LISTEN/NOTIFY`.
//!
//! The migration installs triggers that publish every row change on
//! [`CHANGE_CHANNEL`] as JSON. Each subscription owns one dedicated
//! listener connection; a dropped connection ends the subscription with a
//! `ChannelError` status and reconnecting is left to the caller.

use async_trait::async_trait;
use beacon_core::store::{Change, ChangeFeed, FeedFilter, FeedMessage, FeedStatus, StoreResult};
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;

use super::{store_err, PgStore};

/// Postgres notification channel used by the change triggers.
pub const CHANGE_CHANNEL: &str = "beacon_changes";

const FEED_CAPACITY: usize = 1024;

#[async_trait]
impl ChangeFeed for PgStore {
    async fn subscribe(&self, filter: FeedFilter) -> StoreResult<mpsc::Receiver<FeedMessage>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(store_err)?;
        listener.listen(CHANGE_CHANNEL).await.map_err(store_err)?;

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        tokio::spawn(async move {
            if tx.send(FeedMessage::Status(FeedStatus::Subscribed)).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = listener.try_recv() => match received {
                        Ok(Some(notification)) => {
                            let change: Change = match serde_json::from_str(notification.payload()) {
                                Ok(change) => change,
                                Err(e) => {
                                    tracing::warn!(error = %e, "Discarding malformed change payload");
                                    continue;
                                }
                            };
                            if filter.accepts(&change)
                                && tx.send(FeedMessage::Change(change)).await.is_err()
                            {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::warn!(channel = CHANGE_CHANNEL, "Change feed connection lost");
                            let _ = tx.send(FeedMessage::Status(FeedStatus::ChannelError)).await;
                            break;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Change feed listener failed");
                            let _ = tx.send(FeedMessage::Status(FeedStatus::ChannelError)).await;
                            break;
                        }
                    },
                }
            }
            tracing::debug!(table = filter.table.as_str(), "Change feed subscription ended");
        });

        Ok(rx)
    }
}
