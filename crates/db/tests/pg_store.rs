//! PostgreSQL store tests. `#[sqlx::test]` creates a fresh database per
//! test from `DATABASE_URL` and applies the crate's migrations.

use beacon_core::channels::Channel;
use beacon_core::delivery::DeliveryStatus;
use beacon_core::notification::{NotificationDraft, NotificationPatch, NotificationQuery, Priority};
use beacon_core::types::Metadata;
use beacon_core::preferences::Preferences;
use beacon_core::store::{
    ChangeFeed, ChangeOp, DeliveryStore, FeedFilter, FeedMessage, FeedStatus, NotificationStore,
    PreferenceStore, Table,
};
use beacon_db::PgStore;
use chrono::{Duration, Utc};
use sqlx::PgPool;

fn draft(user_id: i64) -> NotificationDraft {
    NotificationDraft::for_user(user_id, "Deploy finished", "Release 1.4 is live")
        .with_channels([Channel::InApp, Channel::Email, Channel::Email])
}

#[sqlx::test(migrations = "./migrations")]
async fn insert_creates_one_pending_row_per_distinct_channel(pool: PgPool) {
    beacon_db::health_check(&pool).await.unwrap();
    let store = PgStore::new(pool);

    let (n, deliveries) = store.insert_notification(7, &draft(7)).await.unwrap();
    assert_eq!(n.channels, vec![Channel::InApp, Channel::Email]);
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::Pending));
}

#[sqlx::test(migrations = "./migrations")]
async fn updates_are_scoped_to_the_owner(pool: PgPool) {
    let store = PgStore::new(pool);
    let (n, _) = store.insert_notification(7, &draft(7)).await.unwrap();

    let patch = NotificationPatch::read(n.id, Utc::now());
    assert!(store.update_notification(8, &patch).await.unwrap().is_none());
    let updated = store.update_notification(7, &patch).await.unwrap().unwrap();
    assert!(updated.read);

    assert!(!store.delete_notification(8, n.id).await.unwrap());
    assert!(store.delete_notification(7, n.id).await.unwrap());
    assert!(store
        .query_notifications(7, &NotificationQuery::default())
        .await
        .unwrap()
        .is_empty());
}

#[sqlx::test(migrations = "./migrations")]
async fn delivery_status_refuses_backward_moves(pool: PgPool) {
    let store = PgStore::new(pool);
    let (n, _) = store.insert_notification(7, &draft(7)).await.unwrap();
    let now = Utc::now();

    let sent = store
        .update_delivery_status(n.id, Channel::Email, DeliveryStatus::Sent, None, now)
        .await
        .unwrap()
        .unwrap();
    assert!(sent.sent_at.is_some());

    let pending_again = store
        .update_delivery_status(n.id, Channel::Email, DeliveryStatus::Failed, Some("x".into()), now)
        .await
        .unwrap();
    assert!(pending_again.is_none());
    assert_eq!(
        store
            .count_sent_since(7, Channel::Email, now - Duration::seconds(1))
            .await
            .unwrap(),
        1
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn preferences_round_trip_through_upsert(pool: PgPool) {
    let store = PgStore::new(pool);
    assert!(store.get_preferences(3).await.unwrap().is_none());

    let mut prefs = Preferences::defaults_for(3);
    prefs.priority_filter.remove(&Priority::Low);
    prefs.sms_enabled = true;
    store.upsert_preferences(&prefs).await.unwrap();

    assert_eq!(store.get_preferences(3).await.unwrap(), Some(prefs));
}

#[sqlx::test(migrations = "./migrations")]
async fn change_feed_publishes_inserts_for_the_filtered_user(pool: PgPool) {
    let store = PgStore::new(pool);
    let mut rx = store
        .subscribe(FeedFilter {
            table: Table::Notifications,
            user_id: Some(7),
        })
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some(FeedMessage::Status(FeedStatus::Subscribed)));

    store.insert_notification(8, &draft(8)).await.unwrap();
    let (n, _) = store.insert_notification(7, &draft(7)).await.unwrap();

    let Some(FeedMessage::Change(change)) = rx.recv().await else {
        panic!("expected a change");
    };
    assert_eq!(change.op, ChangeOp::Insert);
    assert_eq!(change.user_id, 7);
    assert_eq!(change.record["id"], n.id);
}

#[sqlx::test(migrations = "./migrations")]
async fn oversized_update_is_published_as_a_truncated_record(pool: PgPool) {
    let store = PgStore::new(pool);
    let mut rx = store
        .subscribe(FeedFilter {
            table: Table::Notifications,
            user_id: Some(7),
        })
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some(FeedMessage::Status(FeedStatus::Subscribed)));

    let (n, _) = store.insert_notification(7, &draft(7)).await.unwrap();
    let Some(FeedMessage::Change(inserted)) = rx.recv().await else {
        panic!("expected the insert");
    };
    assert_eq!(inserted.op, ChangeOp::Insert);
    assert!(inserted.record.get("truncated").is_none());

    let mut metadata = Metadata::new();
    metadata.insert("log".into(), serde_json::Value::String("x".repeat(9_000)));
    let patch = NotificationPatch {
        id: n.id,
        metadata: Some(metadata),
        ..Default::default()
    };
    store.update_notification(7, &patch).await.unwrap().unwrap();

    let Some(FeedMessage::Change(updated)) = rx.recv().await else {
        panic!("expected the update");
    };
    assert_eq!(updated.op, ChangeOp::Update);
    assert_eq!(updated.record["id"], n.id);
    assert_eq!(updated.record["truncated"], true);
    assert!(updated.record.get("metadata").is_none());
}
