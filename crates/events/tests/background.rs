mod common;

use std::sync::Arc;
use std::time::Duration;

use beacon_core::channels::Channel;
use beacon_core::delivery::DeliveryStatus;
use beacon_core::notification::NotificationDraft;
use beacon_core::preferences::{Contact, Preferences};
use beacon_core::store::{DeliveryStore, NotificationStore, PreferenceStore};
use beacon_db::MemoryStore;
use beacon_events::digest::DigestOutcome;
use beacon_events::realtime::{ChannelStatus, RealtimeConfig, RealtimeManager};
use beacon_events::{DeliveryOrchestrator, DigestScheduler, DispatchWorker};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use common::RecordingEmail;

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

fn digest_user(store: &MemoryStore, user_id: i64, email: Option<&str>) {
    let mut prefs = Preferences::defaults_for(user_id);
    prefs.digest_enabled = true;
    store.put_preferences(prefs);
    store.add_contact(Contact {
        user_id,
        email: email.map(String::from),
        phone: None,
    });
}

#[tokio::test]
async fn digest_summarizes_unread_and_stamps_the_send() {
    let store = Arc::new(MemoryStore::new());
    let email = Arc::new(RecordingEmail::default());
    digest_user(&store, 1, Some("dev@example.com"));
    for title in ["Task assigned", "Comment added"] {
        store
            .insert_notification(1, &NotificationDraft::for_user(1, title, "details"))
            .await
            .unwrap();
    }
    let scheduler = DigestScheduler::new(store.clone(), email.clone());

    let now = Utc::now();
    assert_eq!(scheduler.process_digests(now).await.unwrap(), 1);

    let sent = email.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "dev@example.com");
    assert_eq!(sent[0].subject, "You have 2 unread notifications");
    assert!(sent[0].body.contains("Task assigned"));
    assert!(sent[0].body.contains("Comment added"));

    let prefs = store.get_preferences(1).await.unwrap().unwrap();
    assert_eq!(prefs.digest_last_sent_at, Some(now));

    // Not due again within the period.
    assert_eq!(scheduler.process_digests(now).await.unwrap(), 0);
    assert_eq!(email.sent().len(), 1);
}

#[tokio::test]
async fn digest_without_address_or_unread_is_not_sent() {
    let store = Arc::new(MemoryStore::new());
    let email = Arc::new(RecordingEmail::default());
    digest_user(&store, 1, None);
    digest_user(&store, 2, Some("quiet@example.com"));
    store
        .insert_notification(1, &NotificationDraft::for_user(1, "Hello", "world"))
        .await
        .unwrap();
    let scheduler = DigestScheduler::new(store.clone(), email.clone());
    let now = Utc::now();

    let one = store.get_preferences(1).await.unwrap().unwrap();
    let two = store.get_preferences(2).await.unwrap().unwrap();
    assert_eq!(scheduler.send_digest(&one, now).await.unwrap(), DigestOutcome::NoRecipient);
    assert_eq!(scheduler.send_digest(&two, now).await.unwrap(), DigestOutcome::NothingUnread);

    assert!(email.sent().is_empty());
    let one = store.get_preferences(1).await.unwrap().unwrap();
    assert_eq!(one.digest_last_sent_at, None);
}

#[tokio::test(start_paused = true)]
async fn digest_loop_stops_on_cancel() {
    let store = Arc::new(MemoryStore::new());
    let email = Arc::new(RecordingEmail::default());
    let scheduler = DigestScheduler::new(store, email).with_interval(Duration::from_secs(60));
    let cancel = CancellationToken::new();

    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(150)).await;
    cancel.cancel();
    task.await.unwrap();
}

// ---------------------------------------------------------------------------
// Dispatch worker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_worker_delivers_new_notifications() {
    let store = Arc::new(MemoryStore::new());
    let email = Arc::new(RecordingEmail::default());
    store.add_contact(Contact {
        user_id: 5,
        email: Some("ops@example.com".into()),
        phone: None,
    });
    let realtime = RealtimeManager::new(store.clone(), RealtimeConfig::default());
    let orchestrator = Arc::new(DeliveryOrchestrator::new(store.clone()).with_email(email.clone()));
    let worker = DispatchWorker::new(Arc::clone(&realtime), orchestrator);
    let handle = worker.start().await;

    for _ in 0..100 {
        if realtime.status(&DispatchWorker::key()).await == Some(ChannelStatus::Subscribed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let draft = NotificationDraft::for_user(5, "Deploy finished", "v1.4.0 is live")
        .with_channels([Channel::InApp, Channel::Email]);
    let (n, _) = store.insert_notification(5, &draft).await.unwrap();

    let mut email_status = DeliveryStatus::Pending;
    for _ in 0..200 {
        email_status = store
            .list_deliveries(5, n.id)
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.channel == Channel::Email)
            .map(|d| d.status)
            .unwrap_or(DeliveryStatus::Pending);
        if email_status != DeliveryStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(email_status, DeliveryStatus::Sent);
    assert_eq!(email.sent().len(), 1);

    handle.unsubscribe().await;
}
