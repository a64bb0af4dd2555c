mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use assert_matches::assert_matches;
use beacon_core::channels::Channel;
use beacon_core::delivery::DeliveryStatus;
use beacon_core::notification::{Notification, NotificationDraft, NotificationQuery, Priority};
use beacon_core::policy::DenyReason;
use beacon_core::preferences::{Contact, Preferences};
use beacon_core::store::{DeliveryStore, NotificationStore};
use beacon_db::MemoryStore;
use beacon_events::delivery::PushService;
use beacon_events::{ChannelOutcome, DeliveryOrchestrator};

use common::{RecordingEmail, RecordingNotifier, RecordingSms};

struct Harness {
    store: Arc<MemoryStore>,
    email: Arc<RecordingEmail>,
    sms: Arc<RecordingSms>,
    notifier: Arc<RecordingNotifier>,
    orchestrator: DeliveryOrchestrator,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let email = Arc::new(RecordingEmail::default());
    let sms = Arc::new(RecordingSms::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let push = Arc::new(PushService::new(notifier.clone()));
    push.init();
    let orchestrator = DeliveryOrchestrator::new(store.clone())
        .with_email(email.clone())
        .with_sms(sms.clone())
        .with_push(push);
    Harness {
        store,
        email,
        sms,
        notifier,
        orchestrator,
    }
}

async fn insert(store: &MemoryStore, user_id: i64, channels: &[Channel]) -> Notification {
    let draft = NotificationDraft::for_user(user_id, "Invoice paid", "INV-7 was paid in full")
        .with_channels(channels.iter().copied());
    store.insert_notification(user_id, &draft).await.unwrap().0
}

async fn status_of(
    store: &MemoryStore,
    n: &Notification,
    channel: Channel,
) -> (DeliveryStatus, Option<String>) {
    let row = store
        .list_deliveries(n.user_id, n.id)
        .await
        .unwrap()
        .into_iter()
        .find(|d| d.channel == channel)
        .unwrap();
    (row.status, row.error_message)
}

// ---------------------------------------------------------------------------
// Mixed channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn each_channel_settles_independently() {
    let h = harness();
    h.store.add_contact(Contact {
        user_id: 1,
        email: Some("dev@example.com".into()),
        phone: None,
    });
    let n = insert(&h.store, 1, &[Channel::InApp, Channel::Email, Channel::Sms]).await;

    let report = h.orchestrator.dispatch(&n).await.unwrap();

    assert_eq!(report.outcome(Channel::InApp), Some(&ChannelOutcome::Delivered));
    assert_eq!(report.outcome(Channel::Email), Some(&ChannelOutcome::Sent));
    assert_matches!(report.outcome(Channel::Sms), Some(ChannelOutcome::Failed(_)));
    assert_eq!(report.failed_channels(), vec![Channel::Sms]);

    assert_eq!(status_of(&h.store, &n, Channel::InApp).await.0, DeliveryStatus::Delivered);
    assert_eq!(status_of(&h.store, &n, Channel::Email).await.0, DeliveryStatus::Sent);
    assert_eq!(
        status_of(&h.store, &n, Channel::Sms).await,
        (DeliveryStatus::Failed, Some("no phone number on file".into())),
    );

    let visible = h
        .store
        .query_notifications(1, &NotificationQuery::default())
        .await
        .unwrap();
    assert!(visible.iter().any(|v| v.id == n.id));

    let sent = h.email.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "dev@example.com");
    assert!(h.sms.sent().is_empty());
}

#[tokio::test]
async fn sender_failure_is_recorded_with_its_message() {
    let h = harness();
    h.store.add_contact(Contact {
        user_id: 1,
        email: Some("dev@example.com".into()),
        phone: None,
    });
    h.email.fail.store(true, Ordering::SeqCst);
    let n = insert(&h.store, 1, &[Channel::InApp, Channel::Email]).await;

    let report = h.orchestrator.dispatch(&n).await.unwrap();

    assert_eq!(report.outcome(Channel::InApp), Some(&ChannelOutcome::Delivered));
    let (status, error) = status_of(&h.store, &n, Channel::Email).await;
    assert_eq!(status, DeliveryStatus::Failed);
    assert!(error.unwrap().contains("mailbox unavailable"));
}

#[tokio::test]
async fn directory_outage_fails_contact_channels_only() {
    let h = harness();
    h.store.set_directory_down(true);
    let n = insert(&h.store, 1, &[Channel::InApp, Channel::Email]).await;

    let report = h.orchestrator.dispatch(&n).await.unwrap();

    assert_eq!(report.outcome(Channel::InApp), Some(&ChannelOutcome::Delivered));
    assert_matches!(
        report.outcome(Channel::Email),
        Some(ChannelOutcome::Failed(reason)) if reason.starts_with("contact lookup failed")
    );
}

#[tokio::test]
async fn missing_transport_fails_the_channel() {
    let store = Arc::new(MemoryStore::new());
    store.add_contact(Contact {
        user_id: 1,
        email: None,
        phone: Some("+15550100".into()),
    });
    let mut prefs = Preferences::defaults_for(1);
    prefs.sms_enabled = true;
    store.put_preferences(prefs);
    let orchestrator = DeliveryOrchestrator::new(store.clone());
    let n = insert(&store, 1, &[Channel::Sms]).await;

    let report = orchestrator.dispatch(&n).await.unwrap();

    assert_eq!(
        report.outcome(Channel::Sms),
        Some(&ChannelOutcome::Failed("sms not configured".into())),
    );
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn policy_denial_leaves_the_row_pending() {
    let h = harness();
    h.store.add_contact(Contact {
        user_id: 1,
        email: Some("dev@example.com".into()),
        phone: None,
    });
    let mut prefs = Preferences::defaults_for(1);
    prefs.email_enabled = false;
    h.store.put_preferences(prefs);
    let n = insert(&h.store, 1, &[Channel::InApp, Channel::Email]).await;

    let report = h.orchestrator.dispatch(&n).await.unwrap();

    assert_eq!(
        report.outcome(Channel::Email),
        Some(&ChannelOutcome::Skipped(DenyReason::ChannelDisabled)),
    );
    assert_eq!(status_of(&h.store, &n, Channel::Email).await.0, DeliveryStatus::Pending);
    assert!(h.email.sent().is_empty());
}

#[tokio::test]
async fn denied_channel_is_gated_again_on_redispatch() {
    let h = harness();
    h.store.add_contact(Contact {
        user_id: 1,
        email: Some("dev@example.com".into()),
        phone: None,
    });
    let mut prefs = Preferences::defaults_for(1);
    prefs.email_enabled = false;
    h.store.put_preferences(prefs.clone());
    let n = insert(&h.store, 1, &[Channel::InApp, Channel::Email]).await;

    h.orchestrator.dispatch(&n).await.unwrap();
    assert!(h.email.sent().is_empty());

    prefs.email_enabled = true;
    h.store.put_preferences(prefs);
    let report = h.orchestrator.dispatch(&n).await.unwrap();

    assert_eq!(report.outcome(Channel::Email), Some(&ChannelOutcome::Sent));
    assert_eq!(
        report.outcome(Channel::InApp),
        Some(&ChannelOutcome::AlreadyProcessed(DeliveryStatus::Delivered)),
    );
    assert_eq!(h.email.sent().len(), 1);
}

#[tokio::test]
async fn priority_filter_skips_low_priority_sms() {
    let h = harness();
    h.store.add_contact(Contact {
        user_id: 1,
        email: None,
        phone: Some("+15550100".into()),
    });
    let mut prefs = Preferences::defaults_for(1);
    prefs.sms_enabled = true;
    prefs.priority_filter = [Priority::High, Priority::Urgent].into_iter().collect();
    h.store.put_preferences(prefs);

    let low = insert(&h.store, 1, &[Channel::Sms]).await;
    let report = h.orchestrator.dispatch(&low).await.unwrap();
    assert_eq!(
        report.outcome(Channel::Sms),
        Some(&ChannelOutcome::Skipped(DenyReason::PriorityFiltered)),
    );

    let draft = NotificationDraft::for_user(1, "Server down", "api-1 is not responding")
        .with_channels([Channel::Sms])
        .with_priority(Priority::Urgent);
    let (urgent, _) = h.store.insert_notification(1, &draft).await.unwrap();
    let report = h.orchestrator.dispatch(&urgent).await.unwrap();
    assert_eq!(report.outcome(Channel::Sms), Some(&ChannelOutcome::Sent));

    let sent = h.sms.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+15550100");
    assert!(sent[0].1.starts_with("URGENT: Server down"));
}

#[tokio::test]
async fn push_is_rate_limited_by_recorded_history() {
    let h = harness();
    let mut prefs = Preferences::defaults_for(1);
    prefs.max_notifications_per_hour = 1;
    h.store.put_preferences(prefs);

    let first = insert(&h.store, 1, &[Channel::Push]).await;
    let report = h.orchestrator.dispatch(&first).await.unwrap();
    assert_eq!(report.outcome(Channel::Push), Some(&ChannelOutcome::Delivered));

    let second = insert(&h.store, 1, &[Channel::Push]).await;
    let report = h.orchestrator.dispatch(&second).await.unwrap();
    assert_eq!(
        report.outcome(Channel::Push),
        Some(&ChannelOutcome::Skipped(DenyReason::RateLimited)),
    );
    assert_eq!(h.notifier.shown.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Replays
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_dispatch_does_not_resend() {
    let h = harness();
    h.store.add_contact(Contact {
        user_id: 1,
        email: Some("dev@example.com".into()),
        phone: None,
    });
    let n = insert(&h.store, 1, &[Channel::InApp, Channel::Email]).await;

    h.orchestrator.dispatch(&n).await.unwrap();
    let replay = h.orchestrator.dispatch(&n).await.unwrap();

    assert_eq!(
        replay.outcome(Channel::Email),
        Some(&ChannelOutcome::AlreadyProcessed(DeliveryStatus::Sent)),
    );
    assert_eq!(
        replay.outcome(Channel::InApp),
        Some(&ChannelOutcome::AlreadyProcessed(DeliveryStatus::Delivered)),
    );
    assert_eq!(h.email.sent().len(), 1);
}

#[tokio::test]
async fn unreadable_delivery_rows_fail_the_dispatch() {
    let h = harness();
    let n = insert(&h.store, 1, &[Channel::InApp]).await;
    h.store.set_offline(true);
    assert!(h.orchestrator.dispatch(&n).await.is_err());
}
