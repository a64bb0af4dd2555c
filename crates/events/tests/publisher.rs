mod common;

use std::collections::HashMap;
use std::sync::Arc;

use assert_matches::assert_matches;
use beacon_core::channels::Channel;
use beacon_core::delivery::DeliveryStatus;
use beacon_core::notification::{
    Category, NotificationDraft, NotificationPatch, NotificationQuery, NotificationType, Priority,
};
use beacon_core::preferences::Contact;
use beacon_core::store::{DeliveryStore, NotificationStore};
use beacon_core::template::NotificationTemplate;
use beacon_db::MemoryStore;
use beacon_events::{ChannelOutcome, DeliveryOrchestrator, PublishError, Publisher};
use chrono::Utc;

use common::RecordingEmail;

fn publisher() -> (Arc<MemoryStore>, Arc<RecordingEmail>, Publisher) {
    let store = Arc::new(MemoryStore::new());
    let email = Arc::new(RecordingEmail::default());
    let orchestrator = Arc::new(DeliveryOrchestrator::new(store.clone()).with_email(email.clone()));
    let publisher = Publisher::new(store.clone(), orchestrator);
    (store, email, publisher)
}

#[tokio::test]
async fn company_wide_draft_fans_out_to_every_member() {
    let (store, _, publisher) = publisher();
    for user_id in [1, 2, 3] {
        store.add_company_member(9, user_id);
    }

    let created = publisher
        .create(&NotificationDraft::for_company(9, "Office closed", "Friday is a holiday"))
        .await
        .unwrap();

    assert_eq!(created.len(), 3);
    let mut users: Vec<_> = created.iter().map(|n| n.user_id).collect();
    users.sort_unstable();
    assert_eq!(users, vec![1, 2, 3]);
    assert!(created.iter().all(|n| n.company_wide && n.company_id == Some(9)));

    // Each member's copy is read independently.
    let for_two = created.iter().find(|n| n.user_id == 2).unwrap();
    store
        .update_notification(2, &NotificationPatch::read(for_two.id, Utc::now()))
        .await
        .unwrap()
        .unwrap();

    let unread_one = store.query_notifications(1, &NotificationQuery::unread()).await.unwrap();
    let unread_two = store.query_notifications(2, &NotificationQuery::unread()).await.unwrap();
    assert_eq!(unread_one.len(), 1);
    assert!(unread_two.is_empty());
}

#[tokio::test]
async fn company_without_members_is_rejected() {
    let (_, _, publisher) = publisher();
    let err = publisher
        .create(&NotificationDraft::for_company(4, "Hello", "Nobody here"))
        .await
        .unwrap_err();
    assert_matches!(err, PublishError::NoRecipients(4));
}

#[tokio::test]
async fn invalid_draft_is_rejected_before_insert() {
    let (store, _, publisher) = publisher();
    let err = publisher
        .create(&NotificationDraft::for_user(1, "", "No title"))
        .await
        .unwrap_err();
    assert_matches!(err, PublishError::Invalid(_));
    assert!(store
        .query_notifications(1, &NotificationQuery::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn publish_dispatches_every_created_row() {
    let (store, email, publisher) = publisher();
    store.add_contact(Contact {
        user_id: 1,
        email: Some("dev@example.com".into()),
        phone: None,
    });
    let draft = NotificationDraft::for_user(1, "Build failed", "main is red")
        .with_channels([Channel::InApp, Channel::Email])
        .with_priority(Priority::High)
        .with_action_url("https://ci.example.com/builds/7");

    let receipt = publisher.publish(&draft).await.unwrap();
    let id = receipt.notifications[0].id;
    let reports = receipt.wait().await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome(Channel::Email), Some(&ChannelOutcome::Sent));
    let statuses: HashMap<_, _> = store
        .list_deliveries(1, id)
        .await
        .unwrap()
        .into_iter()
        .map(|d| (d.channel, d.status))
        .collect();
    assert_eq!(statuses[&Channel::InApp], DeliveryStatus::Delivered);
    assert_eq!(statuses[&Channel::Email], DeliveryStatus::Sent);

    let sent = email.sent();
    assert!(sent[0].subject.contains("Build failed"));
    assert!(sent[0].body.contains("https://ci.example.com/builds/7"));
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

fn invoice_template() -> NotificationTemplate {
    NotificationTemplate {
        key: "invoice_paid".into(),
        title_template: "Invoice {{number}} paid".into(),
        message_template: "{{customer}} paid invoice {{number}}.".into(),
        notification_type: NotificationType::Success,
        category: Category::Invoice,
        priority: Priority::Medium,
        channels: vec![Channel::InApp],
    }
}

#[tokio::test]
async fn template_renders_into_a_stored_notification() {
    let (store, _, publisher) = publisher();
    store.put_template(invoice_template());
    let vars = HashMap::from([
        ("number".to_string(), "INV-7".to_string()),
        ("customer".to_string(), "Acme".to_string()),
    ]);

    let created = publisher
        .create_from_template("invoice_paid", 4, &vars)
        .await
        .unwrap();

    let n = &created[0];
    assert_eq!(n.user_id, 4);
    assert_eq!(n.title, "Invoice INV-7 paid");
    assert_eq!(n.message, "Acme paid invoice INV-7.");
    assert_eq!(n.category, Category::Invoice);
    assert_eq!(n.source_type.as_deref(), Some("template"));
    assert_eq!(n.source_id.as_deref(), Some("invoice_paid"));
}

#[tokio::test]
async fn unknown_template_and_missing_variables_are_errors() {
    let (store, _, publisher) = publisher();
    let err = publisher
        .render_template("nope", 1, &HashMap::new())
        .await
        .unwrap_err();
    assert_matches!(err, PublishError::TemplateNotFound(key) if key == "nope");

    store.put_template(invoice_template());
    let vars = HashMap::from([("number".to_string(), "INV-7".to_string())]);
    let err = publisher
        .render_template("invoice_paid", 1, &vars)
        .await
        .unwrap_err();
    assert_matches!(err, PublishError::Invalid(_));
}
