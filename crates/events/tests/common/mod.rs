#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use beacon_core::store::Change;
use beacon_events::delivery::{
    DeliveryError, EmailMessage, EmailSender, LocalNotifier, PushPayload, SmsSender,
};
use beacon_events::realtime::{ChannelStatus, RealtimeError, SubscriptionHandler};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Senders
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingEmail {
    pub sent: Mutex<Vec<EmailMessage>>,
    pub fail: AtomicBool,
}

impl RecordingEmail {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmail {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected("mailbox unavailable".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSms {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSms {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmsSender for RecordingSms {
    async fn send_sms(&self, to: &str, text: &str) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push((to.to_string(), text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub shown: Mutex<Vec<PushPayload>>,
}

#[async_trait]
impl LocalNotifier for RecordingNotifier {
    async fn show_local_notification(
        &self,
        payload: &PushPayload,
    ) -> Result<Option<String>, DeliveryError> {
        self.shown.lock().unwrap().push(payload.clone());
        Ok(Some(payload.tag.clone()))
    }
}

// ---------------------------------------------------------------------------
// Subscription handler
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Seen {
    Event(Change),
    Error(RealtimeError),
    Status(ChannelStatus),
}

pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Seen>,
    errors: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                errors: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl SubscriptionHandler for RecordingHandler {
    fn on_event(&self, change: Change) {
        let _ = self.tx.send(Seen::Event(change));
    }

    fn on_error(&self, error: RealtimeError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(Seen::Error(error));
    }

    fn on_status(&self, status: ChannelStatus) {
        let _ = self.tx.send(Seen::Status(status));
    }
}

/// Receive until a status equal to `wanted` arrives.
pub async fn wait_for_status(rx: &mut mpsc::UnboundedReceiver<Seen>, wanted: ChannelStatus) {
    loop {
        match rx.recv().await {
            Some(Seen::Status(status)) if status == wanted => return,
            Some(_) => continue,
            None => panic!("handler dropped before reaching {wanted:?}"),
        }
    }
}

/// Receive until the next change event.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Change {
    loop {
        match rx.recv().await {
            Some(Seen::Event(change)) => return change,
            Some(_) => continue,
            None => panic!("handler dropped before the next event"),
        }
    }
}
