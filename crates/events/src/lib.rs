//! Beacon realtime and delivery services.
//!
//! - [`realtime`]: keyed change-feed subscriptions with exponential-backoff
//!   reconnection ([`RealtimeManager`]).
//! - [`delivery`]: email, SMS and push senders behind capability traits.
//! - [`DeliveryOrchestrator`]: concurrent, settle-all per-channel dispatch.
//! - [`Publisher`]: notification creation with company-wide fan-out and
//!   templates.
//! - [`DigestScheduler`]: periodic digest emails.
//! - [`DispatchWorker`]: feeds new notifications to the orchestrator.

pub mod delivery;
pub mod digest;
pub mod dispatch;
pub mod orchestrator;
pub mod publisher;
pub mod realtime;

pub use delivery::{
    DeliveryError, EmailConfig, EmailMessage, EmailSender, LocalNotifier, PushService, SmsSender,
};
pub use digest::DigestScheduler;
pub use dispatch::DispatchWorker;
pub use orchestrator::{ChannelOutcome, DeliveryOrchestrator, DeliveryReport};
pub use publisher::{PublishError, Publisher};
pub use realtime::{
    ChannelKey, ChannelStatus, RealtimeConfig, RealtimeError, RealtimeManager, SubscriptionHandle,
    SubscriptionHandler,
};
