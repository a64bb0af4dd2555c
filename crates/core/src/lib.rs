//! Domain layer for the Beacon notification engine.
//!
//! This crate has no internal dependencies so that the store
//! implementations, the delivery side and the client state engine can all
//! share one vocabulary:
//!
//! - [`notification`]: the notification record, drafts, patches and queries.
//! - [`delivery`]: per-channel delivery rows and their status state machine.
//! - [`preferences`]: per-user preference document and its defaults.
//! - [`policy`]: quiet hours, rate limiting and the channel gate.
//! - [`store`]: capability traits the record store must provide.

pub mod channels;
pub mod delivery;
pub mod error;
pub mod notification;
pub mod policy;
pub mod preferences;
pub mod store;
pub mod template;
pub mod types;

pub use channels::Channel;
pub use delivery::{ChannelDelivery, DeliveryStatus};
pub use error::CoreError;
pub use notification::{
    Category, Notification, NotificationDraft, NotificationPatch, NotificationQuery,
    NotificationSummary, NotificationType, Priority,
};
pub use preferences::{Contact, DigestFrequency, Preferences};
