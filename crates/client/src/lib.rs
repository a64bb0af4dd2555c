//! Client-side notification state engine.
//!
//! [`state`] holds the pure reducer and change-feed application;
//! [`NotificationCenter`] drives it from the record store and the realtime
//! change feed and publishes snapshots for the UI.

pub mod center;
pub mod state;

pub use center::{CenterError, CenterResult, NotificationCenter};
pub use state::{apply_change, reduce, Action, Effect, NotificationState, Transition};
