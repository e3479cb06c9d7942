//! Connector notifications for Conduit
//!
//! This crate provides the notification types fired while a message moves
//! through the pipeline and the broadcast bus they are published on.

mod bus;
mod types;

pub use bus::{NotificationBus, NotificationError, NotificationSink};
pub use types::*;
