//! Notification persistence and delivery.

pub mod dispatcher;
pub mod push;

pub use dispatcher::{DeliveryReport, NotificationDispatcher};
pub use push::{PushOutcome, PushService};
