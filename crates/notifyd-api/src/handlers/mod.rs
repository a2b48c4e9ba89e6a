//! HTTP request handlers.

pub mod health;
pub mod notify;

pub use health::health_check;
pub use notify::{cancel_notification, create_notification, get_notification};
