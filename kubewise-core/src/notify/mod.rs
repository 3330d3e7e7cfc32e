//! Concrete [`NotificationHandler`](crate::dispatch::NotificationHandler)s.

mod log;
pub mod presenter;
mod slack;

pub use log::LogNotifier;
pub use slack::{DEFAULT_SLACK_API, DEFAULT_SLACK_CHANNEL, SlackConfig, SlackNotifier};
