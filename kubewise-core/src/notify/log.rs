use async_trait::async_trait;
use tracing::info;

use super::presenter;
use crate::{
    dispatch::{NotificationHandler, NotifyError},
    model::{Release, ReleaseEvent},
};

/// Emits one structured `tracing` event per notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationHandler for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle_event(&self, event: &ReleaseEvent) -> Result<(), NotifyError> {
        let message = presenter::event_message(event);
        if message.is_empty() {
            return Ok(());
        }
        info!(
            target: "kubewise::notify",
            release = %event.release.name,
            namespace = %event.release.namespace,
            revision = event.release.version,
            status = %event.release.status(),
            action = %event.action,
            raw_type = %event.raw_type,
            "{message}"
        );
        Ok(())
    }

    async fn handle_server_startup(&self, releases: &[Release]) -> Result<(), NotifyError> {
        info!(
            target: "kubewise::notify",
            releases = releases.len(),
            "{}",
            presenter::startup_message(releases)
        );
        Ok(())
    }
}
