//! Isolated fan-out of classified events to notification handlers.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::DispatchConfig,
    model::{Release, ReleaseEvent},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("handler did not finish within {0:?}")]
    Timeout(Duration),
    #[error("delivery failed: {0}")]
    Transient(String),
    /// The backend refused the notification; repeating it will not help.
    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl NotifyError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, NotifyError::Rejected(_))
    }
}

/// A notification backend.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Short identifier used in logs and reports.
    fn name(&self) -> &str;

    async fn handle_event(&self, event: &ReleaseEvent) -> Result<(), NotifyError>;

    /// Called once at boot with every release found by the initial listing.
    async fn handle_server_startup(&self, releases: &[Release]) -> Result<(), NotifyError> {
        let _ = releases;
        Ok(())
    }
}

/// Aggregate outcome of one fan-out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    /// At least one handler accepted the event, or none is registered.
    Success,
    /// Every handler failed and every failure is worth retrying.
    Retry { error: String },
    /// Every handler failed and at least one failure is permanent.
    DeadLetter { error: String },
}

impl DispatchStatus {
    pub fn needs_retry(&self) -> bool {
        matches!(self, DispatchStatus::Retry { .. })
    }
}

/// Per-handler results of one fan-out, in registration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub deliveries: Vec<(String, Result<(), NotifyError>)>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.deliveries.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn status(&self) -> DispatchStatus {
        if self.deliveries.is_empty() || self.delivered() > 0 {
            return DispatchStatus::Success;
        }
        let error = self
            .deliveries
            .iter()
            .filter_map(|(name, result)| {
                result.as_ref().err().map(|err| format!("{name}: {err}"))
            })
            .collect::<Vec<_>>()
            .join("; ");
        let retryable = self
            .deliveries
            .iter()
            .all(|(_, result)| result.as_ref().err().is_some_and(NotifyError::is_retryable));
        if retryable {
            DispatchStatus::Retry { error }
        } else {
            DispatchStatus::DeadLetter { error }
        }
    }
}

/// Delivers every event to all registered handlers concurrently.
///
/// Each call runs in its own task, under its own timeout when one is
/// configured, so a slow or panicking handler cannot hold up or fail the
/// others.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Vec<Arc<dyn NotificationHandler>>,
    timeout: Option<Duration>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("Dispatcher")
            .field("handlers", &names)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(handlers: Vec<Arc<dyn NotificationHandler>>, config: &DispatchConfig) -> Self {
        Self {
            handlers,
            timeout: config.timeout(),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub async fn dispatch(&self, event: Arc<ReleaseEvent>) -> DispatchReport {
        self.fan_out("event", move |handler| {
            let event = Arc::clone(&event);
            Box::pin(async move { handler.handle_event(&event).await })
        })
        .await
    }

    pub async fn announce_startup(&self, releases: Arc<Vec<Release>>) -> DispatchReport {
        self.fan_out("startup", move |handler| {
            let releases = Arc::clone(&releases);
            Box::pin(async move { handler.handle_server_startup(&releases).await })
        })
        .await
    }

    async fn fan_out<F>(&self, what: &'static str, call: F) -> DispatchReport
    where
        F: Fn(Arc<dyn NotificationHandler>) -> BoxFuture<'static, Result<(), NotifyError>>,
    {
        let timeout = self.timeout;
        let tasks = self.handlers.iter().map(|handler| {
            let name = handler.name().to_string();
            let fut = call(Arc::clone(handler));
            let task = tokio::spawn(async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, fut)
                        .await
                        .unwrap_or(Err(NotifyError::Timeout(limit))),
                    None => fut.await,
                }
            });
            async move {
                let result = task.await.unwrap_or_else(|err| {
                    Err(NotifyError::Rejected(format!("handler task failed: {err}")))
                });
                (name, result)
            }
        });

        let deliveries = join_all(tasks).await;
        for (name, result) in &deliveries {
            match result {
                Ok(()) => debug!(target: "kubewise::dispatch", handler = %name, what, "delivered"),
                Err(err) => warn!(
                    target: "kubewise::dispatch",
                    handler = %name,
                    what,
                    "delivery failed: {err}"
                ),
            }
        }
        DispatchReport { deliveries }
    }
}
