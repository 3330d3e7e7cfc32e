use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::error;
use uuid::Uuid;

use crate::model::{ItemOutcome, WatchEvent};

pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 256;

/// Published once per item the worker finished handling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerEvent {
    pub id: Uuid,
    pub event: WatchEvent,
    pub outcome: ItemOutcome,
    pub at: DateTime<Utc>,
}

impl ControllerEvent {
    pub fn new(event: WatchEvent, outcome: ItemOutcome) -> Self {
        Self {
            id: Uuid::now_v7(),
            event,
            outcome,
            at: Utc::now(),
        }
    }
}

/// In-process fan-out of [`ControllerEvent`]s to observers.
pub struct InProcEventBus {
    sender: broadcast::Sender<ControllerEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ControllerEvent) {
        // Nobody listening is the normal case outside tests.
        let _ = self.sender.send(event);
    }
}

/// Receives items whose retries are exhausted.
pub trait ErrorSink: Send + Sync {
    fn report(&self, event: &WatchEvent, error: &str);
}

/// Logs abandoned items and counts them.
#[derive(Debug, Default)]
pub struct TracingErrorSink {
    reported: AtomicU64,
}

impl TracingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}

impl ErrorSink for TracingErrorSink {
    fn report(&self, event: &WatchEvent, error: &str) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        error!(
            target: "kubewise::worker",
            key = %event.key,
            raw_type = %event.raw_type,
            "dropping event after exhausting retries: {error}"
        );
    }
}
