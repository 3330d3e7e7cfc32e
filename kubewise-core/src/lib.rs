//! # KubeWise Core
//!
//! Watches Helm release records stored as cluster `Secret`s, classifies each
//! change into a lifecycle action and forwards the user-relevant ones to
//! notification handlers.
//!
//! ## Pipeline
//!
//! ```text
//! WatchSource ──▶ ResourceWatcher ──┬──▶ ObjectStore (write)
//!                                   └──▶ WorkQueue<WatchEvent>
//!                                              │
//!                                              ▼
//!                            Controller worker (single consumer)
//!                              │ read-back by key
//!                              ▼
//!               EventClassifier ──▶ SuppressionFilter ──▶ Dispatcher
//! ```
//!
//! Queue items are lightweight `(key, raw type, subtype)` tuples; the full
//! record is always re-read from the cache when the item is processed, so a
//! record that vanished in the meantime is a no-op rather than an error.
//!
//! ## Feature Overview
//!
//! - `cache`: in-memory indexed mirror of watched objects
//! - `queue`: deduplicating work queue with per-item exponential backoff
//! - `watcher`: list-then-watch driver that feeds the cache and the queue
//! - `classifier`: derives a [`ReleaseAction`] from a Helm release secret
//! - `suppression`: startup replay and superseded-revision noise removal
//! - `dispatch`: isolated fan-out to [`NotificationHandler`]s
//! - `notify`: Slack and log handlers plus message presenters
//! - `source`: cluster REST API and in-memory watch sources

pub mod cache;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod model;
pub mod notify;
pub mod queue;
pub mod source;
pub mod suppression;
pub mod watcher;

pub use cache::{IndexedCache, ObjectStore, StoreError};
pub use classifier::{ClassifyError, EventClassifier, HelmReleaseClassifier};
pub use config::{
    ControllerConfig, DispatchConfig, RetryConfig, WatchConfig,
    DEFAULT_MARKER_TYPE,
};
pub use controller::{Controller, ControllerBuilder};
pub use dispatch::{
    DispatchReport, DispatchStatus, Dispatcher, NotificationHandler,
    NotifyError,
};
pub use error::{ControllerError, Result};
pub use events::{ControllerEvent, ErrorSink, InProcEventBus, TracingErrorSink};
pub use model::{
    DropReason, ItemOutcome, ObjectKey, ObjectMeta, ProcessOutcome,
    RawEventType, Release, ReleaseAction, ReleaseEvent, ReleaseStatus,
    Secret, SuppressReason, WatchEvent, WatchedObject,
};
pub use notify::{LogNotifier, SlackConfig, SlackNotifier};
pub use queue::{
    BackoffPolicy, ExponentialBackoff, PerItemRateLimiter, RateLimiter,
    WorkQueue,
};
pub use source::{
    BearerToken, InMemorySource, KubeApiConfig, KubeApiSource, MemoryCluster,
    ObjectList, SourceError, WatchNotification, WatchSource, WatchStream,
};
pub use suppression::{SuppressionFilter, Verdict};
pub use watcher::ResourceWatcher;
