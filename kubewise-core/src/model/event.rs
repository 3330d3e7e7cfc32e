use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{object::ObjectKey, object::WatchedObject, release::Release};

/// Kind of change the watch source reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawEventType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for RawEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawEventType::Create => write!(f, "create"),
            RawEventType::Update => write!(f, "update"),
            RawEventType::Delete => write!(f, "delete"),
        }
    }
}

/// Lightweight queue item.
///
/// The whole tuple is the dedup identity: while an item is pending, a second
/// notification with the same key, type and subtype collapses into it even if
/// the cached record changed in between. The record itself is re-read from
/// the cache when the item is processed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchEvent {
    pub key: ObjectKey,
    pub raw_type: RawEventType,
    pub subtype: String,
}

impl WatchEvent {
    pub fn new(
        key: ObjectKey,
        raw_type: RawEventType,
        subtype: impl Into<String>,
    ) -> Self {
        Self {
            key,
            raw_type,
            subtype: subtype.into(),
        }
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.raw_type, self.key, self.subtype)
    }
}

/// Semantic lifecycle action derived from a release record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseAction {
    Install,
    Upgrade,
    Uninstall,
    /// The previous revision being retired after an upgrade. Never user-facing.
    SupersededReplace,
    Unknown,
}

impl fmt::Display for ReleaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseAction::Install => write!(f, "install"),
            ReleaseAction::Upgrade => write!(f, "upgrade"),
            ReleaseAction::Uninstall => write!(f, "uninstall"),
            ReleaseAction::SupersededReplace => write!(f, "superseded-replace"),
            ReleaseAction::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classified event handed to notification handlers.
#[derive(Clone, Debug)]
pub struct ReleaseEvent {
    pub raw_type: RawEventType,
    pub snapshot: Arc<WatchedObject>,
    pub release: Release,
    pub action: ReleaseAction,
}

impl ReleaseEvent {
    /// Creation instant of the underlying record (not of the release).
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.creation_timestamp()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressReason {
    /// Internal bookkeeping between two revisions of one release.
    Superseded,
    /// `Create` replayed by the initial listing for a pre-existing record.
    StartupReplay,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// The key was no longer in the cache when the item was processed.
    Vanished,
    /// The cached record is not a secret.
    TypeMismatch,
    /// The secret is not a release record.
    NotRelease(String),
    /// The classifier could not build a release event.
    ClassifierInit(String),
    /// Every handler rejected the event permanently.
    Undeliverable(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Vanished => write!(f, "object no longer cached"),
            DropReason::TypeMismatch => write!(f, "object is not a secret"),
            DropReason::NotRelease(subtype) => {
                write!(f, "secret type {subtype:?} is not a release record")
            }
            DropReason::ClassifierInit(msg) => {
                write!(f, "classification failed: {msg}")
            }
            DropReason::Undeliverable(msg) => write!(f, "undeliverable: {msg}"),
        }
    }
}

/// Terminal result of processing one dequeued item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessOutcome {
    Dispatched { action: ReleaseAction },
    Suppressed(SuppressReason),
    Dropped(DropReason),
}

/// What the worker loop did with a dequeued item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    Processed(ProcessOutcome),
    /// Re-enqueued with backoff; `attempt` counts retries starting at 1.
    Retried {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Retries exhausted; reported to the error sink and forgotten.
    Abandoned { error: String },
}

impl ItemOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(
            self,
            ItemOutcome::Processed(ProcessOutcome::Dispatched { .. })
        )
    }
}
