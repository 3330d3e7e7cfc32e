use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::model::{
    RawEventType, Release, ReleaseAction, ReleaseEvent, ReleaseStatus, Secret,
    WatchedObject,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    /// The record cannot be turned into a release event. Never retried.
    #[error("cannot initialize release event: {0}")]
    Init(String),
    /// Worth another attempt later.
    #[error("classification temporarily failed: {0}")]
    Transient(String),
}

/// Turns a raw change plus the cached record into a [`ReleaseEvent`].
pub trait EventClassifier: Send + Sync {
    fn classify(
        &self,
        raw_type: RawEventType,
        snapshot: Arc<WatchedObject>,
    ) -> Result<ReleaseEvent, ClassifyError>;
}

/// Decodes Helm 3 storage secrets and maps their status to an action.
#[derive(Clone, Copy, Debug, Default)]
pub struct HelmReleaseClassifier;

impl HelmReleaseClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl EventClassifier for HelmReleaseClassifier {
    fn classify(
        &self,
        raw_type: RawEventType,
        snapshot: Arc<WatchedObject>,
    ) -> Result<ReleaseEvent, ClassifyError> {
        let secret = Secret::from_object(&snapshot)
            .map_err(|err| ClassifyError::Init(err.to_string()))?;
        let release = Release::from_secret(&secret)
            .map_err(|err| ClassifyError::Init(err.to_string()))?;
        let action = derive_action(raw_type, &release);

        Ok(ReleaseEvent {
            raw_type,
            snapshot,
            release,
            action,
        })
    }
}

/// Lifecycle action implied by a change to one release revision.
pub fn derive_action(raw_type: RawEventType, release: &Release) -> ReleaseAction {
    if raw_type == RawEventType::Delete {
        return ReleaseAction::Uninstall;
    }
    match release.status() {
        ReleaseStatus::Superseded => ReleaseAction::SupersededReplace,
        ReleaseStatus::Uninstalling | ReleaseStatus::Uninstalled => {
            ReleaseAction::Uninstall
        }
        ReleaseStatus::Deployed | ReleaseStatus::Failed if release.version <= 1 => {
            ReleaseAction::Install
        }
        ReleaseStatus::Deployed | ReleaseStatus::Failed => ReleaseAction::Upgrade,
        ReleaseStatus::PendingInstall
        | ReleaseStatus::PendingUpgrade
        | ReleaseStatus::PendingRollback
        | ReleaseStatus::Unknown => ReleaseAction::Unknown,
    }
}

impl fmt::Display for HelmReleaseClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("helm-release")
    }
}
