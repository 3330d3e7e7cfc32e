//! List/watch access to the authoritative store of watched objects.

mod kube;
mod memory;

pub use kube::{BearerToken, KubeApiConfig, KubeApiSource};
pub use memory::{InMemorySource, MemoryCluster};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::model::WatchedObject;

/// One change reported by a watch stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchNotification {
    Added(WatchedObject),
    Modified(WatchedObject),
    Deleted(WatchedObject),
    /// Progress marker carrying no object.
    Bookmark { resource_version: String },
}

impl WatchNotification {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchNotification::Added(object)
            | WatchNotification::Modified(object)
            | WatchNotification::Deleted(object) => object.resource_version(),
            WatchNotification::Bookmark { resource_version } => {
                Some(resource_version)
            }
        }
    }
}

/// Snapshot returned by a full listing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectList {
    pub items: Vec<WatchedObject>,
    /// Version to resume watching from.
    pub resource_version: Option<String>,
}

pub type WatchStream = BoxStream<'static, Result<WatchNotification, SourceError>>;

#[derive(Error, Debug)]
pub enum SourceError {
    /// The requested resource version is no longer available.
    #[error("resource version expired: {0}")]
    Gone(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid source configuration: {0}")]
    Config(String),

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("watch source closed")]
    Closed,
}

impl SourceError {
    /// True when resuming the watch is impossible and a fresh listing is
    /// required.
    pub fn requires_relist(&self) -> bool {
        matches!(self, SourceError::Gone(_))
            || matches!(self, SourceError::Status { status: 410, .. })
    }
}

/// List-then-watch access to one collection, optionally scoped to a
/// namespace.
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Namespace the source is scoped to; `None` means all namespaces.
    fn namespace(&self) -> Option<&str>;

    async fn list(&self) -> Result<ObjectList, SourceError>;

    /// Streams changes that happened after `resource_version`.
    async fn watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<WatchStream, SourceError>;
}
