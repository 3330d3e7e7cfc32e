use std::time::Duration;

use thiserror::Error;

use crate::{cache::StoreError, source::SourceError};

/// Errors that stop the controller as a whole.
///
/// Per-event problems never surface here: they are folded into a
/// [`ProcessOutcome`](crate::model::ProcessOutcome) or retried by the worker.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("failed to read object {key} from the local cache: {source}")]
    CacheLookup {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("timed out after {0:?} waiting for caches to sync")]
    CacheSyncTimeout(Duration),

    #[error("watch source error: {0}")]
    Source(#[from] SourceError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
