use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;

use crate::model::{ObjectKey, WatchedObject};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A writer panicked while holding the store lock.
    #[error("object store lock poisoned")]
    Poisoned,
    #[error("object store backend error: {0}")]
    Backend(String),
}

/// Local mirror of the watched collection, keyed by [`ObjectKey`].
///
/// The watcher is the only writer; the controller reads records back by key
/// when it processes a queue item. A lookup may legitimately return `None`
/// when the record was deleted after its key was enqueued.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<WatchedObject>>, StoreError>;

    /// Inserts or replaces the record, returning the previous one.
    fn put(
        &self,
        key: ObjectKey,
        object: Arc<WatchedObject>,
    ) -> Result<Option<Arc<WatchedObject>>, StoreError>;

    fn delete(&self, key: &ObjectKey) -> Result<Option<Arc<WatchedObject>>, StoreError>;

    fn keys(&self) -> Result<Vec<ObjectKey>, StoreError>;

    fn list(&self) -> Result<Vec<Arc<WatchedObject>>, StoreError>;

    /// True once the first complete listing has been written.
    fn has_synced(&self) -> bool;

    fn mark_synced(&self);
}

/// `HashMap`-backed [`ObjectStore`].
#[derive(Default)]
pub struct IndexedCache {
    objects: RwLock<HashMap<ObjectKey, Arc<WatchedObject>>>,
    synced: AtomicBool,
}

impl fmt::Debug for IndexedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .objects
            .try_read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("IndexedCache")
            .field("len", &len)
            .field("synced", &self.has_synced())
            .finish()
    }
}

impl IndexedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|guard| guard.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for IndexedCache {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<WatchedObject>>, StoreError> {
        let guard = self.objects.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(key).cloned())
    }

    fn put(
        &self,
        key: ObjectKey,
        object: Arc<WatchedObject>,
    ) -> Result<Option<Arc<WatchedObject>>, StoreError> {
        let mut guard = self.objects.write().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.insert(key, object))
    }

    fn delete(&self, key: &ObjectKey) -> Result<Option<Arc<WatchedObject>>, StoreError> {
        let mut guard = self.objects.write().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.remove(key))
    }

    fn keys(&self) -> Result<Vec<ObjectKey>, StoreError> {
        let guard = self.objects.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.keys().cloned().collect())
    }

    fn list(&self) -> Result<Vec<Arc<WatchedObject>>, StoreError> {
        let guard = self.objects.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.values().cloned().collect())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}
