use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use super::{ObjectList, SourceError, WatchNotification, WatchSource, WatchStream};
use crate::model::{ObjectKey, WatchedObject};

const LIVE_CHANNEL_CAPACITY: usize = 1024;

type Revision = u64;

struct ClusterState {
    objects: BTreeMap<ObjectKey, WatchedObject>,
    history: VecDeque<(Revision, WatchNotification)>,
    revision: Revision,
    /// Watches must resume from at least this revision.
    oldest_watchable: Revision,
}

struct ClusterInner {
    state: Mutex<ClusterState>,
    live: broadcast::Sender<(Revision, WatchNotification)>,
}

/// In-process stand-in for the cluster API.
///
/// Every write bumps a global revision and is appended to a change history,
/// so watches can resume from any revision newer than the last
/// [`compact`](Self::compact).
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (objects, revision) = self
            .inner
            .state
            .try_lock()
            .map(|state| (state.objects.len(), state.revision))
            .unwrap_or_default();
        f.debug_struct("MemoryCluster")
            .field("objects", &objects)
            .field("revision", &revision)
            .field("watchers", &self.inner.live.receiver_count())
            .finish()
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClusterInner {
                state: Mutex::new(ClusterState {
                    objects: BTreeMap::new(),
                    history: VecDeque::new(),
                    revision: 0,
                    oldest_watchable: 0,
                }),
                live,
            }),
        }
    }

    /// Creates or replaces an object.
    ///
    /// The stored copy gets a fresh `resourceVersion`, and a
    /// `creationTimestamp` of now when the document carries none.
    pub fn apply(&self, document: Value) -> Result<WatchedObject, SourceError> {
        let mut object = WatchedObject::from_value(document)?;
        let key = object
            .key()
            .map_err(|err| SourceError::InvalidObject(err.to_string()))?;

        let mut state = self.inner.state.lock();
        state.revision += 1;
        let revision = state.revision;

        let created = match state.objects.get(&key) {
            Some(existing) => existing.metadata.creation_timestamp,
            None => object.metadata.creation_timestamp,
        }
        .unwrap_or_else(Utc::now);
        if let Some(meta) = object
            .raw
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            meta.insert(
                "resourceVersion".into(),
                Value::String(revision.to_string()),
            );
            meta.insert(
                "creationTimestamp".into(),
                Value::String(created.to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
        let object = WatchedObject::from_value(object.raw)?;

        let notification = if state.objects.contains_key(&key) {
            WatchNotification::Modified(object.clone())
        } else {
            WatchNotification::Added(object.clone())
        };
        state.objects.insert(key, object.clone());
        self.record(&mut state, revision, notification);
        Ok(object)
    }

    /// Removes an object, returning the last stored copy.
    pub fn delete(&self, namespace: Option<&str>, name: &str) -> Option<WatchedObject> {
        let key = ObjectKey::new(namespace, name);
        let mut state = self.inner.state.lock();
        let removed = state.objects.remove(&key)?;
        state.revision += 1;
        let revision = state.revision;
        self.record(&mut state, revision, WatchNotification::Deleted(removed.clone()));
        Some(removed)
    }

    /// Discards the change history; older resource versions become `Gone`.
    pub fn compact(&self) {
        let mut state = self.inner.state.lock();
        state.history.clear();
        state.oldest_watchable = state.revision;
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<WatchedObject> {
        let key = ObjectKey::new(namespace, name);
        self.inner.state.lock().objects.get(&key).cloned()
    }

    /// A [`WatchSource`] over this cluster, optionally scoped to a namespace.
    pub fn source(&self, namespace: Option<&str>) -> InMemorySource {
        InMemorySource {
            cluster: self.clone(),
            namespace: namespace.map(str::to_string),
        }
    }

    fn record(
        &self,
        state: &mut ClusterState,
        revision: Revision,
        notification: WatchNotification,
    ) {
        state.history.push_back((revision, notification.clone()));
        // No receivers is fine: the history still serves later watches.
        let _ = self.inner.live.send((revision, notification));
    }
}

/// [`WatchSource`] backed by a [`MemoryCluster`].
#[derive(Clone, Debug)]
pub struct InMemorySource {
    cluster: MemoryCluster,
    namespace: Option<String>,
}

fn in_scope(namespace: Option<&str>, notification: &WatchNotification) -> bool {
    let Some(namespace) = namespace else {
        return true;
    };
    match notification {
        WatchNotification::Added(object)
        | WatchNotification::Modified(object)
        | WatchNotification::Deleted(object) => object.namespace() == Some(namespace),
        WatchNotification::Bookmark { .. } => true,
    }
}

#[async_trait]
impl WatchSource for InMemorySource {
    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    async fn list(&self) -> Result<ObjectList, SourceError> {
        let state = self.cluster.inner.state.lock();
        let items = state
            .objects
            .values()
            .filter(|object| match self.namespace() {
                Some(ns) => object.namespace() == Some(ns),
                None => true,
            })
            .cloned()
            .collect();
        Ok(ObjectList {
            items,
            resource_version: Some(state.revision.to_string()),
        })
    }

    async fn watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<WatchStream, SourceError> {
        let state = self.cluster.inner.state.lock();
        let from = match resource_version.as_deref() {
            Some(rv) => rv
                .parse::<Revision>()
                .map_err(|_| SourceError::Gone(format!("unknown resource version {rv:?}")))?,
            None => state.revision,
        };
        if from < state.oldest_watchable {
            return Err(SourceError::Gone(format!(
                "resource version {from} is older than {}",
                state.oldest_watchable
            )));
        }

        let namespace = self.namespace.clone();
        let replay: Vec<_> = state
            .history
            .iter()
            .filter(|(revision, n)| *revision > from && in_scope(namespace.as_deref(), n))
            .map(|(_, n)| Ok(n.clone()))
            .collect();
        let last_replayed = state.revision;
        // Subscribed under the state lock, so no write can fall between the
        // replayed history and the live feed.
        let live = BroadcastStream::new(self.cluster.inner.live.subscribe());
        drop(state);

        let live = live.filter_map(move |item| {
            let namespace = namespace.clone();
            async move {
                match item {
                    Ok((revision, notification))
                        if revision > last_replayed
                            && in_scope(namespace.as_deref(), &notification) =>
                    {
                        Some(Ok(notification))
                    }
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(
                        SourceError::Gone(format!("watch fell behind by {missed} events")),
                    )),
                }
            }
        });

        Ok(futures::stream::iter(replay).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret(ns: &str, name: &str) -> Value {
        json!({
            "kind": "Secret",
            "metadata": { "name": name, "namespace": ns },
            "type": "Opaque"
        })
    }

    #[tokio::test]
    async fn listing_respects_namespace_scope() {
        let cluster = MemoryCluster::new();
        cluster.apply(secret("a", "one")).expect("apply");
        cluster.apply(secret("b", "two")).expect("apply");

        let all = cluster.source(None).list().await.expect("list");
        assert_eq!(all.items.len(), 2);

        let scoped = cluster.source(Some("a")).list().await.expect("list");
        assert_eq!(scoped.items.len(), 1);
        assert_eq!(scoped.items[0].metadata.name, "one");
        assert_eq!(scoped.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn apply_stamps_versions_and_keeps_creation_time() {
        let cluster = MemoryCluster::new();
        let first = cluster.apply(secret("a", "one")).expect("apply");
        let second = cluster.apply(secret("a", "one")).expect("apply");

        assert_eq!(first.resource_version(), Some("1"));
        assert_eq!(second.resource_version(), Some("2"));
        assert!(first.creation_timestamp().is_some());
        assert_eq!(first.creation_timestamp(), second.creation_timestamp());
    }

    #[tokio::test]
    async fn watch_replays_history_then_follows_live_changes() {
        let cluster = MemoryCluster::new();
        cluster.apply(secret("a", "one")).expect("apply");
        let source = cluster.source(Some("a"));

        let mut stream = source.watch(Some("0".into())).await.expect("watch");
        cluster.apply(secret("b", "ignored")).expect("apply");
        cluster.delete(Some("a"), "one").expect("delete");

        let replayed = stream.next().await.expect("item").expect("ok");
        assert!(matches!(replayed, WatchNotification::Added(_)));
        let live = stream.next().await.expect("item").expect("ok");
        assert!(matches!(live, WatchNotification::Deleted(_)));
    }

    #[tokio::test]
    async fn compacted_versions_are_gone() {
        let cluster = MemoryCluster::new();
        cluster.apply(secret("a", "one")).expect("apply");
        cluster.apply(secret("a", "two")).expect("apply");
        cluster.compact();

        let err = cluster
            .source(None)
            .watch(Some("1".into()))
            .await
            .err()
            .expect("gone");
        assert!(err.requires_relist());
    }
}
