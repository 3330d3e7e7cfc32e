//! List-then-watch driver feeding the cache and the work queue.

use std::{collections::HashSet, fmt, sync::Arc};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    cache::{ObjectStore, StoreError},
    config::WatchConfig,
    error::{ControllerError, Result},
    model::{ObjectKey, RawEventType, WatchEvent, WatchedObject},
    queue::{BackoffPolicy, ExponentialBackoff, WorkQueue},
    source::{SourceError, WatchNotification, WatchSource},
};

/// Mirrors a [`WatchSource`] into an [`ObjectStore`] and enqueues one
/// [`WatchEvent`] per change.
///
/// The cache is always written before the matching event is enqueued, so a
/// worker never dequeues a key whose newest state it cannot read yet.
pub struct ResourceWatcher {
    source: Arc<dyn WatchSource>,
    cache: Arc<dyn ObjectStore>,
    queue: WorkQueue<WatchEvent>,
    backoff: ExponentialBackoff,
}

impl fmt::Debug for ResourceWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceWatcher")
            .field("namespace", &self.source.namespace())
            .field("queue", &self.queue)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl ResourceWatcher {
    pub fn new(
        source: Arc<dyn WatchSource>,
        cache: Arc<dyn ObjectStore>,
        queue: WorkQueue<WatchEvent>,
        config: &WatchConfig,
    ) -> Self {
        Self {
            source,
            cache,
            queue,
            backoff: ExponentialBackoff::new(
                config.relist_backoff_base(),
                config.relist_backoff_max(),
            ),
        }
    }

    /// Runs until `shutdown` fires. Only a failing cache ends it early.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut needs_list = true;
        let mut resource_version: Option<String> = None;
        let mut failures: u32 = 0;

        'watch: loop {
            if shutdown.is_cancelled() {
                break;
            }

            if needs_list {
                let listed = tokio::select! {
                    _ = shutdown.cancelled() => break 'watch,
                    listed = self.relist() => listed,
                };
                match listed {
                    Ok(version) => {
                        needs_list = false;
                        resource_version = version;
                        failures = 0;
                    }
                    Err(WatchError::Store(err)) => return Err(err),
                    Err(WatchError::Source(err)) => {
                        warn!(target: "kubewise::watcher", "listing failed: {err}");
                        if !self.pause(&shutdown, &mut failures).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let stream = tokio::select! {
                _ = shutdown.cancelled() => break 'watch,
                stream = self.source.watch(resource_version.clone()) => stream,
            };
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    needs_list |= err.requires_relist();
                    warn!(target: "kubewise::watcher", "failed to start watch: {err}");
                    if !self.pause(&shutdown, &mut failures).await {
                        break;
                    }
                    continue;
                }
            };
            debug!(
                target: "kubewise::watcher",
                resource_version = resource_version.as_deref().unwrap_or("<now>"),
                "watch started"
            );

            let mut received = false;
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break 'watch,
                    next = stream.next() => next,
                };
                match next {
                    None if received => {
                        debug!(target: "kubewise::watcher", "watch stream ended, resuming");
                        continue 'watch;
                    }
                    None => {
                        debug!(target: "kubewise::watcher", "watch stream ended empty");
                        if !self.pause(&shutdown, &mut failures).await {
                            break 'watch;
                        }
                        continue 'watch;
                    }
                    Some(Ok(notification)) => {
                        received = true;
                        failures = 0;
                        if let Some(version) = notification.resource_version() {
                            resource_version = Some(version.to_string());
                        }
                        self.apply(notification)?;
                    }
                    Some(Err(err)) if err.requires_relist() => {
                        info!(target: "kubewise::watcher", "watch expired, relisting: {err}");
                        needs_list = true;
                        continue 'watch;
                    }
                    Some(Err(err)) => {
                        warn!(target: "kubewise::watcher", "watch stream error: {err}");
                        if !self.pause(&shutdown, &mut failures).await {
                            break 'watch;
                        }
                        continue 'watch;
                    }
                }
            }
        }

        debug!(target: "kubewise::watcher", "watcher stopped");
        Ok(())
    }

    /// Sleeps for the next backoff step. Returns `false` if shutdown fired.
    async fn pause(&self, shutdown: &CancellationToken, failures: &mut u32) -> bool {
        let delay = self.backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn in_scope(&self, object: &WatchedObject) -> bool {
        match self.source.namespace() {
            Some(namespace) => object.namespace() == Some(namespace),
            None => true,
        }
    }

    fn scoped_key(&self, object: &WatchedObject) -> Option<ObjectKey> {
        if !self.in_scope(object) {
            trace!(
                target: "kubewise::watcher",
                namespace = object.namespace().unwrap_or_default(),
                "ignoring object outside the watched namespace"
            );
            return None;
        }
        match object.key() {
            Ok(key) => Some(key),
            Err(err) => {
                debug!(target: "kubewise::watcher", "dropping notification: {err}");
                None
            }
        }
    }

    /// Full listing reconciled against the cache: changed survivors become
    /// updates, newcomers creates, and cached keys missing from the listing
    /// deletes. Survivors whose `resourceVersion` did not move are refreshed
    /// in the cache without an event.
    async fn relist(&self) -> std::result::Result<Option<String>, WatchError> {
        let list = self.source.list().await?;
        let initial = !self.cache.has_synced();
        let mut seen = HashSet::with_capacity(list.items.len());
        let mut unchanged = 0usize;

        for object in list.items {
            let Some(key) = self.scoped_key(&object) else {
                continue;
            };
            let subtype = object.subtype().to_string();
            let version = object.resource_version().map(str::to_string);
            let previous = store(&key, self.cache.put(key.clone(), Arc::new(object)))?;
            seen.insert(key.clone());
            let raw_type = match previous {
                Some(previous) if !initial => {
                    if version.is_some() && previous.resource_version() == version.as_deref() {
                        unchanged += 1;
                        continue;
                    }
                    RawEventType::Update
                }
                _ => RawEventType::Create,
            };
            self.queue.add(WatchEvent::new(key, raw_type, subtype));
        }

        let mut removed = 0usize;
        for key in store(&ObjectKey::from("*"), self.cache.keys())? {
            if seen.contains(&key) {
                continue;
            }
            if let Some(object) = store(&key, self.cache.delete(&key))? {
                removed += 1;
                self.queue
                    .add(WatchEvent::new(key, RawEventType::Delete, object.subtype()));
            }
        }

        self.cache.mark_synced();
        info!(
            target: "kubewise::watcher",
            objects = seen.len(),
            unchanged,
            removed,
            initial,
            "listing reconciled"
        );
        Ok(list.resource_version)
    }

    fn apply(&self, notification: WatchNotification) -> Result<()> {
        let (object, raw_type) = match notification {
            WatchNotification::Added(object) => (object, RawEventType::Create),
            WatchNotification::Modified(object) => (object, RawEventType::Update),
            WatchNotification::Deleted(object) => (object, RawEventType::Delete),
            WatchNotification::Bookmark { .. } => return Ok(()),
        };
        let Some(key) = self.scoped_key(&object) else {
            return Ok(());
        };
        let subtype = object.subtype().to_string();

        if raw_type == RawEventType::Delete {
            store(&key, self.cache.delete(&key))?;
        } else {
            store(&key, self.cache.put(key.clone(), Arc::new(object)))?;
        }
        trace!(target: "kubewise::watcher", key = %key, %raw_type, "enqueue");
        self.queue.add(WatchEvent::new(key, raw_type, subtype));
        Ok(())
    }
}

enum WatchError {
    Source(SourceError),
    Store(ControllerError),
}

impl From<SourceError> for WatchError {
    fn from(err: SourceError) -> Self {
        WatchError::Source(err)
    }
}

impl From<ControllerError> for WatchError {
    fn from(err: ControllerError) -> Self {
        WatchError::Store(err)
    }
}

fn store<T>(key: &ObjectKey, result: std::result::Result<T, StoreError>) -> Result<T> {
    result.map_err(|source| ControllerError::CacheLookup {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::IndexedCache,
        config::RetryConfig,
        source::{MemoryCluster, ObjectList, WatchStream},
    };
    use serde_json::json;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn secret(ns: &str, name: &str) -> serde_json::Value {
        json!({
            "kind": "Secret",
            "metadata": { "name": name, "namespace": ns },
            "type": "helm.sh/release.v1"
        })
    }

    fn harness(
        cluster: &MemoryCluster,
        namespace: Option<&str>,
    ) -> (ResourceWatcher, Arc<IndexedCache>, WorkQueue<WatchEvent>) {
        let cache = Arc::new(IndexedCache::new());
        let queue = WorkQueue::exponential(&RetryConfig::default());
        let watcher = ResourceWatcher::new(
            Arc::new(cluster.source(namespace)),
            cache.clone(),
            queue.clone(),
            &WatchConfig::default(),
        );
        (watcher, cache, queue)
    }

    async fn drain(queue: &WorkQueue<WatchEvent>, n: usize) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        for _ in 0..n {
            let event = tokio::time::timeout(Duration::from_secs(5), queue.get())
                .await
                .expect("event in time")
                .expect("queue open");
            queue.done(&event);
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn initial_listing_enqueues_creates_and_syncs() {
        let cluster = MemoryCluster::new();
        cluster.apply(secret("a", "one")).expect("apply");
        cluster.apply(secret("a", "two")).expect("apply");
        let (watcher, cache, queue) = harness(&cluster, None);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(watcher.run(shutdown.clone()));

        let events = drain(&queue, 2).await;
        assert!(events.iter().all(|e| e.raw_type == RawEventType::Create));
        assert!(cache.has_synced());
        assert_eq!(cache.len(), 2);

        cluster.delete(Some("a"), "one");
        let events = drain(&queue, 1).await;
        assert_eq!(events[0].raw_type, RawEventType::Delete);
        assert_eq!(events[0].subtype, "helm.sh/release.v1");
        assert!(cache.get(&events[0].key).expect("get").is_none());

        shutdown.cancel();
        task.await.expect("join").expect("watcher result");
    }

    #[tokio::test]
    async fn other_namespaces_never_reach_the_queue() {
        let cluster = MemoryCluster::new();
        cluster.apply(secret("b", "outside")).expect("apply");
        let (watcher, cache, queue) = harness(&cluster, Some("a"));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(watcher.run(shutdown.clone()));

        cluster.apply(secret("b", "outside-2")).expect("apply");
        cluster.apply(secret("a", "inside")).expect("apply");

        let events = drain(&queue, 1).await;
        assert_eq!(events[0].key.as_str(), "a/inside");
        tokio::task::yield_now().await;
        assert!(queue.is_empty());
        assert_eq!(cache.len(), 1);

        shutdown.cancel();
        task.await.expect("join").expect("watcher result");
    }

    #[tokio::test]
    async fn relist_reconciles_cache_against_listing() {
        let cluster = MemoryCluster::new();
        cluster.apply(secret("a", "kept")).expect("apply");
        cluster.apply(secret("a", "changed")).expect("apply");
        cluster.apply(secret("a", "removed")).expect("apply");
        let (watcher, cache, queue) = harness(&cluster, None);

        watcher.relist().await.ok().expect("first listing");
        drain(&queue, 3).await;

        cluster.delete(Some("a"), "removed");
        cluster.apply(secret("a", "changed")).expect("reapply");
        cluster.apply(secret("a", "added")).expect("apply");
        watcher.relist().await.ok().expect("second listing");

        let mut events = drain(&queue, 3).await;
        events.sort_by(|l, r| l.key.cmp(&r.key));
        let summary: Vec<_> = events
            .iter()
            .map(|e| (e.key.as_str().to_string(), e.raw_type))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a/added".to_string(), RawEventType::Create),
                ("a/changed".to_string(), RawEventType::Update),
                ("a/removed".to_string(), RawEventType::Delete),
            ]
        );
        assert!(queue.is_empty(), "unchanged object was re-announced");
        assert_eq!(cache.len(), 3);
    }

    /// Lists nothing and serves watches that end immediately.
    #[derive(Default)]
    struct EmptySource {
        watches: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WatchSource for EmptySource {
        fn namespace(&self) -> Option<&str> {
            None
        }

        async fn list(&self) -> std::result::Result<ObjectList, SourceError> {
            Ok(ObjectList {
                items: Vec::new(),
                resource_version: Some("1".into()),
            })
        }

        async fn watch(
            &self,
            _resource_version: Option<String>,
        ) -> std::result::Result<WatchStream, SourceError> {
            self.watches.fetch_add(1, Ordering::SeqCst);
            Ok(futures::stream::empty().boxed())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_watch_streams_back_off() {
        let source = Arc::new(EmptySource::default());
        let watcher = ResourceWatcher::new(
            source.clone(),
            Arc::new(IndexedCache::new()),
            WorkQueue::exponential(&RetryConfig::default()),
            &WatchConfig::default(),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(watcher.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let watches = source.watches.load(Ordering::SeqCst);
        assert!((1..10).contains(&watches), "re-watched {watches} times in 10s");

        shutdown.cancel();
        task.await.expect("join").expect("watcher result");
    }
}
