mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use kubewise_core::{
    Controller, ControllerError, DEFAULT_MARKER_TYPE, DropReason, IndexedCache, ItemOutcome,
    MemoryCluster, NotificationHandler, NotifyError, ObjectKey, ObjectStore, ProcessOutcome,
    RawEventType, ReleaseAction, ReleaseEvent, StoreError, TracingErrorSink, WatchEvent,
    WatchedObject,
};
use serde_json::{Value, json};

use common::{Recorder, release_secret};

struct Harness {
    controller: Controller,
    cache: Arc<IndexedCache>,
    sink: Arc<TracingErrorSink>,
    recorder: Arc<Recorder>,
}

fn harness(recorder: Arc<Recorder>) -> Harness {
    let cache = Arc::new(IndexedCache::new());
    let sink = Arc::new(TracingErrorSink::new());
    let controller = Controller::builder(Arc::new(MemoryCluster::new().source(None)))
        .with_cache(cache.clone())
        .with_error_sink(sink.clone())
        .with_handler(recorder.clone() as Arc<dyn NotificationHandler>)
        .with_started_at(Utc::now())
        .build();
    Harness {
        controller,
        cache,
        sink,
        recorder,
    }
}

fn cached(cache: &IndexedCache, document: Value) -> WatchEvent {
    let object = WatchedObject::from_value(document).expect("object");
    let key = object.key().expect("key");
    let subtype = object.subtype().to_string();
    cache.put(key.clone(), Arc::new(object)).expect("put");
    WatchEvent::new(key, RawEventType::Update, subtype)
}

async fn settle(harness: &Harness, event: WatchEvent) -> ItemOutcome {
    harness.controller.queue().add(event);
    harness
        .controller
        .process_next_item()
        .await
        .expect("cache readable")
        .expect("queue open")
}

#[tokio::test]
async fn delete_for_evicted_key_is_not_an_error() {
    let h = harness(Recorder::new());
    let event = WatchEvent::new(
        ObjectKey::new(Some("team-a"), "sh.helm.release.v1.rel-3.v1"),
        RawEventType::Delete,
        DEFAULT_MARKER_TYPE,
    );

    let outcome = settle(&h, event.clone()).await;
    assert_eq!(outcome, ItemOutcome::Processed(ProcessOutcome::Dropped(DropReason::Vanished)));
    assert!(h.recorder.events().is_empty());
    assert_eq!(h.sink.reported(), 0);
    assert_eq!(h.controller.queue().num_requeues(&event), 0);
}

#[tokio::test]
async fn non_release_objects_are_dropped_without_retry() {
    let h = harness(Recorder::new());

    let config_map = cached(
        &h.cache,
        json!({
            "kind": "ConfigMap",
            "metadata": { "name": "settings", "namespace": "team-a" }
        }),
    );
    assert_eq!(
        settle(&h, config_map).await,
        ItemOutcome::Processed(ProcessOutcome::Dropped(DropReason::TypeMismatch))
    );

    let opaque = cached(
        &h.cache,
        json!({
            "kind": "Secret",
            "metadata": { "name": "db-password", "namespace": "team-a" },
            "type": "Opaque",
            "data": {}
        }),
    );
    assert_eq!(
        settle(&h, opaque).await,
        ItemOutcome::Processed(ProcessOutcome::Dropped(DropReason::NotRelease("Opaque".into())))
    );

    let corrupt = cached(
        &h.cache,
        json!({
            "kind": "Secret",
            "metadata": { "name": "sh.helm.release.v1.broken.v1", "namespace": "team-a" },
            "type": DEFAULT_MARKER_TYPE,
            "data": { "release": "bm90LWJhc2U2NA==" }
        }),
    );
    assert!(matches!(
        settle(&h, corrupt).await,
        ItemOutcome::Processed(ProcessOutcome::Dropped(DropReason::ClassifierInit(_)))
    ));

    assert!(h.recorder.events().is_empty());
    assert_eq!(h.sink.reported(), 0);
}

#[tokio::test]
async fn updates_dispatch_regardless_of_age() {
    let h = harness(Recorder::new());
    let event = cached(
        &h.cache,
        release_secret("team-a", "web", 3, "deployed", Utc::now() - chrono::Duration::days(3)),
    );
    assert_eq!(
        settle(&h, event.clone()).await,
        ItemOutcome::Processed(ProcessOutcome::Dispatched {
            action: ReleaseAction::Upgrade
        })
    );
    assert_eq!(h.controller.queue().num_requeues(&event), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_five_times_then_reported() {
    let h = harness(Recorder::failing(NotifyError::Transient("slack is down".into())));
    let event = cached(
        &h.cache,
        release_secret("team-a", "rel-4", 2, "deployed", Utc::now()),
    );
    h.controller.queue().add(event.clone());

    let mut delays = Vec::new();
    let abandoned = loop {
        let outcome = h
            .controller
            .process_next_item()
            .await
            .expect("cache readable")
            .expect("queue open");
        match outcome {
            ItemOutcome::Retried { attempt, delay, .. } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay);
            }
            ItemOutcome::Abandoned { error } => break error,
            other => panic!("unexpected outcome {other:?}"),
        }
    };

    assert_eq!(delays.len(), 5);
    assert!(delays.windows(2).all(|pair| pair[0] < pair[1]), "{delays:?}");
    assert!(abandoned.contains("slack is down"));
    assert_eq!(h.recorder.events().len(), 6);
    assert_eq!(h.sink.reported(), 1);
    assert_eq!(h.controller.queue().num_requeues(&event), 0);

    let again = tokio::time::timeout(Duration::from_secs(60), h.controller.queue().get()).await;
    assert!(again.is_err(), "abandoned item must not come back");
}

#[tokio::test]
async fn permanent_rejection_drops_the_event() {
    let h = harness(Recorder::failing(NotifyError::Rejected("channel_not_found".into())));
    let event = cached(
        &h.cache,
        release_secret("team-a", "web", 2, "deployed", Utc::now()),
    );
    let outcome = settle(&h, event).await;
    assert!(matches!(
        outcome,
        ItemOutcome::Processed(ProcessOutcome::Dropped(DropReason::Undeliverable(_)))
    ));
    assert_eq!(h.sink.reported(), 0);
}

struct BrokenStore;

impl ObjectStore for BrokenStore {
    fn get(&self, _key: &ObjectKey) -> Result<Option<Arc<WatchedObject>>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn put(
        &self,
        _key: ObjectKey,
        _object: Arc<WatchedObject>,
    ) -> Result<Option<Arc<WatchedObject>>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn delete(&self, _key: &ObjectKey) -> Result<Option<Arc<WatchedObject>>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn keys(&self) -> Result<Vec<ObjectKey>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn list(&self) -> Result<Vec<Arc<WatchedObject>>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn has_synced(&self) -> bool {
        true
    }

    fn mark_synced(&self) {}
}

#[tokio::test]
async fn unreadable_cache_stops_the_worker() {
    let controller = Controller::builder(Arc::new(MemoryCluster::new().source(None)))
        .with_cache(Arc::new(BrokenStore))
        .build();
    controller.queue().add(WatchEvent::new(
        ObjectKey::new(Some("team-a"), "x"),
        RawEventType::Update,
        DEFAULT_MARKER_TYPE,
    ));

    let err = controller.process_next_item().await.expect_err("fatal");
    assert!(matches!(err, ControllerError::CacheLookup { .. }));
}

/// Slow handler that records how many of its calls overlapped.
#[derive(Default)]
struct Overlap {
    started: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[async_trait]
impl NotificationHandler for Overlap {
    fn name(&self) -> &str {
        "overlap"
    }

    async fn handle_event(&self, _event: &ReleaseEvent) -> Result<(), NotifyError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn key_retriggered_while_in_flight_runs_again_afterwards() {
    let handler = Arc::new(Overlap::default());
    let cache = Arc::new(IndexedCache::new());
    let controller = Arc::new(
        Controller::builder(Arc::new(MemoryCluster::new().source(None)))
            .with_cache(cache.clone())
            .with_handler(handler.clone() as Arc<dyn NotificationHandler>)
            .with_started_at(Utc::now())
            .build(),
    );
    let event = cached(
        &cache,
        release_secret("team-a", "rel-1", 2, "deployed", Utc::now()),
    );
    controller.queue().add(event.clone());

    let worker = |controller: Arc<Controller>| {
        tokio::spawn(async move { controller.process_next_item().await })
    };
    let first = worker(controller.clone());
    while handler.started.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    // Re-triggered mid-delivery: parked until the first delivery finishes.
    assert!(controller.queue().add(event.clone()));
    assert!(controller.queue().is_empty());
    let second = worker(controller.clone());

    let upgrade = ItemOutcome::Processed(ProcessOutcome::Dispatched {
        action: ReleaseAction::Upgrade,
    });
    for task in [first, second] {
        let outcome = task
            .await
            .expect("join")
            .expect("cache readable")
            .expect("queue open");
        assert_eq!(outcome, upgrade);
    }
    assert_eq!(handler.started.load(Ordering::SeqCst), 2);
    assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
    assert!(controller.queue().is_empty());
}
