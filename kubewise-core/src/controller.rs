//! The worker side of the pipeline and the lifecycle that ties it together.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::{IndexedCache, ObjectStore},
    classifier::{ClassifyError, EventClassifier, HelmReleaseClassifier},
    config::ControllerConfig,
    dispatch::{DispatchStatus, Dispatcher, NotificationHandler},
    error::{ControllerError, Result},
    events::{ControllerEvent, ErrorSink, InProcEventBus, TracingErrorSink},
    model::{
        DropReason, ItemOutcome, ProcessOutcome, Release, Secret, WatchEvent,
    },
    queue::{RateLimiter, WorkQueue},
    source::WatchSource,
    suppression::{SuppressionFilter, Verdict},
    watcher::ResourceWatcher,
};

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// Failure of a single processing attempt.
enum ProcessError {
    /// Worth retrying with backoff.
    Transient(String),
    /// Ends the controller.
    Fatal(ControllerError),
}

/// Calls [`WorkQueue::done`] for the dequeued item however the iteration ends.
struct InFlight<'a> {
    queue: &'a WorkQueue<WatchEvent>,
    item: WatchEvent,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.item);
    }
}

/// Assembles a [`Controller`]; every collaborator except the source has a
/// default.
pub struct ControllerBuilder {
    source: Arc<dyn WatchSource>,
    config: ControllerConfig,
    handlers: Vec<Arc<dyn NotificationHandler>>,
    cache: Option<Arc<dyn ObjectStore>>,
    classifier: Option<Arc<dyn EventClassifier>>,
    rate_limiter: Option<Box<dyn RateLimiter<WatchEvent>>>,
    started_at: Option<DateTime<Utc>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
    events: Option<Arc<InProcEventBus>>,
}

impl fmt::Debug for ControllerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerBuilder")
            .field("namespace", &self.source.namespace())
            .field("config", &self.config)
            .field("handlers", &self.handlers.len())
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl ControllerBuilder {
    /// Starts from the default config with no handlers registered.
    pub fn new(source: Arc<dyn WatchSource>) -> Self {
        Self {
            source,
            config: ControllerConfig::default(),
            handlers: Vec::new(),
            cache: None,
            classifier: None,
            rate_limiter: None,
            started_at: None,
            error_sink: None,
            events: None,
        }
    }

    /// Replaces the retry, dispatch and watch settings wholesale.
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers one more handler; handlers are called in registration order.
    pub fn with_handler(mut self, handler: Arc<dyn NotificationHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Registers several handlers at once.
    pub fn with_handlers(
        mut self,
        handlers: impl IntoIterator<Item = Arc<dyn NotificationHandler>>,
    ) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Shares an existing store instead of a fresh [`IndexedCache`].
    pub fn with_cache(mut self, cache: Arc<dyn ObjectStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replaces the Helm release decoder.
    pub fn with_classifier(mut self, classifier: Arc<dyn EventClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Replaces the exponential backoff derived from the retry config.
    pub fn with_rate_limiter(mut self, limiter: Box<dyn RateLimiter<WatchEvent>>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Overrides the start instant used for startup-replay suppression.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Receives items abandoned after the last retry. Defaults to [`TracingErrorSink`].
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Publishes settled items on a caller-owned bus.
    pub fn with_event_bus(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Fixes the start instant (now, unless overridden) and wires the pipeline.
    pub fn build(self) -> Controller {
        let queue = match self.rate_limiter {
            Some(limiter) => WorkQueue::new(limiter),
            None => WorkQueue::exponential(&self.config.retry),
        };
        let started_at = self.started_at.unwrap_or_else(Utc::now);

        Controller {
            dispatcher: Dispatcher::new(self.handlers, &self.config.dispatch),
            filter: SuppressionFilter::new(started_at),
            source: self.source,
            cache: self.cache.unwrap_or_else(|| Arc::new(IndexedCache::new())),
            queue,
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(HelmReleaseClassifier::new())),
            error_sink: self
                .error_sink
                .unwrap_or_else(|| Arc::new(TracingErrorSink::new())),
            events: self.events.unwrap_or_default(),
            config: self.config,
        }
    }
}

/// Watches release records and notifies handlers about lifecycle changes.
///
/// A single worker drains the queue, so at most one item is processed at a
/// time and per-key order is the order the watcher produced.
pub struct Controller {
    config: ControllerConfig,
    source: Arc<dyn WatchSource>,
    cache: Arc<dyn ObjectStore>,
    queue: WorkQueue<WatchEvent>,
    classifier: Arc<dyn EventClassifier>,
    filter: SuppressionFilter,
    dispatcher: Dispatcher,
    error_sink: Arc<dyn ErrorSink>,
    events: Arc<InProcEventBus>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("namespace", &self.source.namespace())
            .field("config", &self.config)
            .field("started_at", &self.filter.started_at())
            .field("queue", &self.queue)
            .field("dispatcher", &self.dispatcher)
            .field("events", &self.events)
            .finish()
    }
}

impl Controller {
    /// Shorthand for [`ControllerBuilder::new`].
    pub fn builder(source: Arc<dyn WatchSource>) -> ControllerBuilder {
        ControllerBuilder::new(source)
    }

    /// Records created at or before this instant are not announced.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.filter.started_at()
    }

    /// Settings the controller was built with.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The work queue the watcher fills and the worker drains.
    pub fn queue(&self) -> &WorkQueue<WatchEvent> {
        &self.queue
    }

    /// The cache the watcher keeps in step with the cluster.
    pub fn cache(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.cache)
    }

    /// Bus carrying one [`ControllerEvent`] per settled item.
    pub fn events(&self) -> Arc<InProcEventBus> {
        Arc::clone(&self.events)
    }

    /// Runs the watcher and the worker until `shutdown` fires.
    ///
    /// Waits for the first listing, announces the startup inventory, then
    /// processes queue items. Work in flight when `shutdown` fires is
    /// abandoned. Returns an error when the cache cannot be read or does not
    /// sync in time.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            target: "kubewise::worker",
            namespace = self.source.namespace().unwrap_or("<all>"),
            marker_type = %self.config.watch.marker_type,
            handlers = self.dispatcher.handler_count(),
            started_at = %self.started_at(),
            "starting controller"
        );

        let stop = shutdown.child_token();
        let watcher = ResourceWatcher::new(
            Arc::clone(&self.source),
            Arc::clone(&self.cache),
            self.queue.clone(),
            &self.config.watch,
        );
        let mut watcher_task = tokio::spawn(watcher.run(stop.clone()));

        let mut watcher_joined = None;
        let worker_result = tokio::select! {
            result = self.run_worker(&stop) => result,
            joined = &mut watcher_task => {
                watcher_joined = Some(joined);
                Ok(())
            }
        };

        stop.cancel();
        self.queue.shut_down();
        let joined = match watcher_joined {
            Some(joined) => joined,
            None => watcher_task.await,
        };
        let watcher_result = joined.unwrap_or_else(|err| {
            Err(ControllerError::Internal(format!("watcher task failed: {err}")))
        });

        info!(target: "kubewise::worker", "controller stopped");
        worker_result.and(watcher_result)
    }

    async fn run_worker(&self, stop: &CancellationToken) -> Result<()> {
        if !self.wait_for_cache_sync(stop).await? {
            return Ok(());
        }
        self.announce_startup().await?;

        loop {
            let processed = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                processed = self.process_next_item() => processed?,
            };
            if processed.is_none() {
                return Ok(());
            }
        }
    }

    /// Returns `false` if `stop` fired first.
    async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> Result<bool> {
        let deadline = self.config.watch.cache_sync_timeout();
        let synced = async {
            let mut ticker = tokio::time::interval(CACHE_SYNC_POLL);
            while !self.cache.has_synced() {
                ticker.tick().await;
            }
        };

        tokio::select! {
            _ = stop.cancelled() => Ok(false),
            waited = tokio::time::timeout(deadline, synced) => {
                waited.map_err(|_| ControllerError::CacheSyncTimeout(deadline))?;
                debug!(target: "kubewise::worker", "cache synced");
                Ok(true)
            }
        }
    }

    /// Hands every decodable release in the cache to the handlers once.
    async fn announce_startup(&self) -> Result<()> {
        let objects = self.cache.list().map_err(|source| ControllerError::CacheLookup {
            key: "<all>".to_string(),
            source,
        })?;

        let marker = self.config.watch.marker_type.as_str();
        let mut releases: Vec<Release> = objects
            .iter()
            .filter(|object| object.subtype() == marker)
            .filter_map(|object| Secret::from_object(object).ok())
            .filter_map(|secret| Release::from_secret(&secret).ok())
            .collect();
        releases.sort_by(|l, r| {
            (&l.namespace, &l.name, l.version).cmp(&(&r.namespace, &r.name, r.version))
        });

        info!(
            target: "kubewise::worker",
            releases = releases.len(),
            "announcing startup inventory"
        );
        let report = self.dispatcher.announce_startup(Arc::new(releases)).await;
        if let DispatchStatus::Retry { error } | DispatchStatus::DeadLetter { error } =
            report.status()
        {
            warn!(target: "kubewise::worker", "startup announcement failed: {error}");
        }
        Ok(())
    }

    /// Takes one item off the queue and settles it.
    ///
    /// Returns `None` once the queue is shut down. Errors only when the
    /// cache itself failed; every per-event problem is an [`ItemOutcome`].
    pub async fn process_next_item(&self) -> Result<Option<ItemOutcome>> {
        let Some(event) = self.queue.get().await else {
            return Ok(None);
        };
        let _in_flight = InFlight {
            queue: &self.queue,
            item: event.clone(),
        };

        let outcome = match self.process_item(&event).await {
            Ok(outcome) => {
                self.queue.forget(&event);
                ItemOutcome::Processed(outcome)
            }
            Err(ProcessError::Transient(error)) => self.handle_failure(&event, error),
            Err(ProcessError::Fatal(err)) => return Err(err),
        };

        debug!(target: "kubewise::worker", event = %event, outcome = ?outcome, "item settled");
        self.events
            .publish(ControllerEvent::new(event, outcome.clone()));
        Ok(Some(outcome))
    }

    fn handle_failure(&self, event: &WatchEvent, error: String) -> ItemOutcome {
        let retries = self.queue.num_requeues(event);
        if retries < self.config.retry.max_retries {
            let delay = self.queue.add_rate_limited(event.clone());
            warn!(
                target: "kubewise::worker",
                event = %event,
                attempt = retries + 1,
                ?delay,
                "processing failed, retrying: {error}"
            );
            ItemOutcome::Retried {
                attempt: retries + 1,
                delay,
                error,
            }
        } else {
            self.queue.forget(event);
            self.error_sink.report(event, &error);
            ItemOutcome::Abandoned { error }
        }
    }

    async fn process_item(
        &self,
        event: &WatchEvent,
    ) -> std::result::Result<ProcessOutcome, ProcessError> {
        let snapshot = match self.cache.get(&event.key) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(target: "kubewise::worker", key = %event.key, "object no longer cached");
                return Ok(ProcessOutcome::Dropped(DropReason::Vanished));
            }
            Err(source) => {
                return Err(ProcessError::Fatal(ControllerError::CacheLookup {
                    key: event.key.to_string(),
                    source,
                }));
            }
        };

        if let Err(err) = Secret::from_object(&snapshot) {
            warn!(target: "kubewise::worker", key = %event.key, "skipping object: {err}");
            return Ok(ProcessOutcome::Dropped(DropReason::TypeMismatch));
        }
        if event.subtype != self.config.watch.marker_type {
            debug!(
                target: "kubewise::worker",
                key = %event.key,
                subtype = %event.subtype,
                "not a release record"
            );
            return Ok(ProcessOutcome::Dropped(DropReason::NotRelease(
                event.subtype.clone(),
            )));
        }

        let release_event = match self.classifier.classify(event.raw_type, snapshot) {
            Ok(release_event) => release_event,
            Err(ClassifyError::Init(msg)) => {
                warn!(target: "kubewise::worker", key = %event.key, "dropping event: {msg}");
                return Ok(ProcessOutcome::Dropped(DropReason::ClassifierInit(msg)));
            }
            Err(ClassifyError::Transient(msg)) => return Err(ProcessError::Transient(msg)),
        };

        if let Verdict::Suppress(reason) = self.filter.evaluate(&release_event) {
            debug!(
                target: "kubewise::worker",
                key = %event.key,
                action = %release_event.action,
                ?reason,
                "suppressed"
            );
            return Ok(ProcessOutcome::Suppressed(reason));
        }

        let action = release_event.action;
        let report = self.dispatcher.dispatch(Arc::new(release_event)).await;
        match report.status() {
            DispatchStatus::Success => Ok(ProcessOutcome::Dispatched { action }),
            DispatchStatus::Retry { error } => Err(ProcessError::Transient(error)),
            DispatchStatus::DeadLetter { error } => {
                warn!(target: "kubewise::worker", key = %event.key, "undeliverable: {error}");
                Ok(ProcessOutcome::Dropped(DropReason::Undeliverable(error)))
            }
        }
    }
}
