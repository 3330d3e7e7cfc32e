//! Deduplicating work queue with delayed and rate-limited re-adds.
//!
//! Items move through three states: *queued* (in `dirty` and `queue`),
//! *processing* (handed out by [`WorkQueue::get`], until [`WorkQueue::done`])
//! and idle. An item is never queued twice and never handed to two consumers
//! at once; re-adding an item that is being processed marks it dirty so it is
//! queued again when the consumer calls `done`.

mod rate_limit;

pub use rate_limit::{
    BackoffPolicy, ExponentialBackoff, PerItemRateLimiter, RateLimiter,
};

use std::{
    any::type_name,
    collections::{HashSet, VecDeque},
    fmt,
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    ready: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    shutdown: CancellationToken,
}

/// Cloneable handle; every clone operates on the same queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (queued, processing, shutting_down) = self
            .shared
            .state
            .try_lock()
            .map(|state| {
                (state.queue.len(), state.processing.len(), state.shutting_down)
            })
            .unwrap_or_default();
        f.debug_struct("WorkQueue")
            .field("item_type", &type_name::<T>())
            .field("queued", &queued)
            .field("processing", &processing)
            .field("shutting_down", &shutting_down)
            .finish()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                limiter,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Queue with per-item exponential backoff taken from `config`.
    pub fn exponential(config: &RetryConfig) -> Self {
        let limiter: PerItemRateLimiter<T, ExponentialBackoff> =
            PerItemRateLimiter::exponential(config);
        Self::new(Box::new(limiter))
    }

    /// Queues `item` unless it is already pending.
    ///
    /// Returns `false` when the add was absorbed by a pending duplicate or the
    /// queue is shutting down. An item currently being processed is only
    /// marked dirty; [`done`](Self::done) queues it again.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return false;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return true;
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.ready.notify_one();
        true
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    ///
    /// Items queued before shutdown are not handed out afterwards.
    pub async fn get(&self) -> Option<T> {
        loop {
            let ready = self.shared.ready.notified();
            {
                let mut state = self.shared.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            ready.await;
        }
    }

    /// Marks `item` as no longer being processed.
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.shared.ready.notify_one();
        }
    }

    /// Adds `item` once `delay` has elapsed. Pending delayed adds are
    /// discarded on shutdown.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    queue.add(item);
                }
            }
        });
    }

    /// Re-adds `item` after the delay chosen by the rate limiter, which also
    /// records the retry. Returns that delay.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.shared.limiter.when(&item);
        self.add_after(item, delay);
        delay
    }

    /// Clears the retry history of `item`. Does not remove it from the queue.
    pub fn forget(&self, item: &T) {
        self.shared.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.limiter.num_requeues(item)
    }

    /// Items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting items and wakes every waiting consumer.
    pub fn shut_down(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.shutdown.cancel();
        self.shared.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }
}
