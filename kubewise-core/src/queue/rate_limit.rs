use std::{any::type_name, collections::HashMap, fmt, hash::Hash, time::Duration};

use parking_lot::Mutex;

use crate::config::RetryConfig;

/// Maps an item's retry count to the delay before its next attempt.
pub trait BackoffPolicy: Send + Sync {
    /// `retries` is the number of retries already granted (0 on the first).
    fn delay(&self, retries: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, retries: u32) -> Duration {
        self(retries)
    }
}

/// `base * 2^retries`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl From<&RetryConfig> for ExponentialBackoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.backoff_base(), config.backoff_max())
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, retries: u32) -> Duration {
        2u32.checked_pow(retries)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Per-item retry bookkeeping consulted by
/// [`WorkQueue::add_rate_limited`](super::WorkQueue::add_rate_limited).
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next attempt; records one more retry for `item`.
    fn when(&self, item: &T) -> Duration;

    /// Clears the retry history of `item`.
    fn forget(&self, item: &T);

    /// Retries recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Tracks failures per item and asks a [`BackoffPolicy`] for the delay.
pub struct PerItemRateLimiter<T, P> {
    failures: Mutex<HashMap<T, u32>>,
    policy: P,
}

impl<T, P: fmt::Debug> fmt::Debug for PerItemRateLimiter<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self
            .failures
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("PerItemRateLimiter")
            .field("item_type", &type_name::<T>())
            .field("policy", &self.policy)
            .field("tracked", &tracked)
            .finish()
    }
}

impl<T, P> PerItemRateLimiter<T, P> {
    pub fn new(policy: P) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            policy,
        }
    }
}

impl<T> PerItemRateLimiter<T, ExponentialBackoff> {
    pub fn exponential(config: &RetryConfig) -> Self {
        Self::new(ExponentialBackoff::from(config))
    }
}

impl<T, P> RateLimiter<T> for PerItemRateLimiter<T, P>
where
    T: Clone + Eq + Hash + Send + Sync,
    P: BackoffPolicy,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock();
        let retries = failures.entry(item.clone()).or_insert(0);
        let delay = self.policy.delay(*retries);
        *retries = retries.saturating_add(1);
        delay
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_caps() {
        let policy =
            ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(100));
        let delays: Vec<_> = (0..7).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 100, 100]);
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(100));
    }

    #[test]
    fn limiter_counts_per_item() {
        let limiter = PerItemRateLimiter::new(|retries: u32| {
            Duration::from_secs(u64::from(retries) + 1)
        });

        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(2));
        assert_eq!(limiter.when(&"b"), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);
        assert_eq!(limiter.num_requeues(&"b"), 1);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
    }
}
