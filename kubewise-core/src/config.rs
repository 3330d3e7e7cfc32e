use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Secret type Helm 3 stamps on every release record.
pub const DEFAULT_MARKER_TYPE: &str = "helm.sh/release.v1";

/// Global knobs that tune controller behaviour.
///
/// All fields carry defaults so a configuration file only needs to mention
/// the values it wants to change.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Retry/backoff policy applied by the worker loop.
    pub retry: RetryConfig,
    /// Notification fan-out settings.
    pub dispatch: DispatchConfig,
    /// List/watch and cache settings.
    pub watch: WatchConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries granted to an item after its first failed attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 5,
            backoff_max_ms: 1_000 * 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound for a single handler call, 10 s unless configured.
    /// `0` turns the bound off, and a handler that never returns then
    /// stalls the worker.
    pub timeout_ms: u64,
}

impl DispatchConfig {
    /// `None` when handler calls are unbounded.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Only secrets of this type are treated as release records.
    pub marker_type: String,
    /// How long `run` waits for the first listing before giving up.
    pub cache_sync_timeout_ms: u64,
    /// First delay applied when a listing or watch request fails.
    pub relist_backoff_base_ms: u64,
    pub relist_backoff_max_ms: u64,
}

impl WatchConfig {
    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_sync_timeout_ms)
    }

    pub fn relist_backoff_base(&self) -> Duration {
        Duration::from_millis(self.relist_backoff_base_ms)
    }

    pub fn relist_backoff_max(&self) -> Duration {
        Duration::from_millis(self.relist_backoff_max_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            marker_type: DEFAULT_MARKER_TYPE.to_string(),
            cache_sync_timeout_ms: 60_000,
            relist_backoff_base_ms: 800,
            relist_backoff_max_ms: 30_000,
        }
    }
}
