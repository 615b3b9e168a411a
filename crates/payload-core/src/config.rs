//! # Cache Configuration
//!
//! Immutable defaults handed to [`PayloadClient::new`](crate::PayloadClient::new)
//! and merged into entry and observer options at creation time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{
    PayloadError, PayloadResult, RetryDelay, RetryPolicy, DEFAULT_RETRY_COUNT,
    DEFAULT_RETRY_DELAY_BASE, DEFAULT_RETRY_DELAY_MAX,
};
use crate::options::NetworkMode;

/// Default retention of unobserved entries (5 minutes).
pub const DEFAULT_CACHE_TIME_MS: u64 = 300_000;

/// Default period of the background sweep (1 minute).
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Default lifetime of an approval request (5 minutes).
pub const DEFAULT_APPROVAL_EXPIRY_SECS: u64 = 300;

/// Cache configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age in ms after which data is stale. `None` = never stale.
    pub stale_time_ms: Option<u64>,

    /// Retention in ms after the last observer leaves. `None` = never evicted.
    pub cache_time_ms: Option<u64>,

    /// Number of retries after a failed fetch.
    pub retry: u32,

    /// First retry delay in ms; doubles per failure.
    pub retry_delay_base_ms: u64,

    /// Retry delay cap in ms.
    pub retry_delay_max_ms: u64,

    /// Refetch stale data when the consumer regains focus.
    pub refetch_on_window_focus: bool,

    /// Refetch stale data when connectivity returns.
    pub refetch_on_reconnect: bool,

    /// Refetch stale data when an observer subscribes.
    pub refetch_on_mount: bool,

    /// Connectivity gating for fetches.
    pub network_mode: NetworkMode,

    /// Period of the background sweep while the client is mounted.
    pub sweep_interval_ms: u64,

    /// Default lifetime of approval requests. Zero disables the local countdown.
    pub approval_expiry_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: Some(0),
            cache_time_ms: Some(DEFAULT_CACHE_TIME_MS),
            retry: DEFAULT_RETRY_COUNT,
            retry_delay_base_ms: DEFAULT_RETRY_DELAY_BASE.as_millis() as u64,
            retry_delay_max_ms: DEFAULT_RETRY_DELAY_MAX.as_millis() as u64,
            refetch_on_window_focus: true,
            refetch_on_reconnect: true,
            refetch_on_mount: true,
            network_mode: NetworkMode::Online,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            approval_expiry_secs: DEFAULT_APPROVAL_EXPIRY_SECS,
        }
    }
}

impl CacheConfig {
    /// Create a config for testing (no retries, short windows).
    pub fn for_testing() -> Self {
        Self {
            stale_time_ms: Some(0),
            cache_time_ms: Some(1_000),
            retry: 0,
            retry_delay_base_ms: 10,
            retry_delay_max_ms: 100,
            refetch_on_window_focus: false,
            refetch_on_reconnect: false,
            refetch_on_mount: true,
            network_mode: NetworkMode::Always,
            sweep_interval_ms: 1_000,
            approval_expiry_secs: 60,
        }
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> PayloadResult<()> {
        if self.sweep_interval_ms == 0 {
            return Err(PayloadError::configuration("sweep_interval_ms must be positive"));
        }
        if self.retry_delay_max_ms < self.retry_delay_base_ms {
            return Err(PayloadError::configuration(format!(
                "retry_delay_max_ms ({}) is below retry_delay_base_ms ({})",
                self.retry_delay_max_ms, self.retry_delay_base_ms
            )));
        }
        Ok(())
    }

    /// Stale time as a duration.
    pub fn stale_time(&self) -> Option<Duration> {
        self.stale_time_ms.map(Duration::from_millis)
    }

    /// Retention as a duration.
    pub fn cache_time(&self) -> Option<Duration> {
        self.cache_time_ms.map(Duration::from_millis)
    }

    /// Retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::Count(self.retry)
    }

    /// Capped exponential retry delay.
    pub fn retry_delay(&self) -> RetryDelay {
        RetryDelay::Exponential {
            base: Duration::from_millis(self.retry_delay_base_ms),
            max: Duration::from_millis(self.retry_delay_max_ms),
        }
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Approval lifetime.
    pub fn approval_expiry(&self) -> Option<Duration> {
        (self.approval_expiry_secs > 0).then(|| Duration::from_secs(self.approval_expiry_secs))
    }
}
