//! # Options
//!
//! Per-entry and per-observer options. Defaults come from
//! [`CacheConfig`](crate::config::CacheConfig) through
//! [`PayloadClient::payload_options`](crate::PayloadClient::payload_options) and
//! [`PayloadClient::observer_options`](crate::PayloadClient::observer_options);
//! there is no process-wide mutable default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::domain::{PayloadError, PayloadKey, PayloadResult, PayloadState, RetryDelay, RetryPolicy};
use crate::ports::FetchFn;

/// Whether a fetch may run without connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Attempts wait until online.
    #[default]
    Online,
    /// Connectivity is ignored.
    Always,
    /// The first attempt runs regardless; retries wait until online.
    OfflineFirst,
}

impl NetworkMode {
    /// Whether attempt number `attempt` (0-based) must wait for connectivity.
    pub fn must_wait(self, attempt: u32, online: bool) -> bool {
        if online {
            return false;
        }
        match self {
            NetworkMode::Online => true,
            NetworkMode::Always => false,
            NetworkMode::OfflineFirst => attempt > 0,
        }
    }
}

type EqFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Options resolved once per entry.
pub struct PayloadOptions<T> {
    /// Produces the payload. Entries without one can only be set manually.
    pub fetch_fn: Option<FetchFn<T>>,
    /// Retention after the last observer leaves. `None` keeps the entry forever.
    pub cache_time: Option<Duration>,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Delay between retries.
    pub retry_delay: RetryDelay,
    /// Connectivity gating.
    pub network_mode: NetworkMode,
    /// When it returns true for `(old, new)`, the old `Arc` is kept.
    pub is_data_equal: Option<EqFn<T>>,
    /// Seeds a new entry in `Success`.
    pub initial_data: Option<Arc<T>>,
    /// Age of `initial_data`. Defaults to creation time.
    pub initial_data_updated_at: Option<Instant>,
    /// Local lifetime of an attached approval when the caller gives none.
    pub approval_expiry: Option<Duration>,
}

impl<T> PayloadOptions<T> {
    /// Options derived from a cache configuration, without a fetch function.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            fetch_fn: None,
            cache_time: config.cache_time(),
            retry: config.retry_policy(),
            retry_delay: config.retry_delay(),
            network_mode: config.network_mode,
            is_data_equal: None,
            initial_data: None,
            initial_data_updated_at: None,
            approval_expiry: config.approval_expiry(),
        }
    }

    /// Set the fetch function.
    pub fn fetch(mut self, fetch_fn: FetchFn<T>) -> Self {
        self.fetch_fn = Some(fetch_fn);
        self
    }

    /// Set the retention window.
    pub fn cache_time(mut self, cache_time: Option<Duration>) -> Self {
        self.cache_time = cache_time;
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    /// Set the retry delay.
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Set the network mode.
    pub fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = network_mode;
        self
    }

    /// Set the data equality check.
    pub fn is_data_equal<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.is_data_equal = Some(Arc::new(f));
        self
    }

    /// Set the local approval lifetime. `None` waits for the channel.
    pub fn approval_expiry(mut self, approval_expiry: Option<Duration>) -> Self {
        self.approval_expiry = approval_expiry;
        self
    }

    /// Seed new entries with `data`.
    pub fn initial_data(mut self, data: T, updated_at: Option<Instant>) -> Self {
        self.initial_data = Some(Arc::new(data));
        self.initial_data_updated_at = updated_at;
        self
    }
}

impl<T> Default for PayloadOptions<T> {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl<T> Clone for PayloadOptions<T> {
    fn clone(&self) -> Self {
        Self {
            fetch_fn: self.fetch_fn.clone(),
            cache_time: self.cache_time,
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            network_mode: self.network_mode,
            is_data_equal: self.is_data_equal.clone(),
            initial_data: self.initial_data.clone(),
            initial_data_updated_at: self.initial_data_updated_at,
            approval_expiry: self.approval_expiry,
        }
    }
}

impl<T> fmt::Debug for PayloadOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadOptions")
            .field("has_fetch_fn", &self.fetch_fn.is_some())
            .field("cache_time", &self.cache_time)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("network_mode", &self.network_mode)
            .field("has_initial_data", &self.initial_data.is_some())
            .finish()
    }
}

// =============================================================================
// OBSERVER OPTIONS
// =============================================================================

/// Resolved refetch decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchMode {
    /// Do not refetch.
    Never,
    /// Refetch only if the data is stale.
    IfStale,
    /// Refetch even if fresh.
    Always,
}

/// Policy for `refetch_on_mount`, `refetch_on_window_focus` and `refetch_on_reconnect`.
pub enum RefetchOn<T> {
    /// Fixed mode.
    Mode(RefetchMode),
    /// Decided from the entry state at the time of the event.
    Custom(Arc<dyn Fn(&PayloadState<T>) -> RefetchMode + Send + Sync>),
}

impl<T> RefetchOn<T> {
    /// Build a custom policy.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&PayloadState<T>) -> RefetchMode + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Mode in effect for `state`.
    pub fn mode(&self, state: &PayloadState<T>) -> RefetchMode {
        match self {
            RefetchOn::Mode(mode) => *mode,
            RefetchOn::Custom(f) => f(state),
        }
    }

    /// Whether to refetch given the current state and staleness.
    pub fn should_refetch(&self, state: &PayloadState<T>, is_stale: bool) -> bool {
        match self.mode(state) {
            RefetchMode::Never => false,
            RefetchMode::IfStale => is_stale,
            RefetchMode::Always => true,
        }
    }
}

impl<T> From<bool> for RefetchOn<T> {
    fn from(enabled: bool) -> Self {
        RefetchOn::Mode(if enabled {
            RefetchMode::IfStale
        } else {
            RefetchMode::Never
        })
    }
}

impl<T> From<RefetchMode> for RefetchOn<T> {
    fn from(mode: RefetchMode) -> Self {
        RefetchOn::Mode(mode)
    }
}

impl<T> Clone for RefetchOn<T> {
    fn clone(&self) -> Self {
        match self {
            RefetchOn::Mode(mode) => RefetchOn::Mode(*mode),
            RefetchOn::Custom(f) => RefetchOn::Custom(Arc::clone(f)),
        }
    }
}

impl<T> fmt::Debug for RefetchOn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefetchOn::Mode(mode) => write!(f, "{mode:?}"),
            RefetchOn::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Polling interval.
pub enum RefetchInterval<T> {
    /// No polling.
    Disabled,
    /// Poll at a fixed period.
    Every(Duration),
    /// Period re-evaluated from the entry state at every tick and whenever the
    /// entry settles; `None` pauses polling until a later state yields a period.
    Dynamic(Arc<dyn Fn(&PayloadState<T>) -> Option<Duration> + Send + Sync>),
}

impl<T> RefetchInterval<T> {
    /// Build a dynamic interval.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&PayloadState<T>) -> Option<Duration> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    /// Period to use for the next tick.
    pub fn resolve(&self, state: &PayloadState<T>) -> Option<Duration> {
        match self {
            RefetchInterval::Disabled => None,
            RefetchInterval::Every(period) => Some(*period),
            RefetchInterval::Dynamic(f) => f(state).filter(|period| !period.is_zero()),
        }
    }
}

impl<T> Clone for RefetchInterval<T> {
    fn clone(&self) -> Self {
        match self {
            RefetchInterval::Disabled => RefetchInterval::Disabled,
            RefetchInterval::Every(period) => RefetchInterval::Every(*period),
            RefetchInterval::Dynamic(f) => RefetchInterval::Dynamic(Arc::clone(f)),
        }
    }
}

impl<T> fmt::Debug for RefetchInterval<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefetchInterval::Disabled => write!(f, "Disabled"),
            RefetchInterval::Every(period) => write!(f, "Every({period:?})"),
            RefetchInterval::Dynamic(_) => write!(f, "Dynamic(..)"),
        }
    }
}

/// Observer result properties, for change tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultProp {
    /// `data`
    Data,
    /// `error`
    Error,
    /// `status`
    Status,
    /// `is_fetching`
    IsFetching,
    /// `is_stale`
    IsStale,
    /// `is_paused`
    IsPaused,
    /// `is_previous_data`
    IsPreviousData,
    /// `failure_count`
    FailureCount,
    /// `failure_reason`
    FailureReason,
    /// `data_updated_at`
    DataUpdatedAt,
    /// `error_updated_at`
    ErrorUpdatedAt,
    /// `approval`
    Approval,
}

/// Which result changes notify the listener.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NotifyOnChangeProps {
    /// Properties read through the last delivered result. Notifies on every
    /// change until something has been read.
    #[default]
    Tracked,
    /// Every change.
    All,
    /// Only these properties.
    Props(Vec<ResultProp>),
}

/// Whether errors are raised from `result()` instead of returned in-band.
#[derive(Clone, Default)]
pub enum ErrorBoundary {
    /// Always in-band.
    #[default]
    Never,
    /// Always raised.
    Always,
    /// Raised when the predicate returns true.
    When(Arc<dyn Fn(&PayloadError) -> bool + Send + Sync>),
}

impl ErrorBoundary {
    /// Build a predicate boundary.
    pub fn when<F>(f: F) -> Self
    where
        F: Fn(&PayloadError) -> bool + Send + Sync + 'static,
    {
        Self::When(Arc::new(f))
    }

    /// Whether `error` must be raised.
    pub fn should_raise(&self, error: &PayloadError) -> bool {
        match self {
            ErrorBoundary::Never => false,
            ErrorBoundary::Always => true,
            ErrorBoundary::When(f) => f(error),
        }
    }
}

impl From<bool> for ErrorBoundary {
    fn from(raise: bool) -> Self {
        if raise {
            ErrorBoundary::Always
        } else {
            ErrorBoundary::Never
        }
    }
}

impl fmt::Debug for ErrorBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorBoundary::Never => write!(f, "Never"),
            ErrorBoundary::Always => write!(f, "Always"),
            ErrorBoundary::When(_) => write!(f, "When(..)"),
        }
    }
}

/// Projection from entry data to observer data.
pub type SelectFn<T, S> = Arc<dyn Fn(&Arc<T>) -> Arc<S> + Send + Sync>;
/// Success callback.
pub type OnSuccess<S> = Arc<dyn Fn(&S) + Send + Sync>;
/// Error callback.
pub type OnError = Arc<dyn Fn(&PayloadError) + Send + Sync>;
/// Settled callback.
pub type OnSettled<S> = Arc<dyn Fn(Option<&S>, Option<&PayloadError>) + Send + Sync>;

/// Options for one observer.
pub struct ObserverOptions<T, S = T> {
    /// Key to observe.
    pub key: PayloadKey,
    /// Options applied to the entry on creation.
    pub payload: PayloadOptions<T>,
    /// Disabled observers never fetch on their own.
    pub enabled: bool,
    /// Age after which data is stale. `None` means never.
    pub stale_time: Option<Duration>,
    /// Polling.
    pub refetch_interval: RefetchInterval<T>,
    /// Keep polling while unfocused.
    pub refetch_interval_in_background: bool,
    /// Refetch when the consumer regains focus.
    pub refetch_on_window_focus: RefetchOn<T>,
    /// Refetch when connectivity returns.
    pub refetch_on_reconnect: RefetchOn<T>,
    /// Refetch when this observer subscribes.
    pub refetch_on_mount: RefetchOn<T>,
    /// Refetch an errored entry on subscribe.
    pub retry_on_mount: bool,
    /// Projection applied to `data`.
    pub select: SelectFn<T, S>,
    /// Show the previous key's data while the new key loads.
    pub keep_previous_data: bool,
    /// Notification filter.
    pub notify_on_change_props: NotifyOnChangeProps,
    /// Called after each successful fetch.
    pub on_success: Option<OnSuccess<S>>,
    /// Called once when a fetch settles in error.
    pub on_error: Option<OnError>,
    /// Called after `on_success` or `on_error`.
    pub on_settled: Option<OnSettled<S>>,
    /// Error delivery.
    pub use_error_boundary: ErrorBoundary,
}

impl<T> ObserverOptions<T, T>
where
    T: Send + Sync + 'static,
{
    /// Options with the identity projection and default configuration.
    pub fn new(key: PayloadKey, fetch_fn: FetchFn<T>) -> Self {
        Self::from_config(key, Some(fetch_fn), &CacheConfig::default())
    }

    /// Options seeded from `config`.
    pub fn from_config(key: PayloadKey, fetch_fn: Option<FetchFn<T>>, config: &CacheConfig) -> Self {
        let mut payload = PayloadOptions::from_config(config);
        payload.fetch_fn = fetch_fn;
        Self {
            key,
            payload,
            enabled: true,
            stale_time: config.stale_time(),
            refetch_interval: RefetchInterval::Disabled,
            refetch_interval_in_background: false,
            refetch_on_window_focus: config.refetch_on_window_focus.into(),
            refetch_on_reconnect: config.refetch_on_reconnect.into(),
            refetch_on_mount: config.refetch_on_mount.into(),
            retry_on_mount: true,
            select: Arc::new(|data: &Arc<T>| Arc::clone(data)),
            keep_previous_data: false,
            notify_on_change_props: NotifyOnChangeProps::default(),
            on_success: None,
            on_error: None,
            on_settled: None,
            use_error_boundary: ErrorBoundary::Never,
        }
    }
}

impl<T, S> ObserverOptions<T, S>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    /// Replace the projection. Callbacks typed on the old projection are dropped.
    pub fn select<S2, F>(self, f: F) -> ObserverOptions<T, S2>
    where
        S2: Send + Sync + 'static,
        F: Fn(&T) -> S2 + Send + Sync + 'static,
    {
        ObserverOptions {
            key: self.key,
            payload: self.payload,
            enabled: self.enabled,
            stale_time: self.stale_time,
            refetch_interval: self.refetch_interval,
            refetch_interval_in_background: self.refetch_interval_in_background,
            refetch_on_window_focus: self.refetch_on_window_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            refetch_on_mount: self.refetch_on_mount,
            retry_on_mount: self.retry_on_mount,
            select: Arc::new(move |data: &Arc<T>| Arc::new(f(&**data))),
            keep_previous_data: self.keep_previous_data,
            notify_on_change_props: self.notify_on_change_props,
            on_success: None,
            on_error: self.on_error,
            on_settled: None,
            use_error_boundary: self.use_error_boundary,
        }
    }

    /// Set `enabled`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the stale time. `None` means never stale.
    pub fn stale_time(mut self, stale_time: Option<Duration>) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Set the polling interval.
    pub fn refetch_interval(mut self, interval: RefetchInterval<T>) -> Self {
        self.refetch_interval = interval;
        self
    }

    /// Keep polling while unfocused.
    pub fn refetch_interval_in_background(mut self, enabled: bool) -> Self {
        self.refetch_interval_in_background = enabled;
        self
    }

    /// Set the focus policy.
    pub fn refetch_on_window_focus(mut self, policy: impl Into<RefetchOn<T>>) -> Self {
        self.refetch_on_window_focus = policy.into();
        self
    }

    /// Set the reconnect policy.
    pub fn refetch_on_reconnect(mut self, policy: impl Into<RefetchOn<T>>) -> Self {
        self.refetch_on_reconnect = policy.into();
        self
    }

    /// Set the mount policy.
    pub fn refetch_on_mount(mut self, policy: impl Into<RefetchOn<T>>) -> Self {
        self.refetch_on_mount = policy.into();
        self
    }

    /// Set `retry_on_mount`.
    pub fn retry_on_mount(mut self, retry: bool) -> Self {
        self.retry_on_mount = retry;
        self
    }

    /// Set `keep_previous_data`.
    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    /// Set the notification filter.
    pub fn notify_on_change_props(mut self, props: NotifyOnChangeProps) -> Self {
        self.notify_on_change_props = props;
        self
    }

    /// Set the retry policy of the entry.
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.payload.retry = retry.into();
        self
    }

    /// Set the retry delay of the entry.
    pub fn retry_delay(mut self, delay: RetryDelay) -> Self {
        self.payload.retry_delay = delay;
        self
    }

    /// Set the retention window of the entry.
    pub fn cache_time(mut self, cache_time: Option<Duration>) -> Self {
        self.payload.cache_time = cache_time;
        self
    }

    /// Set the success callback.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Set the error callback.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&PayloadError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Set the settled callback.
    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&S>, Option<&PayloadError>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Set error delivery.
    pub fn use_error_boundary(mut self, boundary: impl Into<ErrorBoundary>) -> Self {
        self.use_error_boundary = boundary.into();
        self
    }

    /// Reject invalid option combinations.
    pub fn validate(&self) -> PayloadResult<()> {
        if self.key.is_empty() {
            return Err(PayloadError::configuration("payload key must not be empty"));
        }
        if let RefetchInterval::Every(period) = &self.refetch_interval {
            if period.is_zero() {
                return Err(PayloadError::configuration(
                    "refetch_interval must be positive; use RefetchInterval::Disabled to turn polling off",
                ));
            }
        }
        Ok(())
    }
}

impl<T, S> Clone for ObserverOptions<T, S> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            payload: self.payload.clone(),
            enabled: self.enabled,
            stale_time: self.stale_time,
            refetch_interval: self.refetch_interval.clone(),
            refetch_interval_in_background: self.refetch_interval_in_background,
            refetch_on_window_focus: self.refetch_on_window_focus.clone(),
            refetch_on_reconnect: self.refetch_on_reconnect.clone(),
            refetch_on_mount: self.refetch_on_mount.clone(),
            retry_on_mount: self.retry_on_mount,
            select: Arc::clone(&self.select),
            keep_previous_data: self.keep_previous_data,
            notify_on_change_props: self.notify_on_change_props.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
            use_error_boundary: self.use_error_boundary.clone(),
        }
    }
}

impl<T, S> fmt::Debug for ObserverOptions<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverOptions")
            .field("key", &self.key)
            .field("payload", &self.payload)
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("refetch_interval", &self.refetch_interval)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("keep_previous_data", &self.keep_previous_data)
            .field("notify_on_change_props", &self.notify_on_change_props)
            .field("use_error_boundary", &self.use_error_boundary)
            .finish()
    }
}

/// Approval-flow parameters for [`PayloadEntry::attach_approval`](crate::PayloadEntry::attach_approval).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalConfig {
    /// Payload identifier, if known before the first message.
    pub payload_uuid: Option<String>,
    /// Lifetime before the request expires locally.
    pub expires_in: Option<Duration>,
}
