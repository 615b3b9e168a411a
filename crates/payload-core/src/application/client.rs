//! # Payload Client
//!
//! Facade owning the cache, scheduler, environment and configuration.
//! Mounting starts the periodic sweep; the last unmount stops it.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

use super::cache::{CacheHooks, PayloadCache};
use super::entry::{CachedEntry, PayloadEntry};
use crate::adapters::{Environment, TokioScheduler};
use crate::config::CacheConfig;
use crate::domain::{FetchStatus, PayloadKey, PayloadResult, PayloadState};
use crate::options::{ObserverOptions, PayloadOptions};
use crate::ports::{FetchFn, Scheduler, TimerHandle};

#[derive(Default)]
struct SweepLoop {
    mounts: usize,
    timer: Option<TimerHandle>,
}

/// Entry point for applications.
#[derive(Clone)]
pub struct PayloadClient {
    cache: Arc<PayloadCache>,
    scheduler: Arc<dyn Scheduler>,
    environment: Arc<Environment>,
    config: CacheConfig,
    sweep: Arc<Mutex<SweepLoop>>,
}

impl PayloadClient {
    /// Create a client on the Tokio clock with logging hooks.
    pub fn new(config: CacheConfig) -> PayloadResult<Self> {
        Self::with_parts(config, Arc::new(TokioScheduler::new()), default_hooks())
    }

    /// Create a client on a custom scheduler.
    pub fn with_scheduler(config: CacheConfig, scheduler: Arc<dyn Scheduler>) -> PayloadResult<Self> {
        Self::with_parts(config, scheduler, default_hooks())
    }

    /// Create a client from explicit parts.
    pub fn with_parts(
        config: CacheConfig,
        scheduler: Arc<dyn Scheduler>,
        hooks: CacheHooks,
    ) -> PayloadResult<Self> {
        config.validate()?;
        let environment = Arc::new(Environment::new());
        let cache = PayloadCache::new(Arc::clone(&scheduler), Arc::clone(&environment), hooks);
        Ok(Self {
            cache,
            scheduler,
            environment,
            config,
            sweep: Arc::new(Mutex::new(SweepLoop::default())),
        })
    }

    /// The cache.
    pub fn cache(&self) -> &Arc<PayloadCache> {
        &self.cache
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Focus and connectivity flags.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    /// The configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Entry options seeded from the configuration.
    pub fn payload_options<T>(&self) -> PayloadOptions<T> {
        PayloadOptions::from_config(&self.config)
    }

    /// Observer options seeded from the configuration.
    pub fn observer_options<T>(&self, key: PayloadKey, fetch_fn: Option<FetchFn<T>>) -> ObserverOptions<T>
    where
        T: Send + Sync + 'static,
    {
        ObserverOptions::from_config(key, fetch_fn, &self.config)
    }

    // =========================================================================
    // MOUNT
    // =========================================================================

    /// Register a mount. The first one starts the sweep loop.
    pub fn mount(&self) -> usize {
        let mut sweep = self.sweep.lock();
        sweep.mounts += 1;
        if sweep.mounts == 1 {
            sweep.timer = Some(arm_sweep(
                Arc::downgrade(&self.cache),
                Arc::clone(&self.scheduler),
                Arc::downgrade(&self.sweep),
                self.config.sweep_interval(),
            ));
            debug!(interval_ms = self.config.sweep_interval_ms, "Sweep loop started");
        }
        sweep.mounts
    }

    /// Release a mount. The last one stops the sweep loop.
    pub fn unmount(&self) -> usize {
        let mut sweep = self.sweep.lock();
        sweep.mounts = sweep.mounts.saturating_sub(1);
        if sweep.mounts == 0 && sweep.timer.take().is_some() {
            debug!("Sweep loop stopped");
        }
        sweep.mounts
    }

    // =========================================================================
    // PAYLOAD ACCESS
    // =========================================================================

    /// Return fresh cached data, or fetch (joining any in-flight fetch).
    ///
    /// `stale_time` decides freshness for this call; `None` accepts any age.
    pub async fn fetch_payload<T>(
        &self,
        key: &PayloadKey,
        options: PayloadOptions<T>,
        stale_time: Option<Duration>,
    ) -> PayloadResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.cache.get_or_create(key, options)?;
        let state = entry.state();
        if let Some(data) = &state.data {
            if !state.is_stale_at(self.scheduler.now(), stale_time) {
                return Ok(Arc::clone(data));
            }
        }
        entry.fetch(false).await
    }

    /// Like [`fetch_payload`](Self::fetch_payload) but never fails.
    pub async fn prefetch_payload<T>(
        &self,
        key: &PayloadKey,
        options: PayloadOptions<T>,
        stale_time: Option<Duration>,
    ) where
        T: Send + Sync + 'static,
    {
        if let Err(err) = self.fetch_payload(key, options, stale_time).await {
            debug!(payload = %key.hash(), error = %err, "Prefetch failed");
        }
    }

    /// Cached data, if any.
    pub fn get_payload_data<T>(&self, key: &PayloadKey) -> PayloadResult<Option<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        Ok(self.cache.get::<T>(key)?.and_then(|entry| entry.state().data))
    }

    /// Replace the data of `key`, creating the entry if needed.
    pub fn set_payload_data<T>(&self, key: &PayloadKey, data: T) -> PayloadResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.cache.get_or_create(key, self.payload_options::<T>())?;
        Ok(entry.set_data(data))
    }

    /// Snapshot of the state of `key`.
    pub fn get_payload_state<T>(&self, key: &PayloadKey) -> PayloadResult<Option<PayloadState<T>>>
    where
        T: Send + Sync + 'static,
    {
        Ok(self.cache.get::<T>(key)?.map(|entry| entry.state()))
    }

    /// Typed entry handle for `key`, created with the configured defaults.
    pub fn entry<T>(&self, key: &PayloadKey) -> PayloadResult<Arc<PayloadEntry<T>>>
    where
        T: Send + Sync + 'static,
    {
        self.cache.get_or_create(key, self.payload_options::<T>())
    }

    /// Mark every entry under `prefix` invalid. Subscribed observers refetch.
    pub fn invalidate_payloads(&self, prefix: &PayloadKey) -> usize {
        let entries = self.cache.find_by_prefix(prefix);
        for entry in &entries {
            entry.invalidate();
        }
        debug!(prefix = %prefix, count = entries.len(), "Payloads invalidated");
        entries.len()
    }

    /// Cancel in-flight fetches under `prefix`. Returns how many were cancelled.
    pub fn cancel_payloads(&self, prefix: &PayloadKey) -> usize {
        self.cache
            .find_by_prefix(prefix)
            .iter()
            .filter(|entry| entry.cancel())
            .count()
    }

    /// Remove every entry under `prefix`, subscribed or not.
    pub fn remove_payloads(&self, prefix: &PayloadKey) -> usize {
        self.cache
            .find_by_prefix(prefix)
            .iter()
            .filter(|entry| self.cache.remove(entry.hash(), true))
            .count()
    }

    /// Number of entries currently fetching.
    pub fn is_fetching(&self) -> usize {
        self.cache
            .find(|entry| entry.status() == FetchStatus::Fetching)
            .len()
    }

    // =========================================================================
    // ENVIRONMENT
    // =========================================================================

    /// Update focus. Gaining focus lets observers refetch.
    pub fn set_focused(&self, focused: bool) {
        if self.environment.set_focused(focused) && focused {
            debug!("Focus regained");
            self.cache.notify_focus();
        }
    }

    /// Update connectivity. Going online resumes paused fetches and lets
    /// observers refetch.
    pub fn set_online(&self, online: bool) {
        if self.environment.set_online(online) && online {
            debug!("Connectivity restored");
            self.cache.notify_online();
        }
    }
}

impl std::fmt::Debug for PayloadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadClient")
            .field("entries", &self.cache.len())
            .field("config", &self.config)
            .finish()
    }
}

fn default_hooks() -> CacheHooks {
    CacheHooks {
        on_success: Some(Arc::new(|hash: &str| {
            debug!(payload = %hash, "Payload fetched");
        })),
        on_error: Some(Arc::new(|hash: &str, error: &crate::domain::PayloadError| {
            info!(payload = %hash, error = %error, "Payload fetch settled in error");
        })),
    }
}

fn arm_sweep(
    cache: Weak<PayloadCache>,
    scheduler: Arc<dyn Scheduler>,
    sweep: Weak<Mutex<SweepLoop>>,
    period: Duration,
) -> TimerHandle {
    let next_scheduler = Arc::clone(&scheduler);
    scheduler.schedule(
        period,
        Box::new(move || {
            let (Some(cache_ref), Some(sweep_ref)) = (cache.upgrade(), sweep.upgrade()) else {
                return;
            };
            let evicted = cache_ref.sweep();
            if evicted > 0 {
                debug!(evicted, "Sweep evicted idle entries");
            }

            let mut state = sweep_ref.lock();
            if state.mounts == 0 {
                return;
            }
            let next = arm_sweep(cache, next_scheduler, sweep, period);
            if let Some(current) = state.timer.replace(next) {
                current.detach();
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ManualScheduler;
    use crate::domain::PayloadError;
    use crate::ports::fetch_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> (PayloadClient, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let client =
            PayloadClient::with_scheduler(CacheConfig::for_testing(), scheduler.clone()).unwrap();
        (client, scheduler)
    }

    fn counting_fetch(calls: &Arc<AtomicUsize>) -> FetchFn<u32> {
        let calls = Arc::clone(calls);
        fetch_fn(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) as u32 + 1;
            async move { Ok(n) }
        })
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CacheConfig {
            sweep_interval_ms: 0,
            ..CacheConfig::for_testing()
        };
        assert!(matches!(
            PayloadClient::new(config),
            Err(PayloadError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_payload_returns_fresh_data_without_fetching() {
        let (client, _) = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = PayloadKey::from("balance");
        let options = client.payload_options().fetch(counting_fetch(&calls));

        let first = client
            .fetch_payload(&key, options.clone(), None)
            .await
            .unwrap();
        let second = client.fetch_payload(&key, options, None).await.unwrap();
        assert_eq!(*first, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_payload_refetches_stale_data() {
        let (client, _) = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = PayloadKey::from("balance");
        let options = client.payload_options().fetch(counting_fetch(&calls));

        client
            .fetch_payload(&key, options.clone(), Some(Duration::ZERO))
            .await
            .unwrap();
        let again = client
            .fetch_payload(&key, options, Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(*again, 2);
    }

    #[tokio::test]
    async fn test_set_and_get_payload_data() {
        let (client, _) = client();
        let key = PayloadKey::from("profile");
        assert!(client.get_payload_data::<String>(&key).unwrap().is_none());

        client.set_payload_data(&key, "alice".to_string()).unwrap();
        let data = client.get_payload_data::<String>(&key).unwrap().unwrap();
        assert_eq!(data.as_str(), "alice");

        let state = client.get_payload_state::<String>(&key).unwrap().unwrap();
        assert_eq!(state.status, FetchStatus::Success);
        assert_eq!(state.data_update_count, 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_remove_by_prefix() {
        let (client, _) = client();
        client
            .set_payload_data(&crate::payload_key!["tx", 1], 1u32)
            .unwrap();
        client
            .set_payload_data(&crate::payload_key!["tx", 2], 2u32)
            .unwrap();
        client
            .set_payload_data(&crate::payload_key!["user"], 3u32)
            .unwrap();

        assert_eq!(client.invalidate_payloads(&PayloadKey::from("tx")), 2);
        let state = client
            .get_payload_state::<u32>(&crate::payload_key!["tx", 1])
            .unwrap()
            .unwrap();
        assert!(state.is_invalidated);

        assert_eq!(client.remove_payloads(&PayloadKey::from("tx")), 2);
        assert_eq!(client.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_runs_only_while_mounted() {
        let (client, scheduler) = client();
        client
            .set_payload_data(&PayloadKey::from("idle"), 1u32)
            .unwrap();
        // Retention timer of the idle entry.
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(client.mount(), 1);
        assert_eq!(client.mount(), 2);
        assert_eq!(scheduler.pending(), 2);

        client.unmount();
        assert_eq!(scheduler.pending(), 2);
        client.unmount();
        assert_eq!(scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn test_sweep_loop_rearms() {
        let (client, scheduler) = client();
        client.mount();
        scheduler.advance(Duration::from_millis(3_500));
        assert_eq!(scheduler.pending(), 1);
        client.unmount();
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_focus_change_reported_once() {
        let (client, _) = client();
        client.set_focused(false);
        assert!(!client.environment().is_focused());
        client.set_focused(true);
        assert!(client.environment().is_focused());
    }
}
