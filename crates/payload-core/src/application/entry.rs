//! # Payload Entry
//!
//! Owns the state of one key: fetch execution with deduplication and
//! retries, manual updates, invalidation, and the approval sub-state machine.
//!
//! ## Concurrency
//!
//! Every transition is a single critical section on the entry mutex. The
//! lock is always released before observers are notified, and observers are
//! notified in subscription order. A fetch carries a generation number; a
//! completion whose generation is no longer the in-flight one is discarded.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use payload_telemetry::{
    log_approval_event, log_payload_event, HistogramTimer, APPROVAL_TRANSITIONS, FETCHES_STARTED,
    FETCH_DURATION, FETCH_FAILURES, FETCH_RETRIES,
};

use super::cache::PayloadCache;
use crate::adapters::Environment;
use crate::domain::{
    decide, ApprovalFlow, ApprovalTransition, ChannelMessage, FetchStatus, PayloadError,
    PayloadKey, PayloadResult, PayloadState, RetryDecision,
};
use crate::options::{ApprovalConfig, PayloadOptions};
use crate::ports::{sleep, EventChannel, FetchContext, FetchFn, Scheduler, TimerHandle};

/// Shared handle on an in-flight fetch. Every clone resolves to the same result.
pub type FetchFuture<T> = Shared<BoxFuture<'static, PayloadResult<Arc<T>>>>;

/// What caused a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    /// A fetch started.
    Fetch,
    /// The fetch is waiting for connectivity.
    Pause,
    /// The fetch resumed after connectivity returned.
    Continue,
    /// An attempt failed and a retry is scheduled.
    Failed,
    /// A fetch succeeded.
    Success,
    /// A fetch settled in error.
    Error,
    /// The in-flight fetch was cancelled.
    Cancel,
    /// The entry was marked stale.
    Invalidate,
    /// State was replaced or data set manually.
    SetState,
    /// An approval channel was attached.
    ApprovalAttached,
    /// The approval sub-state changed.
    Approval(ApprovalTransition),
}

/// Notification delivered to observers.
#[derive(Debug)]
pub struct EntryEvent<T> {
    /// Cause.
    pub action: EntryAction,
    /// State right after the transition.
    pub state: PayloadState<T>,
}

/// Receiver of entry notifications.
///
/// Called without any entry lock held. Implementations must not mutate the
/// entry inline; follow-up actions are queued as new tasks.
pub trait EntryObserver<T>: Send + Sync {
    /// State changed.
    fn on_entry_update(&self, event: &EntryEvent<T>);

    /// The consumer regained focus.
    fn on_focus(&self) {}

    /// Connectivity returned.
    fn on_online(&self) {}
}

struct InFlight<T> {
    generation: u64,
    future: FetchFuture<T>,
    token: CancellationToken,
    revert_status: FetchStatus,
}

struct ApprovalAttachment {
    flow: ApprovalFlow,
    channel: Option<Box<dyn EventChannel>>,
    channel_failed: bool,
    expiry: Option<TimerHandle>,
}

struct EntryInner<T> {
    options: PayloadOptions<T>,
    state: PayloadState<T>,
    observers: Vec<(u64, Arc<dyn EntryObserver<T>>)>,
    in_flight: Option<InFlight<T>>,
    generation: u64,
    unobserved_since: Option<Instant>,
    gc: Option<TimerHandle>,
    approval: Option<ApprovalAttachment>,
}

impl<T> EntryInner<T> {
    fn is_current(&self, generation: u64) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
    }

    fn observers(&self) -> Vec<Arc<dyn EntryObserver<T>>> {
        self.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
    }
}

/// One cached payload.
pub struct PayloadEntry<T> {
    key: PayloadKey,
    hash: String,
    scheduler: Arc<dyn Scheduler>,
    environment: Arc<Environment>,
    cache: Weak<PayloadCache>,
    this: Weak<PayloadEntry<T>>,
    inner: Mutex<EntryInner<T>>,
}

impl<T> PayloadEntry<T>
where
    T: Send + Sync + 'static,
{
    /// Create an entry. Unobserved from the start, so its retention window
    /// begins immediately.
    pub fn new(
        key: PayloadKey,
        options: PayloadOptions<T>,
        scheduler: Arc<dyn Scheduler>,
        environment: Arc<Environment>,
        cache: Weak<PayloadCache>,
    ) -> Arc<Self> {
        let hash = key.hash();
        let now = scheduler.now();
        let state = match &options.initial_data {
            Some(data) => PayloadState::with_data(
                Arc::clone(data),
                options.initial_data_updated_at.unwrap_or(now),
            ),
            None => PayloadState::default(),
        };

        let entry = Arc::new_cyclic(|this| Self {
            key,
            hash,
            scheduler,
            environment,
            cache,
            this: this.clone(),
            inner: Mutex::new(EntryInner {
                options,
                state,
                observers: Vec::new(),
                in_flight: None,
                generation: 0,
                unobserved_since: Some(now),
                gc: None,
                approval: None,
            }),
        });

        {
            let mut inner = entry.inner.lock();
            entry.schedule_gc(&mut inner);
        }
        log_payload_event!(debug, entry.hash, "Entry created", fingerprint = %entry.key.fingerprint());
        entry
    }

    /// Key.
    pub fn key(&self) -> &PayloadKey {
        &self.key
    }

    /// Canonical hash of the key.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Snapshot of the state.
    pub fn state(&self) -> PayloadState<T> {
        self.inner.lock().state.clone()
    }

    /// Current status.
    pub fn status(&self) -> FetchStatus {
        self.inner.lock().state.status
    }

    /// Number of subscribed observers.
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Whether a fetch function is registered.
    pub fn has_fetch_fn(&self) -> bool {
        self.inner.lock().options.fetch_fn.is_some()
    }

    /// Retention window.
    pub fn cache_time(&self) -> Option<Duration> {
        self.inner.lock().options.cache_time
    }

    /// Merge options from a later lookup.
    ///
    /// A provided fetch function replaces the current one, the retention
    /// window grows to the larger of the two, and retry and network settings
    /// follow the latest caller.
    pub fn merge_options(&self, options: PayloadOptions<T>) {
        let mut inner = self.inner.lock();
        if let Some(fetch_fn) = options.fetch_fn {
            inner.options.fetch_fn = Some(fetch_fn);
        }
        inner.options.cache_time = match (inner.options.cache_time, options.cache_time) {
            (Some(current), Some(requested)) => Some(current.max(requested)),
            _ => None,
        };
        inner.options.retry = options.retry;
        inner.options.retry_delay = options.retry_delay;
        inner.options.network_mode = options.network_mode;
        if options.is_data_equal.is_some() {
            inner.options.is_data_equal = options.is_data_equal;
        }
        inner.options.approval_expiry = options.approval_expiry;
    }

    // =========================================================================
    // FETCH
    // =========================================================================

    /// Start a fetch, or join the one in flight.
    ///
    /// With `cancel_refetch`, an in-flight fetch is superseded when the entry
    /// already holds data; its callers follow the new fetch.
    pub fn fetch(&self, cancel_refetch: bool) -> FetchFuture<T> {
        let (future, event, observers) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if let Some(in_flight) = &inner.in_flight {
                if !(cancel_refetch && inner.state.data.is_some()) {
                    return in_flight.future.clone();
                }
            }
            let Some(fetch_fn) = inner.options.fetch_fn.clone() else {
                let err = PayloadError::configuration(format!(
                    "no fetch function registered for {}",
                    self.hash
                ));
                return futures::future::ready(Err(err)).boxed().shared();
            };
            let Some(this) = self.this.upgrade() else {
                return futures::future::ready(Err(PayloadError::Cancelled))
                    .boxed()
                    .shared();
            };

            let mut revert_status = inner.state.status;
            if let Some(previous) = inner.in_flight.take() {
                log_payload_event!(
                    debug,
                    self.hash,
                    "Superseding in-flight fetch",
                    generation = previous.generation
                );
                previous.token.cancel();
                revert_status = previous.revert_status;
            }

            inner.generation += 1;
            let generation = inner.generation;
            let token = CancellationToken::new();
            let future = this
                .run(generation, token.clone(), fetch_fn)
                .boxed()
                .shared();
            inner.in_flight = Some(InFlight {
                generation,
                future: future.clone(),
                token,
                revert_status,
            });

            let state = &mut inner.state;
            state.status = FetchStatus::Fetching;
            state.failure_count = 0;
            state.failure_reason = None;
            state.is_paused = false;

            let event = EntryEvent {
                action: EntryAction::Fetch,
                state: inner.state.clone(),
            };
            (future, event, inner.observers())
        };

        tokio::spawn(future.clone().map(|_| ()));
        self.notify(observers, &event);
        future
    }

    async fn run(
        self: Arc<Self>,
        generation: u64,
        token: CancellationToken,
        fetch_fn: FetchFn<T>,
    ) -> PayloadResult<Arc<T>> {
        let mut attempt: u32 = 0;
        loop {
            let network_mode = self.inner.lock().options.network_mode;
            if network_mode.must_wait(attempt, self.environment.is_online()) {
                self.set_paused(generation, true);
                tokio::select! {
                    _ = self.environment.wait_online() => {}
                    _ = token.cancelled() => return self.superseded(generation).await,
                }
                self.set_paused(generation, false);
            }
            attempt += 1;

            let ctx = FetchContext {
                key: self.key.clone(),
                cancellation: token.clone(),
                page_param: None,
            };
            FETCHES_STARTED.inc();
            log_payload_event!(debug, self.hash, "Fetch attempt started", generation, attempt);

            // Spawned so a superseded attempt keeps running to completion
            // while its result is discarded.
            let timer = HistogramTimer::new(&FETCH_DURATION);
            let mut task = tokio::spawn(fetch_fn(ctx));
            let joined = tokio::select! {
                joined = &mut task => joined,
                _ = token.cancelled() => return self.superseded(generation).await,
            };
            drop(timer);

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => Err(anyhow::anyhow!("fetch task failed: {join_err}")),
            };

            match outcome {
                Ok(data) => {
                    return match self.settle_success(generation, data) {
                        Some(data) => Ok(data),
                        None => self.superseded(generation).await,
                    };
                }
                Err(err) => {
                    let error = PayloadError::fetch(err);
                    match self.record_failure(generation, &error) {
                        None => return self.superseded(generation).await,
                        Some(RetryDecision::GiveUp) => return Err(error),
                        Some(RetryDecision::RetryAfter(delay)) => {
                            FETCH_RETRIES.inc();
                            tokio::select! {
                                _ = sleep(self.scheduler.as_ref(), delay) => {}
                                _ = token.cancelled() => return self.superseded(generation).await,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Resolution for callers of a fetch that lost its place.
    async fn superseded(&self, generation: u64) -> PayloadResult<Arc<T>> {
        let (newer, data) = {
            let inner = self.inner.lock();
            let newer = inner
                .in_flight
                .as_ref()
                .filter(|in_flight| in_flight.generation > generation)
                .map(|in_flight| in_flight.future.clone());
            (newer, inner.state.data.clone())
        };
        if let Some(newer) = newer {
            return newer.await;
        }
        data.ok_or(PayloadError::Cancelled)
    }

    fn set_paused(&self, generation: u64, paused: bool) {
        let (event, observers) = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) || inner.state.is_paused == paused {
                return;
            }
            inner.state.is_paused = paused;
            let action = if paused {
                EntryAction::Pause
            } else {
                EntryAction::Continue
            };
            (
                EntryEvent {
                    action,
                    state: inner.state.clone(),
                },
                inner.observers(),
            )
        };
        log_payload_event!(debug, self.hash, "Fetch paused state changed", paused);
        self.notify(observers, &event);
    }

    fn settle_success(&self, generation: u64, data: T) -> Option<Arc<T>> {
        let now = self.scheduler.now();
        let (data, event, observers) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if !inner.is_current(generation) {
                return None;
            }
            inner.in_flight = None;

            let fresh = Arc::new(data);
            let data = match (&inner.options.is_data_equal, &inner.state.data) {
                (Some(is_equal), Some(old)) if is_equal(&**old, &*fresh) => Arc::clone(old),
                _ => fresh,
            };

            let state = &mut inner.state;
            state.data = Some(Arc::clone(&data));
            state.data_update_count += 1;
            state.data_updated_at = Some(now);
            state.error = None;
            state.failure_count = 0;
            state.failure_reason = None;
            state.status = FetchStatus::Success;
            state.is_invalidated = false;
            state.is_paused = false;
            if inner.observers.is_empty() {
                self.schedule_gc(inner);
            }

            let event = EntryEvent {
                action: EntryAction::Success,
                state: inner.state.clone(),
            };
            (data, event, inner.observers())
        };

        log_payload_event!(debug, self.hash, "Fetch succeeded", generation);
        self.notify(observers, &event);
        if let Some(cache) = self.cache.upgrade() {
            cache.hooks().success(&self.hash);
        }
        Some(data)
    }

    fn record_failure(&self, generation: u64, error: &PayloadError) -> Option<RetryDecision> {
        let now = self.scheduler.now();
        let (decision, failure_count, event, observers) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if !inner.is_current(generation) {
                return None;
            }

            inner.state.failure_count += 1;
            inner.state.failure_reason = Some(error.clone());
            let failure_count = inner.state.failure_count;
            let decision = decide(
                &inner.options.retry,
                &inner.options.retry_delay,
                failure_count,
                error,
            );

            let action = match decision {
                RetryDecision::RetryAfter(_) => EntryAction::Failed,
                RetryDecision::GiveUp => {
                    inner.in_flight = None;
                    let state = &mut inner.state;
                    state.error = Some(error.clone());
                    state.error_update_count += 1;
                    state.error_updated_at = Some(now);
                    state.status = FetchStatus::Error;
                    state.is_paused = false;
                    if inner.observers.is_empty() {
                        self.schedule_gc(inner);
                    }
                    EntryAction::Error
                }
            };
            let event = EntryEvent {
                action,
                state: inner.state.clone(),
            };
            (decision, failure_count, event, inner.observers())
        };

        FETCH_FAILURES.inc();
        match decision {
            RetryDecision::RetryAfter(delay) => log_payload_event!(
                debug,
                self.hash,
                "Fetch failed, retrying",
                failure_count,
                delay_ms = delay.as_millis() as u64,
                error = %error
            ),
            RetryDecision::GiveUp => log_payload_event!(
                warn,
                self.hash,
                "Fetch failed, giving up",
                failure_count,
                error = %error
            ),
        }

        self.notify(observers, &event);
        if decision == RetryDecision::GiveUp {
            if let Some(cache) = self.cache.upgrade() {
                cache.hooks().error(&self.hash, error);
            }
        }
        Some(decision)
    }

    /// Cancel the in-flight fetch and restore the status it started from.
    ///
    /// Returns false if nothing was in flight. Callers of the cancelled fetch
    /// receive the current data, or [`PayloadError::Cancelled`] if there is none.
    pub fn cancel(&self) -> bool {
        let (event, observers) = {
            let mut inner = self.inner.lock();
            let Some(in_flight) = inner.in_flight.take() else {
                return false;
            };
            in_flight.token.cancel();
            inner.state.status = in_flight.revert_status;
            inner.state.is_paused = false;
            if inner.observers.is_empty() {
                self.schedule_gc(&mut inner);
            }
            (
                EntryEvent {
                    action: EntryAction::Cancel,
                    state: inner.state.clone(),
                },
                inner.observers(),
            )
        };
        log_payload_event!(debug, self.hash, "Fetch cancelled", status = %event.state.status);
        self.notify(observers, &event);
        true
    }

    // =========================================================================
    // MANUAL UPDATES
    // =========================================================================

    /// Replace the state wholesale.
    pub fn set_state(&self, state: PayloadState<T>) -> PayloadResult<()> {
        state.check_invariant()?;
        let (event, observers) = {
            let mut inner = self.inner.lock();
            inner.state = state;
            (
                EntryEvent {
                    action: EntryAction::SetState,
                    state: inner.state.clone(),
                },
                inner.observers(),
            )
        };
        self.notify(observers, &event);
        Ok(())
    }

    /// Set data as if a fetch had just succeeded. A running fetch keeps the
    /// status at `Fetching` and may overwrite the data when it lands.
    pub fn set_data(&self, data: T) -> Arc<T> {
        let now = self.scheduler.now();
        let data = Arc::new(data);
        let (event, observers) = {
            let mut inner = self.inner.lock();
            let fetching = inner.in_flight.is_some();
            let state = &mut inner.state;
            state.data = Some(Arc::clone(&data));
            state.data_update_count += 1;
            state.data_updated_at = Some(now);
            state.error = None;
            state.failure_count = 0;
            state.failure_reason = None;
            state.is_invalidated = false;
            if !fetching {
                state.status = FetchStatus::Success;
            }
            (
                EntryEvent {
                    action: EntryAction::SetState,
                    state: inner.state.clone(),
                },
                inner.observers(),
            )
        };
        self.notify(observers, &event);
        data
    }

    /// Mark the data stale. Does not fetch; observers decide.
    pub fn invalidate(&self) {
        let (event, observers) = {
            let mut inner = self.inner.lock();
            inner.state.is_invalidated = true;
            (
                EntryEvent {
                    action: EntryAction::Invalidate,
                    state: inner.state.clone(),
                },
                inner.observers(),
            )
        };
        log_payload_event!(debug, self.hash, "Entry invalidated");
        self.notify(observers, &event);
    }

    // =========================================================================
    // OBSERVERS & RETENTION
    // =========================================================================

    /// Subscribe an observer. Returns the new observer count.
    pub fn add_observer(&self, id: u64, observer: Arc<dyn EntryObserver<T>>) -> usize {
        let mut inner = self.inner.lock();
        if !inner.observers.iter().any(|(existing, _)| *existing == id) {
            inner.observers.push((id, observer));
        }
        inner.gc = None;
        inner.unobserved_since = None;
        inner.observers.len()
    }

    /// Unsubscribe an observer. The retention window starts when the count
    /// reaches zero. Returns the new observer count.
    pub fn remove_observer(&self, id: u64) -> usize {
        let now = self.scheduler.now();
        let mut inner = self.inner.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(existing, _)| *existing != id);
        if before > 0 && inner.observers.is_empty() {
            inner.unobserved_since = Some(now);
            self.schedule_gc(&mut inner);
            log_payload_event!(debug, self.hash, "Last observer left");
        }
        inner.observers.len()
    }

    fn schedule_gc(&self, inner: &mut EntryInner<T>) {
        inner.gc = None;
        let Some(cache_time) = inner.options.cache_time else {
            return;
        };
        let cache = self.cache.clone();
        let hash = self.hash.clone();
        inner.gc = Some(self.scheduler.schedule(
            cache_time,
            Box::new(move || {
                if let Some(cache) = cache.upgrade() {
                    cache.evict_if_idle(&hash);
                }
            }),
        ));
    }

    /// An entry with a fetch in flight is kept; its retention timer is
    /// re-armed when the fetch settles.
    fn is_evictable_at(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        if !inner.observers.is_empty() || inner.in_flight.is_some() {
            return false;
        }
        match (inner.unobserved_since, inner.options.cache_time) {
            (Some(since), Some(cache_time)) => now.saturating_duration_since(since) >= cache_time,
            _ => false,
        }
    }

    fn teardown(&self) {
        let (in_flight, approval) = {
            let mut inner = self.inner.lock();
            inner.gc = None;
            (inner.in_flight.take(), inner.approval.take())
        };
        if let Some(in_flight) = in_flight {
            in_flight.token.cancel();
        }
        if let Some(mut approval) = approval {
            approval.expiry = None;
            if let Some(mut channel) = approval.channel.take() {
                channel.close();
            }
        }
        log_payload_event!(debug, self.hash, "Entry torn down");
    }

    fn notify(&self, observers: Vec<Arc<dyn EntryObserver<T>>>, event: &EntryEvent<T>) {
        for observer in observers {
            observer.on_entry_update(event);
        }
    }

    // =========================================================================
    // APPROVAL FLOW
    // =========================================================================

    /// Track a remote approval on this entry through `channel`.
    ///
    /// Replaces (and closes) any previous attachment. A local countdown of
    /// `config.expires_in`, or the entry's `approval_expiry` when that is
    /// unset, expires the flow if no terminal message arrives in time.
    pub fn attach_approval(&self, mut channel: Box<dyn EventChannel>, config: ApprovalConfig) {
        let previous = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let expires_in = config.expires_in.or(inner.options.approval_expiry);
            let flow = ApprovalFlow::new(config.payload_uuid, expires_in);
            inner.state.approval = Some(flow.snapshot().clone());
            let previous = inner.approval.replace(ApprovalAttachment {
                flow,
                channel: None,
                channel_failed: false,
                expiry: None,
            });
            if let Some(remaining) = expires_in {
                self.arm_expiry(inner, remaining);
            }
            previous
        };
        if let Some(mut previous) = previous {
            previous.expiry = None;
            if let Some(mut old) = previous.channel.take() {
                old.close();
            }
        }

        let this = self.this.clone();
        channel.on_error(Arc::new(move |error: PayloadError| {
            if let Some(entry) = this.upgrade() {
                entry.fail_channel(error);
            }
        }));
        let this = self.this.clone();
        channel.on_message(Arc::new(move |message: ChannelMessage| {
            if let Some(entry) = this.upgrade() {
                entry.apply_channel_message(message);
            }
        }));

        // A terminal message may have landed before the channel was stored.
        let (leftover, event, observers) = {
            let mut inner = self.inner.lock();
            let leftover = match inner.approval.as_mut() {
                Some(attachment)
                    if attachment.channel.is_none()
                        && !attachment.channel_failed
                        && !attachment.flow.status().is_terminal() =>
                {
                    attachment.channel = Some(channel);
                    None
                }
                _ => Some(channel),
            };
            let event = EntryEvent {
                action: EntryAction::ApprovalAttached,
                state: inner.state.clone(),
            };
            (leftover, event, inner.observers())
        };
        if let Some(mut channel) = leftover {
            channel.close();
        }

        log_payload_event!(info, self.hash, "Approval flow attached");
        self.notify(observers, &event);
    }

    /// Feed one channel message into the approval flow.
    pub fn apply_channel_message(&self, message: ChannelMessage) -> ApprovalTransition {
        self.apply_approval(|flow| flow.apply(&message))
    }

    /// Local countdown elapsed.
    fn expire_approval(&self) -> ApprovalTransition {
        self.apply_approval(ApprovalFlow::expire)
    }

    /// The approval channel broke before the flow settled. The error is
    /// surfaced on the entry; the local countdown, if any, stays armed.
    fn fail_channel(&self, error: PayloadError) {
        let now = self.scheduler.now();
        let (closing, event, observers) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(attachment) = inner.approval.as_mut() else {
                return;
            };
            if attachment.channel_failed || attachment.flow.status().is_terminal() {
                return;
            }
            attachment.channel_failed = true;
            let closing = attachment.channel.take();

            let state = &mut inner.state;
            state.error = Some(error.clone());
            state.error_update_count += 1;
            state.error_updated_at = Some(now);
            if state.status != FetchStatus::Fetching {
                state.status = FetchStatus::Error;
            }
            let event = EntryEvent {
                action: EntryAction::Error,
                state: inner.state.clone(),
            };
            (closing, event, inner.observers())
        };

        if let Some(mut channel) = closing {
            channel.close();
        }
        log_payload_event!(warn, self.hash, "Approval channel failed", error = %error);
        self.notify(observers, &event);
    }

    fn apply_approval(&self, f: impl FnOnce(&mut ApprovalFlow) -> ApprovalTransition) -> ApprovalTransition {
        let now = self.scheduler.now();
        let (transition, closing, event, observers) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(attachment) = inner.approval.as_mut() else {
                return ApprovalTransition::Ignored;
            };
            let transition = f(&mut attachment.flow);
            let snapshot = attachment.flow.snapshot().clone();

            let mut closing = None;
            match transition {
                ApprovalTransition::Ignored => return transition,
                ApprovalTransition::Countdown(remaining) => self.arm_expiry(inner, remaining),
                ApprovalTransition::Moved { to, .. } if to.is_terminal() => {
                    attachment.expiry = None;
                    closing = attachment.channel.take();
                    if let Some(error) = snapshot.terminal_error() {
                        let state = &mut inner.state;
                        state.error = Some(error);
                        state.error_update_count += 1;
                        state.error_updated_at = Some(now);
                        state.status = FetchStatus::Error;
                    }
                }
                ApprovalTransition::Moved { .. } => {}
            }

            inner.state.approval = Some(snapshot);
            let event = EntryEvent {
                action: EntryAction::Approval(transition),
                state: inner.state.clone(),
            };
            (transition, closing, event, inner.observers())
        };

        if let Some(mut channel) = closing {
            channel.close();
        }
        if let ApprovalTransition::Moved { from, to } = transition {
            APPROVAL_TRANSITIONS.with_label_values(&[to.as_str()]).inc();
            log_approval_event!(info, self.hash, "Approval transition", from, to);
        }
        self.notify(observers, &event);
        transition
    }

    fn arm_expiry(&self, inner: &mut EntryInner<T>, remaining: Duration) {
        let this = self.this.clone();
        let handle = self.scheduler.schedule(
            remaining,
            Box::new(move || {
                if let Some(entry) = this.upgrade() {
                    entry.expire_approval();
                }
            }),
        );
        if let Some(attachment) = inner.approval.as_mut() {
            attachment.expiry = Some(handle);
        }
    }

    fn observers_snapshot(&self) -> Vec<Arc<dyn EntryObserver<T>>> {
        self.inner.lock().observers()
    }
}

impl<T> std::fmt::Debug for PayloadEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadEntry")
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// TYPE-ERASED VIEW
// =============================================================================

/// Entry view with the data type erased, as stored in the cache.
pub trait CachedEntry: Send + Sync {
    /// Key.
    fn key(&self) -> &PayloadKey;
    /// Canonical hash.
    fn hash(&self) -> &str;
    /// Current status.
    fn status(&self) -> FetchStatus;
    /// Subscribed observers.
    fn observer_count(&self) -> usize;
    /// Whether the entry has no observers and its retention window elapsed.
    fn is_evictable(&self, now: Instant) -> bool;
    /// Mark stale.
    fn invalidate(&self);
    /// Cancel the in-flight fetch.
    fn cancel(&self) -> bool;
    /// Forward a focus event to observers.
    fn notify_focus(&self);
    /// Forward a reconnect event to observers.
    fn notify_online(&self);
    /// Release timers, tokens and channels after removal.
    fn teardown(&self);
    /// Upcast for typed access.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> CachedEntry for PayloadEntry<T>
where
    T: Send + Sync + 'static,
{
    fn key(&self) -> &PayloadKey {
        &self.key
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    fn status(&self) -> FetchStatus {
        PayloadEntry::status(self)
    }

    fn observer_count(&self) -> usize {
        PayloadEntry::observer_count(self)
    }

    fn is_evictable(&self, now: Instant) -> bool {
        self.is_evictable_at(now)
    }

    fn invalidate(&self) {
        PayloadEntry::invalidate(self)
    }

    fn cancel(&self) -> bool {
        PayloadEntry::cancel(self)
    }

    fn notify_focus(&self) {
        for observer in self.observers_snapshot() {
            observer.on_focus();
        }
    }

    fn notify_online(&self) {
        for observer in self.observers_snapshot() {
            observer.on_online();
        }
    }

    fn teardown(&self) {
        PayloadEntry::teardown(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
