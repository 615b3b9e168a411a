//! # Payload Observer
//!
//! Per-consumer subscription to one entry. Derives a projected result from
//! the entry state, decides when to fetch (mount, staleness, polling, focus,
//! reconnect, invalidation) and notifies its listener only when a property
//! the consumer cares about changed.
//!
//! Fetches requested from inside a notification or timer are spawned as new
//! tasks instead of running inline.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::cache::PayloadCache;
use super::client::PayloadClient;
use super::entry::{EntryAction, EntryEvent, EntryObserver, PayloadEntry};
use crate::adapters::Environment;
use crate::domain::{
    ApprovalSnapshot, FetchStatus, PayloadError, PayloadKey, PayloadResult, PayloadState,
};
use crate::options::{NotifyOnChangeProps, ObserverOptions, RefetchMode, RefetchOn, ResultProp};
use crate::ports::{Scheduler, TimerHandle};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// RESULT
// =============================================================================

/// Result derived by an observer from its entry.
#[derive(Debug)]
pub struct ObserverResult<S> {
    /// Projected data, possibly the previous key's while the new key loads.
    pub data: Option<Arc<S>>,
    /// Error of the last settled fetch or terminal approval outcome.
    pub error: Option<PayloadError>,
    /// Status as shown to the consumer.
    pub status: FetchStatus,
    /// A fetch is in flight.
    pub is_fetching: bool,
    /// Data is older than the stale time, invalidated, or absent.
    pub is_stale: bool,
    /// The fetch is waiting for connectivity.
    pub is_paused: bool,
    /// `data` belongs to the previous key.
    pub is_previous_data: bool,
    /// Consecutive failed attempts.
    pub failure_count: u32,
    /// Error of the most recent failed attempt.
    pub failure_reason: Option<PayloadError>,
    /// When the entry data was last replaced.
    pub data_updated_at: Option<Instant>,
    /// When the entry error was last replaced.
    pub error_updated_at: Option<Instant>,
    /// Approval sub-state, if attached.
    pub approval: Option<ApprovalSnapshot>,
}

impl<S> ObserverResult<S> {
    /// Settled successfully.
    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }

    /// Settled in error.
    pub fn is_error(&self) -> bool {
        self.status == FetchStatus::Error
    }

    /// Properties that differ from `other`. Data is compared by pointer.
    pub fn changed_props(&self, other: &Self) -> Vec<ResultProp> {
        let mut changed = Vec::new();
        let same_data = match (&self.data, &other.data) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if !same_data {
            changed.push(ResultProp::Data);
        }
        if self.error != other.error {
            changed.push(ResultProp::Error);
        }
        if self.status != other.status {
            changed.push(ResultProp::Status);
        }
        if self.is_fetching != other.is_fetching {
            changed.push(ResultProp::IsFetching);
        }
        if self.is_stale != other.is_stale {
            changed.push(ResultProp::IsStale);
        }
        if self.is_paused != other.is_paused {
            changed.push(ResultProp::IsPaused);
        }
        if self.is_previous_data != other.is_previous_data {
            changed.push(ResultProp::IsPreviousData);
        }
        if self.failure_count != other.failure_count {
            changed.push(ResultProp::FailureCount);
        }
        if self.failure_reason != other.failure_reason {
            changed.push(ResultProp::FailureReason);
        }
        if self.data_updated_at != other.data_updated_at {
            changed.push(ResultProp::DataUpdatedAt);
        }
        if self.error_updated_at != other.error_updated_at {
            changed.push(ResultProp::ErrorUpdatedAt);
        }
        if self.approval != other.approval {
            changed.push(ResultProp::Approval);
        }
        changed
    }
}

impl<S> Clone for ObserverResult<S> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            status: self.status,
            is_fetching: self.is_fetching,
            is_stale: self.is_stale,
            is_paused: self.is_paused,
            is_previous_data: self.is_previous_data,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
            approval: self.approval.clone(),
        }
    }
}

impl<S> Default for ObserverResult<S> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            status: FetchStatus::Idle,
            is_fetching: false,
            is_stale: true,
            is_paused: false,
            is_previous_data: false,
            failure_count: 0,
            failure_reason: None,
            data_updated_at: None,
            error_updated_at: None,
            approval: None,
        }
    }
}

/// Result handed to consumers. Reading a property through an accessor
/// records it, and later notifications are filtered to recorded properties.
pub struct TrackedResult<S> {
    result: ObserverResult<S>,
    tracked: Arc<Mutex<HashSet<ResultProp>>>,
}

impl<S> TrackedResult<S> {
    fn track(&self, prop: ResultProp) {
        self.tracked.lock().insert(prop);
    }

    /// Projected data.
    pub fn data(&self) -> Option<&Arc<S>> {
        self.track(ResultProp::Data);
        self.result.data.as_ref()
    }

    /// Error.
    pub fn error(&self) -> Option<&PayloadError> {
        self.track(ResultProp::Error);
        self.result.error.as_ref()
    }

    /// Status.
    pub fn status(&self) -> FetchStatus {
        self.track(ResultProp::Status);
        self.result.status
    }

    /// A fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        self.track(ResultProp::IsFetching);
        self.result.is_fetching
    }

    /// Data is stale.
    pub fn is_stale(&self) -> bool {
        self.track(ResultProp::IsStale);
        self.result.is_stale
    }

    /// The fetch waits for connectivity.
    pub fn is_paused(&self) -> bool {
        self.track(ResultProp::IsPaused);
        self.result.is_paused
    }

    /// Data belongs to the previous key.
    pub fn is_previous_data(&self) -> bool {
        self.track(ResultProp::IsPreviousData);
        self.result.is_previous_data
    }

    /// Consecutive failed attempts.
    pub fn failure_count(&self) -> u32 {
        self.track(ResultProp::FailureCount);
        self.result.failure_count
    }

    /// Error of the last failed attempt.
    pub fn failure_reason(&self) -> Option<&PayloadError> {
        self.track(ResultProp::FailureReason);
        self.result.failure_reason.as_ref()
    }

    /// When data was last replaced.
    pub fn data_updated_at(&self) -> Option<Instant> {
        self.track(ResultProp::DataUpdatedAt);
        self.result.data_updated_at
    }

    /// When the error was last replaced.
    pub fn error_updated_at(&self) -> Option<Instant> {
        self.track(ResultProp::ErrorUpdatedAt);
        self.result.error_updated_at
    }

    /// Approval sub-state.
    pub fn approval(&self) -> Option<&ApprovalSnapshot> {
        self.track(ResultProp::Approval);
        self.result.approval.as_ref()
    }

    /// The underlying result, without tracking.
    pub fn untracked(&self) -> &ObserverResult<S> {
        &self.result
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for TrackedResult<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.result.fmt(f)
    }
}

/// Listener notified with each relevant result change.
pub type Listener<S> = Arc<dyn Fn(PayloadResult<TrackedResult<S>>) + Send + Sync>;

// =============================================================================
// OBSERVER
// =============================================================================

enum Settled<S> {
    Success(Arc<S>),
    Error(PayloadError),
}

struct ObserverState<T, S> {
    options: ObserverOptions<T, S>,
    entry: Arc<PayloadEntry<T>>,
    listener: Option<Listener<S>>,
    result: ObserverResult<S>,
    tracked: Arc<Mutex<HashSet<ResultProp>>>,
    memo: Option<(Arc<T>, Arc<S>)>,
    previous_data: Option<Arc<S>>,
    stale_timer: Option<TimerHandle>,
    interval_timer: Option<TimerHandle>,
    interval_period: Option<Duration>,
}

impl<T, S> ObserverState<T, S> {
    fn should_notify(&self, next: &ObserverResult<S>) -> bool {
        let changed = self.result.changed_props(next);
        if changed.is_empty() {
            return false;
        }
        match &self.options.notify_on_change_props {
            NotifyOnChangeProps::All => true,
            NotifyOnChangeProps::Props(props) => changed.iter().any(|p| props.contains(p)),
            NotifyOnChangeProps::Tracked => {
                let tracked = self.tracked.lock();
                tracked.is_empty() || changed.iter().any(|p| tracked.contains(p))
            }
        }
    }

    fn deliverable(&self) -> PayloadResult<TrackedResult<S>> {
        let result = self.result.clone();
        if let Some(error) = &result.error {
            if result.status == FetchStatus::Error
                && self.options.use_error_boundary.should_raise(error)
            {
                self.tracked.lock().insert(ResultProp::Error);
                return Err(error.clone());
            }
        }
        Ok(TrackedResult {
            result,
            tracked: Arc::clone(&self.tracked),
        })
    }
}

struct ObserverInner<T, S> {
    id: u64,
    cache: Arc<PayloadCache>,
    scheduler: Arc<dyn Scheduler>,
    environment: Arc<Environment>,
    this: Weak<ObserverInner<T, S>>,
    state: Mutex<ObserverState<T, S>>,
}

/// Subscription of one consumer to one key.
///
/// Dropping the observer unsubscribes it.
pub struct PayloadObserver<T, S = T>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    inner: Arc<ObserverInner<T, S>>,
}

impl<T, S> PayloadObserver<T, S>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    /// Create an observer. Validation errors are raised here, not deferred.
    pub fn new(client: &PayloadClient, options: ObserverOptions<T, S>) -> PayloadResult<Self> {
        options.validate()?;
        let cache = Arc::clone(client.cache());
        let entry = cache.get_or_create(&options.key, options.payload.clone())?;
        if options.enabled && !entry.has_fetch_fn() {
            return Err(PayloadError::configuration(format!(
                "enabled observer for {} has no fetch function",
                entry.hash()
            )));
        }

        let scheduler = Arc::clone(client.scheduler());
        let inner = Arc::new_cyclic(|this| ObserverInner {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            cache,
            scheduler,
            environment: Arc::clone(client.environment()),
            this: this.clone(),
            state: Mutex::new(ObserverState {
                options,
                entry,
                listener: None,
                result: ObserverResult::default(),
                tracked: Arc::new(Mutex::new(HashSet::new())),
                memo: None,
                previous_data: None,
                stale_timer: None,
                interval_timer: None,
                interval_period: None,
            }),
        });
        {
            let mut st = inner.state.lock();
            let state = st.entry.state();
            st.result = inner.compute(&mut st, &state);
        }
        Ok(Self { inner })
    }

    /// Observer identifier, unique per process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Key currently observed.
    pub fn key(&self) -> PayloadKey {
        self.inner.state.lock().options.key.clone()
    }

    /// Whether a listener is registered.
    pub fn is_subscribed(&self) -> bool {
        self.inner.state.lock().listener.is_some()
    }

    /// Register `listener` and start observing. May fetch according to the
    /// mount policy. Subscribing again replaces the listener.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(PayloadResult<TrackedResult<S>>) + Send + Sync + 'static,
    {
        self.inner.subscribe(Arc::new(listener));
    }

    /// Stop observing. Cancels both timers.
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }

    /// Switch options, moving to another entry if the key changed.
    pub fn set_options(&self, options: ObserverOptions<T, S>) -> PayloadResult<()> {
        self.inner.set_options(options)
    }

    /// Current result. Raises the error if the error boundary says so.
    pub fn result(&self) -> PayloadResult<TrackedResult<S>> {
        self.inner.result()
    }

    /// Fetch now, superseding an in-flight fetch if data is already present.
    pub async fn refetch(&self) -> PayloadResult<TrackedResult<S>> {
        let entry = self.inner.state.lock().entry.clone();
        if let Err(err) = entry.fetch(true).await {
            if !err.is_cancelled() {
                trace!(observer = self.inner.id, error = %err, "Refetch settled in error");
            }
        }
        self.inner.result()
    }
}

impl<T, S> Drop for PayloadObserver<T, S>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.unsubscribe();
    }
}

impl<T, S> std::fmt::Debug for PayloadObserver<T, S>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadObserver")
            .field("id", &self.inner.id)
            .field("key", &self.key())
            .finish()
    }
}

impl<T, S> ObserverInner<T, S>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn compute(&self, st: &mut ObserverState<T, S>, state: &PayloadState<T>) -> ObserverResult<S> {
        let now = self.scheduler.now();
        let select = Arc::clone(&st.options.select);
        let mut data = None;
        if let Some(raw) = &state.data {
            let memoized = st
                .memo
                .as_ref()
                .filter(|(input, _)| Arc::ptr_eq(input, raw))
                .map(|(_, output)| Arc::clone(output));
            data = Some(match memoized {
                Some(output) => output,
                None => {
                    let output = select(raw);
                    st.memo = Some((Arc::clone(raw), Arc::clone(&output)));
                    output
                }
            });
        }

        let mut status = state.status;
        let mut is_previous_data = false;
        if data.is_none()
            && st.options.keep_previous_data
            && matches!(state.status, FetchStatus::Idle | FetchStatus::Fetching)
        {
            if let Some(previous) = &st.previous_data {
                data = Some(Arc::clone(previous));
                status = FetchStatus::Success;
                is_previous_data = true;
            }
        }

        ObserverResult {
            data,
            error: state.error.clone(),
            status,
            is_fetching: state.is_fetching(),
            is_stale: state.is_stale_at(now, st.options.stale_time),
            is_paused: state.is_paused,
            is_previous_data,
            failure_count: state.failure_count,
            failure_reason: state.failure_reason.clone(),
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            approval: state.approval.clone(),
        }
    }

    fn as_entry_observer(&self) -> Option<Arc<dyn EntryObserver<T>>> {
        self.this
            .upgrade()
            .map(|this| this as Arc<dyn EntryObserver<T>>)
    }

    fn should_fetch_on_mount(
        &self,
        options: &ObserverOptions<T, S>,
        state: &PayloadState<T>,
        first: bool,
    ) -> bool {
        if !options.enabled {
            return false;
        }
        if state.status == FetchStatus::Error && !options.retry_on_mount {
            return false;
        }
        if state.data.is_none() {
            return true;
        }
        let is_stale = state.is_stale_at(self.scheduler.now(), options.stale_time);
        match options.refetch_on_mount.mode(state) {
            RefetchMode::Never => false,
            RefetchMode::IfStale => first && is_stale,
            RefetchMode::Always => true,
        }
    }

    fn subscribe(&self, listener: Listener<S>) {
        let entry = {
            let mut st = self.state.lock();
            if st.listener.replace(listener).is_some() {
                return;
            }
            st.entry.clone()
        };
        let Some(me) = self.as_entry_observer() else {
            return;
        };

        let count = entry.add_observer(self.id, me);
        let should_fetch = {
            let st = self.state.lock();
            self.should_fetch_on_mount(&st.options, &entry.state(), count == 1)
        };
        debug!(observer = self.id, payload = %entry.hash(), count, should_fetch, "Observer subscribed");
        if should_fetch {
            drop(entry.fetch(false));
        }
        self.refresh(true);
    }

    fn unsubscribe(&self) {
        let entry = {
            let mut st = self.state.lock();
            if st.listener.take().is_none() {
                return;
            }
            st.stale_timer = None;
            st.interval_timer = None;
            st.interval_period = None;
            st.entry.clone()
        };
        let remaining = entry.remove_observer(self.id);
        debug!(observer = self.id, payload = %entry.hash(), remaining, "Observer unsubscribed");
    }

    fn set_options(&self, options: ObserverOptions<T, S>) -> PayloadResult<()> {
        options.validate()?;
        let (old_entry, was_enabled, subscribed) = {
            let st = self.state.lock();
            (st.entry.clone(), st.options.enabled, st.listener.is_some())
        };

        let key_changed = options.key.hash() != old_entry.hash();
        let entry = if key_changed {
            self.cache.get_or_create(&options.key, options.payload.clone())?
        } else {
            old_entry.merge_options(options.payload.clone());
            Arc::clone(&old_entry)
        };
        if options.enabled && !entry.has_fetch_fn() {
            return Err(PayloadError::configuration(format!(
                "enabled observer for {} has no fetch function",
                entry.hash()
            )));
        }
        let now_enabled = options.enabled;

        {
            let mut st = self.state.lock();
            if key_changed {
                st.previous_data = st.result.data.clone();
                st.entry = Arc::clone(&entry);
            }
            st.memo = None;
            st.options = options;
        }

        if subscribed && (key_changed || (now_enabled && !was_enabled)) {
            let mut first = false;
            if key_changed {
                old_entry.remove_observer(self.id);
                if let Some(me) = self.as_entry_observer() {
                    first = entry.add_observer(self.id, me) == 1;
                }
            }
            let should_fetch = {
                let st = self.state.lock();
                self.should_fetch_on_mount(&st.options, &entry.state(), first)
            };
            if should_fetch {
                drop(entry.fetch(false));
            }
        }
        self.refresh(true);
        Ok(())
    }

    /// Recompute from the entry, re-arm timers, and notify if relevant.
    fn refresh(&self, rearm_interval: bool) {
        let delivery = {
            let mut st = self.state.lock();
            let state = st.entry.state();
            let next = self.compute(&mut st, &state);
            let notify = st.should_notify(&next);
            st.result = next;
            self.arm_stale_timer(&mut st, &state);
            if rearm_interval {
                self.arm_interval(&mut st, &state);
            }
            match (&st.listener, notify) {
                (Some(listener), true) => Some((Arc::clone(listener), st.deliverable())),
                _ => None,
            }
        };
        if let Some((listener, result)) = delivery {
            listener(result);
        }
    }

    fn result(&self) -> PayloadResult<TrackedResult<S>> {
        let mut st = self.state.lock();
        let state = st.entry.state();
        st.result = self.compute(&mut st, &state);
        st.deliverable()
    }

    // =========================================================================
    // TIMERS
    // =========================================================================

    fn arm_stale_timer(&self, st: &mut ObserverState<T, S>, state: &PayloadState<T>) {
        st.stale_timer = None;
        if st.listener.is_none() {
            return;
        }
        let Some(stale_time) = st.options.stale_time else {
            return;
        };
        let Some(updated_at) = state.data_updated_at else {
            return;
        };
        if state.data.is_none() || state.is_invalidated {
            return;
        }
        let age = self.scheduler.now().saturating_duration_since(updated_at);
        if age >= stale_time {
            return;
        }

        let this = self.this.clone();
        st.stale_timer = Some(self.scheduler.schedule(
            stale_time - age,
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.on_stale();
                }
            }),
        ));
    }

    fn on_stale(&self) {
        let refetch = {
            let mut st = self.state.lock();
            if st.listener.is_none() {
                return;
            }
            st.stale_timer = None;
            let state = st.entry.state();
            let is_stale = state.is_stale_at(self.scheduler.now(), st.options.stale_time);
            (st.options.enabled && st.options.refetch_on_mount.should_refetch(&state, is_stale))
                .then(|| st.entry.clone())
        };
        trace!(observer = self.id, "Stale timer fired");
        self.refresh(false);
        if let Some(entry) = refetch {
            spawn_fetch(entry);
        }
    }

    fn arm_interval(&self, st: &mut ObserverState<T, S>, state: &PayloadState<T>) {
        st.interval_timer = None;
        st.interval_period = None;
        if st.listener.is_none() || !st.options.enabled {
            return;
        }
        let Some(period) = st.options.refetch_interval.resolve(state) else {
            return;
        };
        st.interval_period = Some(period);
        let this = self.this.clone();
        st.interval_timer = Some(self.scheduler.schedule(
            period,
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.on_interval();
                }
            }),
        ));
    }

    /// Re-arm polling only if the period resolved from `state` differs from
    /// the armed one, so a fixed period is not reset by every fetch.
    fn sync_interval(&self, st: &mut ObserverState<T, S>, state: &PayloadState<T>) {
        let period = if st.listener.is_some() && st.options.enabled {
            st.options.refetch_interval.resolve(state)
        } else {
            None
        };
        if period != st.interval_period || (period.is_some() && st.interval_timer.is_none()) {
            self.arm_interval(st, state);
        }
    }

    fn on_interval(&self) {
        let refetch = {
            let mut st = self.state.lock();
            if st.listener.is_none() {
                return;
            }
            let state = st.entry.state();
            let allowed =
                self.environment.is_focused() || st.options.refetch_interval_in_background;
            self.arm_interval(&mut st, &state);
            allowed.then(|| st.entry.clone())
        };
        if let Some(entry) = refetch {
            trace!(observer = self.id, payload = %entry.hash(), "Interval refetch");
            spawn_fetch(entry);
        }
    }

    fn refetch_on_event(&self, policy: impl Fn(&ObserverOptions<T, S>) -> &RefetchOn<T>) {
        let refetch = {
            let st = self.state.lock();
            if st.listener.is_none() || !st.options.enabled {
                return;
            }
            let state = st.entry.state();
            let is_stale = state.is_stale_at(self.scheduler.now(), st.options.stale_time);
            policy(&st.options)
                .should_refetch(&state, is_stale)
                .then(|| st.entry.clone())
        };
        if let Some(entry) = refetch {
            spawn_fetch(entry);
        }
    }
}

impl<T, S> EntryObserver<T> for ObserverInner<T, S>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn on_entry_update(&self, event: &EntryEvent<T>) {
        let (delivery, settled, callbacks, refetch) = {
            let mut st = self.state.lock();
            let Some(listener) = st.listener.clone() else {
                return;
            };

            let next = self.compute(&mut st, &event.state);
            let notify = st.should_notify(&next);
            st.result = next;

            let settled = match event.action {
                EntryAction::Success => st
                    .result
                    .data
                    .clone()
                    .filter(|_| !st.result.is_previous_data)
                    .map(Settled::Success),
                EntryAction::Error => event.state.error.clone().map(Settled::Error),
                EntryAction::Approval(transition) if transition.entered_terminal() => event
                    .state
                    .approval
                    .as_ref()
                    .and_then(ApprovalSnapshot::terminal_error)
                    .map(Settled::Error),
                _ => None,
            };
            let callbacks = (
                st.options.on_success.clone(),
                st.options.on_error.clone(),
                st.options.on_settled.clone(),
            );

            match event.action {
                EntryAction::Success
                | EntryAction::Error
                | EntryAction::SetState
                | EntryAction::Invalidate => self.arm_stale_timer(&mut st, &event.state),
                _ => {}
            }
            if matches!(
                event.action,
                EntryAction::Success | EntryAction::Error | EntryAction::SetState
            ) {
                self.sync_interval(&mut st, &event.state);
            }

            let refetch = (event.action == EntryAction::Invalidate && st.options.enabled)
                .then(|| st.entry.clone());
            let delivery = notify.then(|| (listener, st.deliverable()));
            (delivery, settled, callbacks, refetch)
        };

        let (on_success, on_error, on_settled) = callbacks;
        match &settled {
            Some(Settled::Success(data)) => {
                if let Some(f) = &on_success {
                    f(&**data);
                }
                if let Some(f) = &on_settled {
                    f(Some(&**data), None);
                }
            }
            Some(Settled::Error(error)) => {
                if let Some(f) = &on_error {
                    f(error);
                }
                if let Some(f) = &on_settled {
                    f(None, Some(error));
                }
            }
            None => {}
        }

        if let Some((listener, result)) = delivery {
            listener(result);
        }
        if let Some(entry) = refetch {
            spawn_fetch(entry);
        }
    }

    fn on_focus(&self) {
        self.refetch_on_event(|options| &options.refetch_on_window_focus);
    }

    fn on_online(&self) {
        self.refetch_on_event(|options| &options.refetch_on_reconnect);
    }
}

/// Queue a fetch as a new top-level task.
fn spawn_fetch<T>(entry: Arc<PayloadEntry<T>>)
where
    T: Send + Sync + 'static,
{
    tokio::spawn(async move {
        drop(entry.fetch(false));
    });
}
