//! # Outbound Ports
//!
//! Traits for the collaborators the cache drives but does not implement:
//! the fetch function, timers, and the approval push channel.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{ChannelMessage, PayloadError, PayloadKey};

// =============================================================================
// FETCH FUNCTION
// =============================================================================

/// Arguments handed to the fetch function.
#[derive(Debug, Clone)]
pub struct FetchContext {
    /// Key of the entry being fetched.
    pub key: PayloadKey,
    /// Signalled when the fetch is superseded or the entry is evicted.
    /// Honoring it is best-effort.
    pub cancellation: CancellationToken,
    /// Page cursor for paginated sources.
    pub page_param: Option<Value>,
}

/// Type-erased fetch function.
pub type FetchFn<T> = Arc<dyn Fn(FetchContext) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Box an async closure into a [`FetchFn`].
pub fn fetch_fn<T, F, Fut>(f: F) -> FetchFn<T>
where
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Object-style fetch source - outbound port.
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    /// Produce the payload for `ctx.key`.
    async fn fetch(&self, ctx: FetchContext) -> anyhow::Result<T>;
}

/// Adapt a [`Fetcher`] into a [`FetchFn`].
pub fn from_fetcher<T, F>(fetcher: Arc<F>) -> FetchFn<T>
where
    T: Send + 'static,
    F: Fetcher<T> + ?Sized + 'static,
{
    Arc::new(move |ctx| {
        let fetcher = Arc::clone(&fetcher);
        async move { fetcher.fetch(ctx).await }.boxed()
    })
}

// =============================================================================
// TIMERS
// =============================================================================

/// One-shot task run by a [`Scheduler`].
pub type TimerTask = Box<dyn FnOnce() + Send>;

/// Cancelable timer handle.
///
/// Dropping the handle cancels the timer; call [`TimerHandle::detach`] to let
/// it fire anyway.
#[must_use = "dropping a TimerHandle cancels the timer"]
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    /// Build a handle from its cancel action.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the timer. No-op if it already fired.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the timer armed without holding the handle.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Clock and timer capability - outbound port.
pub trait Scheduler: Send + Sync {
    /// Current time on this scheduler's clock.
    fn now(&self) -> Instant;

    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Wait `delay` on the scheduler's clock.
pub async fn sleep(scheduler: &dyn Scheduler, delay: Duration) {
    let (tx, rx) = oneshot::channel::<()>();
    let _handle = scheduler.schedule(
        delay,
        Box::new(move || {
            let _ = tx.send(());
        }),
    );
    let _ = rx.await;
}

// =============================================================================
// EVENT CHANNEL
// =============================================================================

/// Callback invoked for every message received on a channel.
pub type MessageHandler = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

/// Callback invoked once when the transport fails.
pub type ChannelErrorHandler = Arc<dyn Fn(PayloadError) + Send + Sync>;

/// Push channel carrying approval-flow messages - outbound port.
///
/// Adapters own the transport; the state machine only sees messages.
pub trait EventChannel: Send + Sync {
    /// Start delivering messages to `handler`.
    fn on_message(&mut self, handler: MessageHandler);

    /// Report a transport failure to `handler`. Register before
    /// [`on_message`](Self::on_message). No messages follow a failure.
    fn on_error(&mut self, handler: ChannelErrorHandler);

    /// Stop delivering messages. Must be idempotent and callable from inside
    /// the handler.
    fn close(&mut self);

    /// True once `close` was called or the transport ended.
    fn is_closed(&self) -> bool;
}

// =============================================================================
// Mock Implementations for Testing
// =============================================================================

#[derive(Default)]
struct MockChannelState {
    handler: Option<MessageHandler>,
    error_handler: Option<ChannelErrorHandler>,
    closed: bool,
    close_calls: usize,
}

/// In-process channel driven by [`MockChannelRemote::emit`].
#[derive(Default)]
pub struct MockEventChannel {
    state: Arc<Mutex<MockChannelState>>,
}

/// Remote end of a [`MockEventChannel`].
#[derive(Clone)]
pub struct MockChannelRemote {
    state: Arc<Mutex<MockChannelState>>,
}

impl MockEventChannel {
    /// Create a channel and its remote end.
    pub fn pair() -> (Self, MockChannelRemote) {
        let channel = Self::default();
        let remote = MockChannelRemote {
            state: Arc::clone(&channel.state),
        };
        (channel, remote)
    }
}

impl EventChannel for MockEventChannel {
    fn on_message(&mut self, handler: MessageHandler) {
        self.state.lock().handler = Some(handler);
    }

    fn on_error(&mut self, handler: ChannelErrorHandler) {
        self.state.lock().error_handler = Some(handler);
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.close_calls += 1;
        state.handler = None;
        state.error_handler = None;
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl MockChannelRemote {
    /// Deliver a message. Returns false if the channel is closed.
    pub fn emit(&self, message: ChannelMessage) -> bool {
        let handler = {
            let state = self.state.lock();
            if state.closed {
                return false;
            }
            state.handler.clone()
        };
        match handler {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }

    /// Break the transport with `reason`. Returns false if already closed.
    pub fn fail(&self, reason: &str) -> bool {
        let handler = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.handler = None;
            state.error_handler.take()
        };
        if let Some(handler) = handler {
            handler(PayloadError::Channel(reason.to_string()));
        }
        true
    }

    /// Whether the local side closed the channel.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// How many times `close` was called.
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}
