//! # Approval Subscriber
//!
//! Receiving side of the bus. Dropping a subscription releases its count.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::events::{BusMessage, MessageFilter};
use crate::BusError;

/// Decrements the per-filter count when dropped.
struct SubscriptionGuard {
    subscriptions: Arc<RwLock<HashMap<String, usize>>>,
    topic_key: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut subs = self.subscriptions.write();
        if let Some(count) = subs.get_mut(&self.topic_key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                subs.remove(&self.topic_key);
            }
        }
        debug!(topic = %self.topic_key, "Approval subscription dropped");
    }
}

/// Handle receiving the messages that pass its filter.
pub struct BusSubscription {
    receiver: broadcast::Receiver<BusMessage>,
    filter: MessageFilter,
    guard: SubscriptionGuard,
}

impl BusSubscription {
    pub(crate) fn new(
        receiver: broadcast::Receiver<BusMessage>,
        filter: MessageFilter,
        subscriptions: Arc<RwLock<HashMap<String, usize>>>,
        topic_key: String,
    ) -> Self {
        Self {
            receiver,
            filter,
            guard: SubscriptionGuard {
                subscriptions,
                topic_key,
            },
        }
    }

    /// Next matching message, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if self.filter.matches(&message) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(lagged = count, "Approval subscriber lagged, messages dropped");
                }
            }
        }
    }

    /// Next matching message if one is buffered.
    pub fn try_recv(&mut self) -> Result<Option<BusMessage>, BusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) if self.filter.matches(&message) => return Ok(Some(message)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(lagged = count, "Approval subscriber lagged, messages dropped");
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// The filter.
    #[must_use]
    pub fn filter(&self) -> &MessageFilter {
        &self.filter
    }

    /// Convert into a [`Stream`].
    #[must_use]
    pub fn into_stream(self) -> MessageStream {
        let BusSubscription {
            receiver,
            filter,
            guard,
        } = self;
        MessageStream {
            inner: BroadcastStream::new(receiver),
            filter,
            _guard: guard,
        }
    }
}

/// Stream of matching messages. Lagged gaps are skipped.
pub struct MessageStream {
    inner: BroadcastStream<BusMessage>,
    filter: MessageFilter,
    _guard: SubscriptionGuard,
}

impl Stream for MessageStream {
    type Item = BusMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) if this.filter.matches(&message) => {
                    return Poll::Ready(Some(message))
                }
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
                    warn!(lagged = count, "Approval stream lagged, messages dropped");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
