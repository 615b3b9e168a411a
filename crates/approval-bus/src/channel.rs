//! # Bus Channel
//!
//! [`EventChannel`] adapter over a bus subscription. Messages are forwarded
//! to the handler from a spawned task; `close` stops forwarding and drops
//! the subscription. If the bus goes away first, the error handler is told.

use payload_core::{ChannelErrorHandler, EventChannel, MessageHandler, PayloadError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::subscriber::BusSubscription;

/// Approval channel for one payload.
pub struct BusChannel {
    payload_uuid: String,
    subscription: Option<BusSubscription>,
    forwarder: Option<JoinHandle<()>>,
    error_handler: Option<ChannelErrorHandler>,
    closed: Arc<AtomicBool>,
}

impl BusChannel {
    pub(crate) fn new(payload_uuid: String, subscription: BusSubscription) -> Self {
        Self {
            payload_uuid,
            subscription: Some(subscription),
            forwarder: None,
            error_handler: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Payload this channel listens for.
    pub fn payload_uuid(&self) -> &str {
        &self.payload_uuid
    }
}

impl EventChannel for BusChannel {
    /// Start forwarding. Must be called inside a Tokio runtime. A channel
    /// forwards to a single handler; later calls are ignored.
    fn on_message(&mut self, handler: MessageHandler) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(mut subscription) = self.subscription.take() else {
            debug!(payload_uuid = %self.payload_uuid, "Channel already forwarding");
            return;
        };

        let closed = Arc::clone(&self.closed);
        let payload_uuid = self.payload_uuid.clone();
        let on_error = self.error_handler.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                handler(delivery.message);
            }
            drop(subscription);
            if closed.swap(true, Ordering::AcqRel) {
                debug!(payload_uuid = %payload_uuid, "Approval forwarding stopped");
                return;
            }
            warn!(payload_uuid = %payload_uuid, "Approval bus closed under an open channel");
            if let Some(on_error) = on_error {
                on_error(PayloadError::Channel(format!(
                    "approval bus closed before payload {payload_uuid} settled"
                )));
            }
        }));
    }

    fn on_error(&mut self, handler: ChannelErrorHandler) {
        self.error_handler = Some(handler);
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscription = None;
        self.error_handler = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        debug!(payload_uuid = %self.payload_uuid, "Approval channel closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for BusChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{ApprovalBus, ApprovalPublisher};
    use payload_core::ChannelMessage;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_forwards_only_own_payload() {
        let bus = ApprovalBus::new();
        let mut channel = bus.channel_for("abc");
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        channel.on_message(Arc::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish("abc", ChannelMessage::opened()).await;
        bus.publish("other", ChannelMessage::opened()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_releases_subscription() {
        let bus = ApprovalBus::new();
        let mut channel = bus.channel_for("abc");
        channel.on_message(Arc::new(|_| {}));
        assert_eq!(bus.subscriptions_for("abc"), 1);

        channel.close();
        channel.close();
        assert!(channel.is_closed());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.subscriptions_for("abc"), 0);
    }

    #[tokio::test]
    async fn test_bus_drop_reports_channel_error() {
        let bus = ApprovalBus::new();
        let mut channel = bus.channel_for("abc");
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        channel.on_error(Arc::new(move |err| {
            assert!(matches!(err, PayloadError::Channel(_)));
            e.fetch_add(1, Ordering::SeqCst);
        }));
        channel.on_message(Arc::new(|_| {}));

        drop(bus);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_close_suppresses_error_report() {
        let bus = ApprovalBus::new();
        let mut channel = bus.channel_for("abc");
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        channel.on_error(Arc::new(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        }));
        channel.on_message(Arc::new(|_| {}));

        channel.close();
        drop(bus);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_without_handler_releases_subscription() {
        let bus = ApprovalBus::new();
        let channel = bus.channel_for("abc");
        assert_eq!(bus.subscriptions_for("abc"), 1);
        drop(channel);
        assert_eq!(bus.subscriptions_for("abc"), 0);
    }
}
