//! # Approval Publisher
//!
//! Publishing side of the bus.

use async_trait::async_trait;
use parking_lot::RwLock;
use payload_core::ChannelMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::channel::BusChannel;
use crate::events::{decode_frame, BusMessage, MessageFilter};
use crate::subscriber::BusSubscription;
use crate::{BusError, DEFAULT_CHANNEL_CAPACITY};

/// Publishes approval messages.
#[async_trait]
pub trait ApprovalPublisher: Send + Sync {
    /// Publish `message` for `payload_uuid`. Returns how many subscribers
    /// received it.
    async fn publish(&self, payload_uuid: &str, message: ChannelMessage) -> usize;

    /// Total messages published, delivered or not.
    fn messages_published(&self) -> u64;
}

/// In-memory bus over `tokio::sync::broadcast`.
pub struct ApprovalBus {
    sender: broadcast::Sender<BusMessage>,
    /// Live subscriptions per filter key.
    subscriptions: Arc<RwLock<HashMap<String, usize>>>,
    messages_published: AtomicU64,
    capacity: usize,
}

impl ApprovalBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus buffering `capacity` messages per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            messages_published: AtomicU64::new(0),
            capacity,
        }
    }

    /// Subscribe to messages passing `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: MessageFilter) -> BusSubscription {
        let receiver = self.sender.subscribe();
        let topic_key = filter.topic_key();
        *self
            .subscriptions
            .write()
            .entry(topic_key.clone())
            .or_insert(0) += 1;
        debug!(topic = %topic_key, "Approval subscription created");
        BusSubscription::new(receiver, filter, Arc::clone(&self.subscriptions), topic_key)
    }

    /// An [`EventChannel`](payload_core::EventChannel) delivering the
    /// messages of one payload.
    #[must_use]
    pub fn channel_for(&self, payload_uuid: impl Into<String>) -> BusChannel {
        let payload_uuid = payload_uuid.into();
        let subscription = self.subscribe(MessageFilter::payload(payload_uuid.clone()));
        BusChannel::new(payload_uuid, subscription)
    }

    /// Publish an already wrapped message.
    pub fn send(&self, message: BusMessage) -> usize {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        let payload_uuid = message.payload_uuid.clone();
        match self.sender.send(message) {
            Ok(receivers) => {
                debug!(payload_uuid = %payload_uuid, receivers, "Approval message published");
                receivers
            }
            Err(_) => {
                warn!(payload_uuid = %payload_uuid, "Approval message dropped (no receivers)");
                0
            }
        }
    }

    /// Decode a raw JSON frame and publish it.
    pub fn publish_frame(&self, payload_uuid: &str, frame: &str) -> Result<usize, BusError> {
        let message = decode_frame(frame)?;
        Ok(self.send(BusMessage::new(payload_uuid, message)))
    }

    /// Live receivers on the underlying channel.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Live subscriptions listening for exactly `payload_uuid`.
    #[must_use]
    pub fn subscriptions_for(&self, payload_uuid: &str) -> usize {
        self.subscriptions
            .read()
            .get(payload_uuid)
            .copied()
            .unwrap_or(0)
    }

    /// Per-subscriber buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ApprovalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalPublisher for ApprovalBus {
    async fn publish(&self, payload_uuid: &str, message: ChannelMessage) -> usize {
        self.send(BusMessage::new(payload_uuid, message))
    }

    fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }
}
