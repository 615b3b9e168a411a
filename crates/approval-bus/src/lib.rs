//! # Approval Bus
//!
//! In-process hub for approval-flow push messages. A transport task (a
//! websocket reader, a long-poll loop) publishes decoded frames here; each
//! payload entry listens through a [`BusChannel`] filtered to its payload id.
//!
//! ```text
//! ┌─────────────┐  publish()   ┌──────────────┐  channel_for(uuid)  ┌──────────────┐
//! │  transport  │ ───────────▶ │ ApprovalBus  │ ──────────────────▶ │ PayloadEntry │
//! └─────────────┘              └──────────────┘     BusChannel      └──────────────┘
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod channel;
pub mod events;
pub mod publisher;
pub mod subscriber;

pub use channel::BusChannel;
pub use events::{decode_frame, BusMessage, MessageFilter};
pub use publisher::{ApprovalBus, ApprovalPublisher};
pub use subscriber::{BusSubscription, MessageStream};

use thiserror::Error;

/// Messages buffered per subscriber before the slowest one lags.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Bus errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus was dropped.
    #[error("Approval bus closed")]
    Closed,

    /// A frame was not a valid channel message.
    #[error("Undecodable frame: {0}")]
    Decode(String),
}
