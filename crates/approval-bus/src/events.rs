//! # Bus Messages
//!
//! Envelope for channel messages routed by payload id, and frame decoding.

use payload_core::ChannelMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::BusError;

/// A channel message addressed to one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Unique id of this delivery.
    pub id: Uuid,
    /// Payload the message belongs to.
    pub payload_uuid: String,
    /// The message itself.
    pub message: ChannelMessage,
}

impl BusMessage {
    /// Wrap `message` for `payload_uuid`.
    pub fn new(payload_uuid: impl Into<String>, message: ChannelMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload_uuid: payload_uuid.into(),
            message,
        }
    }
}

/// Which payloads a subscription receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Payload ids to accept. Empty accepts everything.
    pub payload_uuids: Vec<String>,
}

impl MessageFilter {
    /// Accept every payload.
    pub fn all() -> Self {
        Self::default()
    }

    /// Accept one payload.
    pub fn payload(payload_uuid: impl Into<String>) -> Self {
        Self {
            payload_uuids: vec![payload_uuid.into()],
        }
    }

    /// Whether `message` passes.
    pub fn matches(&self, message: &BusMessage) -> bool {
        self.payload_uuids.is_empty() || self.payload_uuids.contains(&message.payload_uuid)
    }

    pub(crate) fn topic_key(&self) -> String {
        if self.payload_uuids.is_empty() {
            "*".to_string()
        } else {
            self.payload_uuids.join(",")
        }
    }
}

/// Decode one JSON frame into a channel message.
///
/// The frame must be a JSON object; unknown fields are carried along and
/// otherwise ignored.
pub fn decode_frame(frame: &str) -> Result<ChannelMessage, BusError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| BusError::Decode(e.to_string()))?;
    if !value.is_object() {
        return Err(BusError::Decode(format!(
            "expected a JSON object, got {}",
            kind(&value)
        )));
    }
    serde_json::from_value(value).map_err(|e| BusError::Decode(e.to_string()))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
