//! # Approval Flow
//!
//! Sub-state machine for a payload that waits on a remote actor.
//!
//! ```text
//! [Created] ──opened──→ [Scanned] ──signed:true──→ [Signed]
//!     │                     │
//!     ├──signed:false───────┴──────────────────→ [Rejected]
//!     └──expired / countdown reached 0 ─────────→ [Expired]
//! ```
//!
//! `Signed`, `Rejected` and `Expired` are terminal: every later message is
//! ignored. The transport is not known here; see the `EventChannel` port.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::errors::PayloadError;

/// Status of the remote approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for the remote actor to open the request.
    Created,
    /// The remote actor opened the request.
    Scanned,
    /// Approved. Terminal.
    Signed,
    /// Rejected. Terminal.
    Rejected,
    /// Timed out. Terminal.
    Expired,
}

impl ApprovalStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Signed | Self::Rejected | Self::Expired)
    }

    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Scanned => "scanned",
            Self::Signed => "signed",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

/// Push message received on the approval channel.
///
/// Unrecognized fields are kept in `extra` and otherwise ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// The remote actor opened the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened: Option<bool>,
    /// `true` approves, `false` rejects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed: Option<bool>,
    /// Remaining lifetime announced by the remote side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_seconds: Option<i64>,
    /// Explicit timeout notice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired: Option<bool>,
    /// Payload identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_uuidv4: Option<String>,
    /// Identifier of the remote call that resolved the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_call_uuidv4: Option<String>,
    /// Everything else.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChannelMessage {
    /// `{opened: true}`
    pub fn opened() -> Self {
        Self {
            opened: Some(true),
            ..Self::default()
        }
    }

    /// `{signed: true, payload_uuidv4}`
    pub fn signed(payload_uuid: impl Into<String>) -> Self {
        Self {
            signed: Some(true),
            payload_uuidv4: Some(payload_uuid.into()),
            ..Self::default()
        }
    }

    /// `{signed: false}`
    pub fn rejected() -> Self {
        Self {
            signed: Some(false),
            ..Self::default()
        }
    }

    /// `{expires_in_seconds}`
    pub fn expires_in(seconds: i64) -> Self {
        Self {
            expires_in_seconds: Some(seconds),
            ..Self::default()
        }
    }

    /// `{expired: true}`
    pub fn expired() -> Self {
        Self {
            expired: Some(true),
            ..Self::default()
        }
    }

    /// The single semantic signal this message carries.
    ///
    /// Precedence when several fields are present: `signed`, `expired`,
    /// `opened`, `expires_in_seconds`.
    pub fn signal(&self) -> Option<ApprovalSignal> {
        if let Some(signed) = self.signed {
            return Some(if signed {
                ApprovalSignal::Signed
            } else {
                ApprovalSignal::Rejected
            });
        }
        if self.expired == Some(true) {
            return Some(ApprovalSignal::Expired);
        }
        if self.opened == Some(true) {
            return Some(ApprovalSignal::Opened);
        }
        self.expires_in_seconds.map(|secs| {
            if secs <= 0 {
                ApprovalSignal::Expired
            } else {
                ApprovalSignal::Countdown(Duration::from_secs(secs.unsigned_abs()))
            }
        })
    }
}

/// Semantic content of a channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalSignal {
    /// Request opened by the remote actor.
    Opened,
    /// Approved.
    Signed,
    /// Rejected.
    Rejected,
    /// Remaining lifetime update.
    Countdown(Duration),
    /// Timed out.
    Expired,
}

/// Outcome of applying a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalTransition {
    /// Message carried nothing actionable, or the flow is already terminal.
    Ignored,
    /// Status changed.
    Moved {
        /// Previous status
        from: ApprovalStatus,
        /// New status
        to: ApprovalStatus,
    },
    /// Status unchanged, remaining lifetime updated.
    Countdown(Duration),
}

impl ApprovalTransition {
    /// True if the flow just entered a terminal status.
    pub fn entered_terminal(&self) -> bool {
        matches!(self, Self::Moved { to, .. } if to.is_terminal())
    }
}

/// Cloneable view of the approval flow, folded into entry state.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalSnapshot {
    /// Current status.
    pub status: ApprovalStatus,
    /// Payload identifier.
    pub payload_uuid: Option<String>,
    /// Identifier of the resolving remote call.
    pub reference_call_uuid: Option<String>,
    /// Remaining lifetime as last announced.
    pub expires_in: Option<Duration>,
    /// Raw message that resolved the flow as `Signed`.
    pub response: Option<Value>,
}

impl ApprovalSnapshot {
    /// Terminal error to surface for `Rejected` / `Expired`.
    pub fn terminal_error(&self) -> Option<PayloadError> {
        match self.status {
            ApprovalStatus::Rejected => Some(PayloadError::ChannelRejected {
                payload_uuid: self.payload_uuid.clone(),
            }),
            ApprovalStatus::Expired => Some(PayloadError::Expired {
                payload_uuid: self.payload_uuid.clone(),
            }),
            _ => None,
        }
    }
}

/// The approval state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalFlow {
    snapshot: ApprovalSnapshot,
}

impl ApprovalFlow {
    /// New flow in `Created`.
    pub fn new(payload_uuid: Option<String>, expires_in: Option<Duration>) -> Self {
        Self {
            snapshot: ApprovalSnapshot {
                status: ApprovalStatus::Created,
                payload_uuid,
                reference_call_uuid: None,
                expires_in,
                response: None,
            },
        }
    }

    /// Current status.
    pub fn status(&self) -> ApprovalStatus {
        self.snapshot.status
    }

    /// Cloneable view.
    pub fn snapshot(&self) -> &ApprovalSnapshot {
        &self.snapshot
    }

    /// Apply a channel message.
    pub fn apply(&mut self, message: &ChannelMessage) -> ApprovalTransition {
        let from = self.snapshot.status;
        if from.is_terminal() {
            return ApprovalTransition::Ignored;
        }
        let Some(signal) = message.signal() else {
            return ApprovalTransition::Ignored;
        };

        if message.payload_uuidv4.is_some() && self.snapshot.payload_uuid.is_none() {
            self.snapshot.payload_uuid = message.payload_uuidv4.clone();
        }

        let to = match signal {
            ApprovalSignal::Opened if from == ApprovalStatus::Created => ApprovalStatus::Scanned,
            ApprovalSignal::Opened => return ApprovalTransition::Ignored,
            ApprovalSignal::Signed => {
                self.snapshot.reference_call_uuid = message.reference_call_uuidv4.clone();
                self.snapshot.response = serde_json::to_value(message).ok();
                ApprovalStatus::Signed
            }
            ApprovalSignal::Rejected => ApprovalStatus::Rejected,
            ApprovalSignal::Expired => ApprovalStatus::Expired,
            ApprovalSignal::Countdown(remaining) => {
                self.snapshot.expires_in = Some(remaining);
                return ApprovalTransition::Countdown(remaining);
            }
        };

        self.snapshot.status = to;
        if to == ApprovalStatus::Expired {
            self.snapshot.expires_in = Some(Duration::ZERO);
        }
        ApprovalTransition::Moved { from, to }
    }

    /// Local countdown ran out.
    pub fn expire(&mut self) -> ApprovalTransition {
        self.apply(&ChannelMessage::expired())
    }
}
