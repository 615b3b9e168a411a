//! # Domain Errors
//!
//! Error taxonomy for payload entries, observers, and the approval flow.

use std::sync::Arc;
use thiserror::Error;

/// Payload error types.
///
/// Cloneable so a single failure can fan out to every waiter of a
/// deduplicated fetch and to every subscribed observer.
#[derive(Debug, Clone, Error)]
pub enum PayloadError {
    /// The fetch function failed.
    #[error("Fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),

    /// The fetch was superseded or aborted. Never stored in entry state.
    #[error("Fetch cancelled")]
    Cancelled,

    /// The remote actor explicitly rejected the approval request.
    #[error("Approval rejected by remote actor (payload {payload_uuid:?})")]
    ChannelRejected {
        /// Payload identifier reported by the channel, if any
        payload_uuid: Option<String>,
    },

    /// The time-boxed approval request expired without resolution.
    #[error("Approval request expired (payload {payload_uuid:?})")]
    Expired {
        /// Payload identifier reported by the channel, if any
        payload_uuid: Option<String>,
    },

    /// Invalid option combination, raised synchronously at construction.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The cached entry for this hash holds a different data type.
    #[error("Entry {hash} holds a different payload type")]
    TypeMismatch {
        /// Canonical hash of the key
        hash: String,
    },

    /// The event channel failed outside of the approval state machine.
    #[error("Event channel error: {0}")]
    Channel(String),
}

impl PayloadError {
    /// Wrap a fetch function failure.
    pub fn fetch(err: anyhow::Error) -> Self {
        Self::Fetch(Arc::new(err))
    }

    /// Build a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Only fetch failures go through the retry policy.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }

    /// Cancellation is swallowed at the entry level.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Terminal approval-flow outcomes.
    pub fn is_approval_terminal(&self) -> bool {
        matches!(self, Self::ChannelRejected { .. } | Self::Expired { .. })
    }
}

impl PartialEq for PayloadError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Fetch(a), Self::Fetch(b)) => Arc::ptr_eq(a, b),
            (Self::Cancelled, Self::Cancelled) => true,
            (
                Self::ChannelRejected { payload_uuid: a },
                Self::ChannelRejected { payload_uuid: b },
            ) => a == b,
            (Self::Expired { payload_uuid: a }, Self::Expired { payload_uuid: b }) => a == b,
            (Self::Configuration(a), Self::Configuration(b)) => a == b,
            (Self::TypeMismatch { hash: a }, Self::TypeMismatch { hash: b }) => a == b,
            (Self::Channel(a), Self::Channel(b)) => a == b,
            _ => false,
        }
    }
}

/// Result alias used across the crate.
pub type PayloadResult<T> = Result<T, PayloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = PayloadError::fetch(anyhow::anyhow!("connection reset"));
        assert!(err.to_string().contains("connection reset"));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_only_fetch_is_retriable() {
        assert!(!PayloadError::Cancelled.is_retriable());
        assert!(!PayloadError::Expired { payload_uuid: None }.is_retriable());
        assert!(!PayloadError::configuration("x").is_retriable());
    }

    #[test]
    fn test_fetch_errors_compare_by_identity() {
        let a = PayloadError::fetch(anyhow::anyhow!("boom"));
        let b = PayloadError::fetch(anyhow::anyhow!("boom"));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_approval_terminal() {
        let rejected = PayloadError::ChannelRejected {
            payload_uuid: Some("abc".to_string()),
        };
        assert!(rejected.is_approval_terminal());
        assert!(rejected.to_string().contains("abc"));
        assert!(!PayloadError::Cancelled.is_approval_terminal());
    }
}
