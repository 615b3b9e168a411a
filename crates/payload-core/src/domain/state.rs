//! # Payload State
//!
//! The state record owned by one payload entry.
//!
//! ## State Machine
//!
//! ```text
//! [Idle] ──fetch──→ [Fetching] ──success──→ [Success]
//!                       │  ▲                   │
//!                       │  └──────refetch──────┤
//!                       └──error──→ [Error] ───┘
//! ```
//!
//! `invalidate` only flips `is_invalidated`; it never changes `status`.

use std::sync::Arc;
use tokio::time::Instant;

use super::approval::ApprovalSnapshot;
use super::errors::{PayloadError, PayloadResult};

/// Lifecycle status of a payload entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FetchStatus {
    /// Never fetched.
    #[default]
    Idle,
    /// A fetch (or retry loop) is in flight.
    Fetching,
    /// Last fetch succeeded.
    Success,
    /// Last fetch failed after exhausting retries.
    Error,
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStatus::Idle => write!(f, "idle"),
            FetchStatus::Fetching => write!(f, "fetching"),
            FetchStatus::Success => write!(f, "success"),
            FetchStatus::Error => write!(f, "error"),
        }
    }
}

/// State of one payload entry.
#[derive(Debug)]
pub struct PayloadState<T> {
    /// Last successfully fetched (or manually set) data.
    pub data: Option<Arc<T>>,
    /// Number of times `data` was replaced.
    pub data_update_count: u32,
    /// When `data` was last replaced.
    pub data_updated_at: Option<Instant>,
    /// Error of the last settled fetch, if it failed.
    pub error: Option<PayloadError>,
    /// Number of times `error` was replaced.
    pub error_update_count: u32,
    /// When `error` was last replaced.
    pub error_updated_at: Option<Instant>,
    /// Consecutive failed attempts; reset on success.
    pub failure_count: u32,
    /// Error of the most recent failed attempt.
    pub failure_reason: Option<PayloadError>,
    /// Lifecycle status.
    pub status: FetchStatus,
    /// Marked stale regardless of age.
    pub is_invalidated: bool,
    /// The in-flight fetch is waiting for connectivity.
    pub is_paused: bool,
    /// Approval-flow sub-state, if this entry tracks a remote approval.
    pub approval: Option<ApprovalSnapshot>,
}

impl<T> Clone for PayloadState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            data_update_count: self.data_update_count,
            data_updated_at: self.data_updated_at,
            error: self.error.clone(),
            error_update_count: self.error_update_count,
            error_updated_at: self.error_updated_at,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            status: self.status,
            is_invalidated: self.is_invalidated,
            is_paused: self.is_paused,
            approval: self.approval.clone(),
        }
    }
}

impl<T> Default for PayloadState<T> {
    fn default() -> Self {
        Self {
            data: None,
            data_update_count: 0,
            data_updated_at: None,
            error: None,
            error_update_count: 0,
            error_updated_at: None,
            failure_count: 0,
            failure_reason: None,
            status: FetchStatus::Idle,
            is_invalidated: false,
            is_paused: false,
            approval: None,
        }
    }
}

impl<T> PayloadState<T> {
    /// State seeded with initial data, as if a fetch had succeeded at `updated_at`.
    pub fn with_data(data: Arc<T>, updated_at: Instant) -> Self {
        Self {
            data: Some(data),
            data_updated_at: Some(updated_at),
            status: FetchStatus::Success,
            ..Self::default()
        }
    }

    /// Check the status/data/error invariant.
    ///
    /// `Success` requires data and no error; `Error` requires an error.
    pub fn check_invariant(&self) -> PayloadResult<()> {
        match self.status {
            FetchStatus::Success if self.data.is_none() => Err(PayloadError::configuration(
                "success state must carry data",
            )),
            FetchStatus::Success if self.error.is_some() => Err(PayloadError::configuration(
                "success state must not carry an error",
            )),
            FetchStatus::Error if self.error.is_none() => Err(PayloadError::configuration(
                "error state must carry an error",
            )),
            _ => Ok(()),
        }
    }

    /// True while a fetch is running.
    pub fn is_fetching(&self) -> bool {
        self.status == FetchStatus::Fetching
    }

    /// Stale by age: no data, invalidated, or older than `stale_time`.
    ///
    /// `None` means the data never goes stale by age.
    pub fn is_stale_at(&self, now: Instant, stale_time: Option<std::time::Duration>) -> bool {
        let Some(updated_at) = self.data_updated_at else {
            return true;
        };
        if self.data.is_none() || self.is_invalidated {
            return true;
        }
        match stale_time {
            None => false,
            Some(stale_time) => now.saturating_duration_since(updated_at) >= stale_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_is_idle() {
        let state: PayloadState<u32> = PayloadState::default();
        assert_eq!(state.status, FetchStatus::Idle);
        assert_eq!(state.failure_count, 0);
        assert!(state.check_invariant().is_ok());
    }

    #[test]
    fn test_success_without_data_violates_invariant() {
        let state: PayloadState<u32> = PayloadState {
            status: FetchStatus::Success,
            ..PayloadState::default()
        };
        assert!(state.check_invariant().is_err());
    }

    #[test]
    fn test_error_without_error_violates_invariant() {
        let state: PayloadState<u32> = PayloadState {
            status: FetchStatus::Error,
            ..PayloadState::default()
        };
        assert!(state.check_invariant().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_stale_time_is_immediately_stale() {
        let now = Instant::now();
        let state = PayloadState::with_data(Arc::new(1u32), now);
        assert!(state.is_stale_at(now, Some(Duration::ZERO)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_stale_time_never_stale() {
        let now = Instant::now();
        let state = PayloadState::with_data(Arc::new(1u32), now);
        assert!(!state.is_stale_at(now + Duration::from_secs(86_400 * 365), None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_after_window() {
        let now = Instant::now();
        let state = PayloadState::with_data(Arc::new(1u32), now);
        let window = Some(Duration::from_secs(10));
        assert!(!state.is_stale_at(now + Duration::from_secs(9), window));
        assert!(state.is_stale_at(now + Duration::from_secs(10), window));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_is_stale() {
        let now = Instant::now();
        let mut state = PayloadState::with_data(Arc::new(1u32), now);
        state.is_invalidated = true;
        assert!(state.is_stale_at(now, None));
    }
}
