//! # Payload Core
//!
//! Key-addressed cache of asynchronously produced payloads.
//!
//! **Architecture:** Hexagonal (domain / ports / adapters / application)
//!
//! ## Purpose
//!
//! Consumers ask for a payload by key. The cache deduplicates concurrent
//! fetches, retries failures with backoff, tracks staleness, evicts entries
//! nobody observes, and notifies each observer only about the properties it
//! reads. Entries can additionally follow an approval flow driven by pushed
//! channel messages (created, scanned, signed, rejected, expired).
//!
//! ## Module Structure
//!
//! ```text
//! payload-core/
//! ├── domain/       # PayloadKey, PayloadState, RetryPolicy, ApprovalFlow, errors
//! ├── ports/        # FetchFn, Scheduler, EventChannel
//! ├── adapters/     # TokioScheduler, ManualScheduler, Environment
//! ├── application/  # PayloadEntry, PayloadCache, PayloadObserver, PayloadClient
//! ├── options.rs    # PayloadOptions, ObserverOptions
//! └── config.rs     # CacheConfig
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use payload_core::{fetch_fn, payload_key, CacheConfig, PayloadClient, PayloadObserver};
//!
//! let client = PayloadClient::new(CacheConfig::default())?;
//! let options = client.observer_options(
//!     payload_key!["balance", "0xabc"],
//!     Some(fetch_fn(|_| async { Ok(42u64) })),
//! );
//! let observer = PayloadObserver::new(&client, options)?;
//! observer.subscribe(|result| {
//!     if let Ok(result) = result {
//!         println!("balance: {:?}", result.data());
//!     }
//! });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod options;
pub mod ports;

// Re-exports
pub use adapters::{Environment, ManualScheduler, TokioScheduler};
pub use application::{
    CacheHooks, CachedEntry, EntryAction, EntryEvent, EntryObserver, FetchFuture, Listener,
    ObserverResult, PayloadCache, PayloadClient, PayloadEntry, PayloadObserver, TrackedResult,
};
pub use config::CacheConfig;
pub use domain::{
    ApprovalFlow, ApprovalSignal, ApprovalSnapshot, ApprovalStatus, ApprovalTransition,
    ChannelMessage, FetchStatus, PayloadError, PayloadKey, PayloadResult, PayloadState,
    RetryDecision, RetryDelay, RetryPolicy,
};
pub use options::{
    ApprovalConfig, ErrorBoundary, NetworkMode, NotifyOnChangeProps, ObserverOptions,
    PayloadOptions, RefetchInterval, RefetchMode, RefetchOn, ResultProp,
};
pub use ports::{
    fetch_fn, from_fetcher, ChannelErrorHandler, EventChannel, FetchContext, FetchFn, Fetcher,
    MessageHandler, MockChannelRemote, MockEventChannel, Scheduler, TimerHandle,
};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
