//! # Ports
//!
//! Outbound traits the cache depends on.

pub mod outbound;

pub use outbound::{
    fetch_fn, from_fetcher, sleep, ChannelErrorHandler, EventChannel, FetchContext, FetchFn,
    Fetcher, MessageHandler, MockChannelRemote, MockEventChannel, Scheduler, TimerHandle,
    TimerTask,
};
