//! # Application Layer
//!
//! Entries, the cache that owns them, observers, and the client facade.

pub mod cache;
pub mod client;
pub mod entry;
pub mod observer;

pub use cache::{CacheHooks, PayloadCache};
pub use client::PayloadClient;
pub use entry::{CachedEntry, EntryAction, EntryEvent, EntryObserver, FetchFuture, PayloadEntry};
pub use observer::{Listener, ObserverResult, PayloadObserver, TrackedResult};
