//! # Adapters
//!
//! Concrete scheduler and environment implementations.

pub mod environment;
pub mod scheduler;

pub use environment::Environment;
pub use scheduler::{ManualScheduler, TokioScheduler};
