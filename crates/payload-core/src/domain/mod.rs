//! # Domain Module
//!
//! Core types for the payload cache: keys, entry state, retry policy,
//! the approval sub-state machine, and the error taxonomy.

pub mod approval;
pub mod errors;
pub mod key;
pub mod retry;
pub mod state;

pub use approval::*;
pub use errors::*;
pub use key::*;
pub use retry::*;
pub use state::*;
