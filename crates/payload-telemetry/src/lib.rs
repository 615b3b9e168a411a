//! # Payload Telemetry
//!
//! Logging and metrics plumbing for the payload cache.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use payload_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).expect("telemetry");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PC_SERVICE_NAME` | `payload-cache` | Service name in logs |
//! | `PC_LOG_LEVEL` | `info` | Log level filter |
//! | `PC_JSON_LOGS` | `false` | JSON log output |
//! | `PC_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `PC_METRICS` | `true` | Register Prometheus metrics |

#![warn(missing_docs)]

mod config;
mod logging;
pub mod metrics;
mod subscriber;

pub use config::TelemetryConfig;
pub use metrics::{
    gather_metrics, register_metrics, HistogramTimer, MetricsHandle, APPROVAL_TRANSITIONS,
    CACHE_ENTRIES, ENTRIES_EVICTED, FETCHES_STARTED, FETCH_DURATION, FETCH_FAILURES,
    FETCH_RETRIES,
};
pub use subscriber::{init_subscriber, init_test_subscriber, SubscriberGuard};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The global subscriber could not be installed.
    #[error("Failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    /// Prometheus registration or encoding failed.
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// Invalid configuration (for example an unparsable filter directive).
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that should be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics = if config.metrics_enabled {
        Some(register_metrics()?)
    } else {
        None
    };
    let subscriber = init_subscriber(&config)?;

    Ok(TelemetryGuard {
        _subscriber: subscriber,
        _metrics: metrics,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _subscriber: SubscriberGuard,
    _metrics: Option<MetricsHandle>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
