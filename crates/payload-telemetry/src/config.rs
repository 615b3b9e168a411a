//! Telemetry configuration from environment variables.

use std::env;

const DEFAULT_SERVICE_NAME: &str = "payload-cache";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration for logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line.
    pub service_name: String,

    /// Level (`debug`) or full `EnvFilter` directive (`payload_core=trace,info`).
    pub log_level: String,

    /// Install a log layer at all. Off leaves logging to the host application.
    pub console_output: bool,

    /// One JSON object per line instead of pretty output.
    pub json_logs: bool,

    /// Register the `pc_*` Prometheus metrics.
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            console_output: true,
            json_logs: false,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Read the process environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PC_SERVICE_NAME` | `payload-cache` |
    /// | `PC_LOG_LEVEL`, then `RUST_LOG` | `info` |
    /// | `PC_CONSOLE_OUTPUT` | `true` |
    /// | `PC_JSON_LOGS` | `false` |
    /// | `PC_METRICS` | `true` |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            service_name: lookup("PC_SERVICE_NAME")
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.service_name),
            log_level: lookup("PC_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .filter(|level| !level.trim().is_empty())
                .unwrap_or(defaults.log_level),
            console_output: flag(lookup("PC_CONSOLE_OUTPUT"), defaults.console_output),
            json_logs: flag(lookup("PC_JSON_LOGS"), defaults.json_logs),
            metrics_enabled: flag(lookup("PC_METRICS"), defaults.metrics_enabled),
        }
    }

    /// Verbose, human readable, written through the test writer.
    pub fn for_testing() -> Self {
        Self {
            service_name: "payload-cache-test".to_string(),
            log_level: "debug".to_string(),
            ..Self::default()
        }
    }
}

/// `1/true/yes/on` and `0/false/no/off`, case-insensitive. Anything else
/// keeps the default.
fn flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim).map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
