//! Prometheus metrics for the payload cache.
//!
//! All metrics follow the naming convention: `pc_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., fetches_started_total)
//! - **Gauge**: Value that can go up or down (e.g., cache_entries)
//! - **Histogram**: Distribution of values (e.g., fetch_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // FETCH LIFECYCLE
    // =========================================================================

    /// Underlying fetch function invocations (attempts, including retries)
    pub static ref FETCHES_STARTED: Counter = Counter::new(
        "pc_fetches_started_total",
        "Total number of fetch function invocations"
    ).expect("metric creation failed");

    /// Failed fetch attempts
    pub static ref FETCH_FAILURES: Counter = Counter::new(
        "pc_fetch_failures_total",
        "Total number of failed fetch attempts"
    ).expect("metric creation failed");

    /// Retries scheduled by the retry policy
    pub static ref FETCH_RETRIES: Counter = Counter::new(
        "pc_fetch_retries_total",
        "Total number of retries scheduled"
    ).expect("metric creation failed");

    /// Fetch duration histogram
    pub static ref FETCH_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "pc_fetch_duration_seconds",
            "Time spent inside the fetch function"
        ).buckets(exponential_buckets(0.001, 2.0, 15).unwrap())
    ).expect("metric creation failed");

    // =========================================================================
    // CACHE
    // =========================================================================

    /// Live entries in the cache
    pub static ref CACHE_ENTRIES: Gauge = Gauge::new(
        "pc_cache_entries",
        "Number of entries currently held by the cache"
    ).expect("metric creation failed");

    /// Entries evicted by garbage collection or removal
    pub static ref ENTRIES_EVICTED: Counter = Counter::new(
        "pc_entries_evicted_total",
        "Total number of entries evicted from the cache"
    ).expect("metric creation failed");

    // =========================================================================
    // APPROVAL FLOW
    // =========================================================================

    /// Approval-flow transitions by target status
    pub static ref APPROVAL_TRANSITIONS: CounterVec = CounterVec::new(
        Opts::new("pc_approval_transitions_total", "Total approval-flow transitions"),
        &["status"]  // scanned / signed / rejected / expired
    ).expect("metric creation failed");
}

/// Handle proving the metrics were registered.
#[derive(Debug, Clone, Copy)]
pub struct MetricsHandle {
    registered: usize,
}

impl MetricsHandle {
    /// Number of collectors registered by this call.
    pub fn registered(&self) -> usize {
        self.registered
    }
}

/// Register all metrics with the global registry.
///
/// Collectors already registered by an earlier call are skipped.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(FETCHES_STARTED.clone()),
        Box::new(FETCH_FAILURES.clone()),
        Box::new(FETCH_RETRIES.clone()),
        Box::new(FETCH_DURATION.clone()),
        Box::new(CACHE_ENTRIES.clone()),
        Box::new(ENTRIES_EVICTED.clone()),
        Box::new(APPROVAL_TRANSITIONS.clone()),
    ];

    let mut registered = 0;
    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) => registered += 1,
            Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle { registered })
}

/// Encode all metrics as Prometheus text format.
pub fn gather_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}
