//! Prometheus metrics for the Dream-Stream engine.
//!
//! Metrics cover:
//! - Log store throughput (appends, reads, bytes) and corrupt frames
//! - Record cache hits and misses
//! - Open handle pool size and idle evictions
//! - Leader election, lease loss and rebalancing
//! - Storage fallbacks and remote retries
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "dream_stream"
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors are logged and an unregistered
//! metric is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for Dream-Stream metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("dream_stream".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================
//
//   define_gauge!(MY_GAUGE, "my_metric", "Description");
//   define_counter_vec!(MY_COUNTER, "my_metric", "Description", ["label1"]);
//   define_histogram_vec!(MY_HISTOGRAM, "my_metric", "Description", ["label"],
//       [0.001, 0.01, 0.1, 1.0]);

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Log store metrics
// =============================================================================

define_counter_vec!(
    RECORDS_APPENDED,
    "records_appended_total",
    "Total number of records appended",
    ["topic", "partition"]
);
define_counter_vec!(
    BYTES_APPENDED,
    "bytes_appended_total",
    "Total payload bytes appended",
    ["topic", "partition"]
);
define_counter_vec!(
    RECORDS_READ,
    "records_read_total",
    "Total number of records returned by reads",
    ["topic", "partition", "source"]
);
define_counter_vec!(
    BYTES_READ,
    "bytes_read_total",
    "Total framed bytes returned by reads",
    ["topic", "partition", "source"]
);
define_counter!(
    CORRUPT_FRAMES,
    "corrupt_frames_total",
    "Reads that stopped at an untrustworthy frame header"
);
define_counter!(
    APPEND_TRUNCATIONS,
    "append_truncations_total",
    "Failed appends rolled back to the previous end of log"
);
define_histogram_vec!(
    STORAGE_DURATION,
    "storage_operation_duration_seconds",
    "Storage operation duration in seconds",
    ["operation"],
    [
        0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0
    ]
);
define_counter_vec!(
    STORAGE_FALLBACKS,
    "storage_fallbacks_total",
    "Storage failures absorbed into an empty or zero result",
    ["operation"]
);

// =============================================================================
// Record cache metrics
// =============================================================================

define_counter_vec!(
    CACHE_OPERATIONS,
    "record_cache_operations_total",
    "Record cache lookups by result",
    ["result"]
);

// =============================================================================
// Handle pool metrics
// =============================================================================

define_gauge!(
    OPEN_HANDLES,
    "open_handles",
    "Number of open log, reader and offset file handles"
);
define_counter!(
    HANDLE_EVICTIONS,
    "handle_evictions_total",
    "Handles closed after being idle"
);

// =============================================================================
// Coordination metrics
// =============================================================================

define_counter_vec!(
    ELECTIONS,
    "elections_total",
    "Leader election attempts by result",
    ["result"]
);
define_gauge!(
    LEADER_TOPICS,
    "leader_topics",
    "Number of topics this broker currently leads"
);
define_counter_vec!(
    LEASE_LOSSES,
    "lease_losses_total",
    "Leadership leases lost and stepped down from",
    ["topic"]
);
define_counter_vec!(
    REBALANCES,
    "rebalances_total",
    "Rebalance passes by kind and outcome",
    ["kind", "outcome"]
);
define_counter_vec!(
    PARTITION_REASSIGNMENTS,
    "partition_reassignments_total",
    "Partition owner keys rewritten by the partition assigner",
    ["topic"]
);
define_counter_vec!(
    MEMBER_ASSIGNMENTS,
    "member_assignments_total",
    "Consumer member assignment keys rewritten",
    ["topic"]
);

// =============================================================================
// Retry metrics
// =============================================================================

define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

// =============================================================================
// Registration helpers
// =============================================================================

/// Register an IntGauge safely, returning a fallback on error.
fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning a fallback on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register an IntCounter safely, returning a fallback on error.
fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning a fallback on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric.
///
/// Idempotent. Metrics are otherwise registered lazily on first use.
pub fn init_metrics() {
    let _ = &*RECORDS_APPENDED;
    let _ = &*BYTES_APPENDED;
    let _ = &*RECORDS_READ;
    let _ = &*BYTES_READ;
    let _ = &*CORRUPT_FRAMES;
    let _ = &*APPEND_TRUNCATIONS;
    let _ = &*STORAGE_DURATION;
    let _ = &*STORAGE_FALLBACKS;
    let _ = &*CACHE_OPERATIONS;
    let _ = &*OPEN_HANDLES;
    let _ = &*HANDLE_EVICTIONS;
    let _ = &*ELECTIONS;
    let _ = &*LEADER_TOPICS;
    let _ = &*LEASE_LOSSES;
    let _ = &*REBALANCES;
    let _ = &*PARTITION_REASSIGNMENTS;
    let _ = &*MEMBER_ASSIGNMENTS;
    let _ = &*RETRY_ATTEMPTS;
}

/// Render all metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

pub fn record_append(topic: &str, partition: i32, bytes: u64) {
    let partition = partition.to_string();
    RECORDS_APPENDED
        .with_label_values(&[topic, &partition])
        .inc();
    BYTES_APPENDED
        .with_label_values(&[topic, &partition])
        .inc_by(bytes);
}

/// `source` is `cache` or `log`.
pub fn record_read(topic: &str, partition: i32, source: &str, records: u64, bytes: u64) {
    let partition = partition.to_string();
    RECORDS_READ
        .with_label_values(&[topic, &partition, source])
        .inc_by(records);
    BYTES_READ
        .with_label_values(&[topic, &partition, source])
        .inc_by(bytes);
}

pub fn record_storage_operation(operation: &str, duration_secs: f64) {
    STORAGE_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

pub fn record_storage_fallback(operation: &str) {
    STORAGE_FALLBACKS.with_label_values(&[operation]).inc();
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_OPERATIONS.with_label_values(&[result]).inc();
}

pub fn record_election(won: bool) {
    let result = if won { "won" } else { "lost" };
    ELECTIONS.with_label_values(&[result]).inc();
}

pub fn record_rebalance(kind: &str, outcome: &str) {
    REBALANCES.with_label_values(&[kind, outcome]).inc();
}

pub fn record_retry_attempt(policy: &str, outcome: &str) {
    RETRY_ATTEMPTS.with_label_values(&[policy, outcome]).inc();
}
