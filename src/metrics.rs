use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolLabels {
    pub pool: String,
}

impl PoolLabels {
    pub fn new(pool_id: &str) -> Self {
        Self {
            pool: pool_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CopyLabels {
    pub pool: String,
    pub outcome: CopyOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CopyOutcome {
    Ok,
    Error,
    Declined,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the mirror.
pub struct Metrics {
    // -- redirect front end --
    pub cache_hit: Family<PoolLabels, Counter>,
    pub cache_miss: Family<PoolLabels, Counter>,
    pub redirect_original: Family<PoolLabels, Counter>,
    pub redirect_wait_seconds: Family<PoolLabels, Histogram>,

    // -- copies --
    pub copies_total: Family<CopyLabels, Counter>,
    pub copy_duration_ms: Family<PoolLabels, Histogram>,
    pub copy_size_bytes: Family<PoolLabels, Histogram>,
    pub copy_speed_kbps: Family<PoolLabels, Histogram>,
    pub concurrent_copy_already_locked: Family<PoolLabels, Counter>,
    pub content_length_mismatch: Family<PoolLabels, Counter>,

    // -- cache maintenance --
    pub backfill: Family<PoolLabels, Counter>,
    pub purges_total: Family<PoolLabels, Counter>,

    // -- adapters --
    pub status_store_failures: Counter,
    pub dead_letters: Family<PoolLabels, Counter>,
    pub queue_depth_visible: Family<PoolLabels, Gauge>,
    pub queue_depth_inflight: Family<PoolLabels, Gauge>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hit = Family::<PoolLabels, Counter>::default();
        registry.register(
            "cloudmirror_cache_hit",
            "Redirect requests answered from a present cache entry",
            cache_hit.clone(),
        );

        let cache_miss = Family::<PoolLabels, Counter>::default();
        registry.register(
            "cloudmirror_cache_miss",
            "Redirect requests that found no usable cache entry",
            cache_miss.clone(),
        );

        let redirect_original = Family::<PoolLabels, Counter>::default();
        registry.register(
            "cloudmirror_redirect_original",
            "Redirects that fell back to the original URL after the poll window",
            redirect_original.clone(),
        );

        let redirect_wait_seconds = Family::<PoolLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.25, 2.0, 10))
        });
        registry.register(
            "cloudmirror_redirect_wait_seconds",
            "Time a redirect request spent polling for a copy",
            redirect_wait_seconds.clone(),
        );

        let copies_total = Family::<CopyLabels, Counter>::default();
        registry.register(
            "cloudmirror_copies_total",
            "Copy jobs by outcome",
            copies_total.clone(),
        );

        let copy_duration_ms = Family::<PoolLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(100.0, 2.0, 16))
        });
        registry.register(
            "cloudmirror_copy_duration_ms",
            "Wall-clock duration of origin-to-bucket copies in milliseconds",
            copy_duration_ms.clone(),
        );

        let copy_size_bytes = Family::<PoolLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(1024.0, 4.0, 14))
        });
        registry.register(
            "cloudmirror_copy_size_bytes",
            "Observed byte count of completed copies",
            copy_size_bytes.clone(),
        );

        let copy_speed_kbps = Family::<PoolLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(64.0, 2.0, 14))
        });
        registry.register(
            "cloudmirror_copy_speed_kbps",
            "Throughput of completed copies in kilobits per second",
            copy_speed_kbps.clone(),
        );

        let concurrent_copy_already_locked = Family::<PoolLabels, Counter>::default();
        registry.register(
            "cloudmirror_concurrent_copy_already_locked",
            "Copy jobs declined because another worker held the single-flight lock",
            concurrent_copy_already_locked.clone(),
        );

        let content_length_mismatch = Family::<PoolLabels, Counter>::default();
        registry.register(
            "cloudmirror_content_length_mismatch",
            "Copies whose observed byte count differed from the advertised Content-Length",
            content_length_mismatch.clone(),
        );

        let backfill = Family::<PoolLabels, Counter>::default();
        registry.register(
            "cloudmirror_backfill",
            "Cache entries repopulated from a still-live blob",
            backfill.clone(),
        );

        let purges_total = Family::<PoolLabels, Counter>::default();
        registry.register(
            "cloudmirror_purges_total",
            "Purge operations",
            purges_total.clone(),
        );

        let status_store_failures = Counter::default();
        registry.register(
            "cloudmirror_status_store_failures",
            "Errors returned by the status store",
            status_store_failures.clone(),
        );

        let dead_letters = Family::<PoolLabels, Counter>::default();
        registry.register(
            "cloudmirror_dead_letters",
            "Messages drained from the dead-letter queue",
            dead_letters.clone(),
        );

        let queue_depth_visible = Family::<PoolLabels, Gauge>::default();
        registry.register(
            "cloudmirror_queue_depth_visible",
            "ApproximateNumberOfMessages on the copy queue",
            queue_depth_visible.clone(),
        );

        let queue_depth_inflight = Family::<PoolLabels, Gauge>::default();
        registry.register(
            "cloudmirror_queue_depth_inflight",
            "ApproximateNumberOfMessagesNotVisible on the copy queue",
            queue_depth_inflight.clone(),
        );

        Self {
            cache_hit,
            cache_miss,
            redirect_original,
            redirect_wait_seconds,
            copies_total,
            copy_duration_ms,
            copy_size_bytes,
            copy_speed_kbps,
            concurrent_copy_already_locked,
            content_length_mismatch,
            backfill,
            purges_total,
            status_store_failures,
            dead_letters,
            queue_depth_visible,
            queue_depth_inflight,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared across all pools.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all mirror metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
