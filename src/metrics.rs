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
pub struct LookupLabels {
    pub outcome: LookupOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LookupOutcome {
    Hit,
    Stale,
    Miss,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub result: FetchResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchResult {
    Updated,
    NotModified,
    Error,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- cache --
    pub cache_lookups: Family<LookupLabels, Counter>,
    pub coalesced_waiters: Counter,

    // -- upstream API --
    pub upstream_fetches: Family<FetchLabels, Counter>,
    pub upstream_fetch_duration_seconds: Histogram,
    pub upstream_rate_limit_retries: Counter,
    pub upstream_abuse_detected: Counter,
    pub upstream_api_rate_limit_remaining: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_lookups = Family::<LookupLabels, Counter>::default();
        registry.register(
            "projbase_cache_lookups",
            "Manifest cache lookups by outcome",
            cache_lookups.clone(),
        );

        let coalesced_waiters = Counter::default();
        registry.register(
            "projbase_coalesced_waiters",
            "Lookups that joined a fetch already in flight",
            coalesced_waiters.clone(),
        );

        let upstream_fetches = Family::<FetchLabels, Counter>::default();
        registry.register(
            "projbase_upstream_fetches",
            "Upstream manifest fetches by result",
            upstream_fetches.clone(),
        );

        let upstream_fetch_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "projbase_upstream_fetch_duration_seconds",
            "Upstream manifest fetch latency in seconds, including retries",
            upstream_fetch_duration_seconds.clone(),
        );

        let upstream_rate_limit_retries = Counter::default();
        registry.register(
            "projbase_upstream_rate_limit_retries",
            "Requests retried after the upstream quota was exhausted",
            upstream_rate_limit_retries.clone(),
        );

        let upstream_abuse_detected = Counter::default();
        registry.register(
            "projbase_upstream_abuse_detected",
            "Requests refused by upstream abuse detection",
            upstream_abuse_detected.clone(),
        );

        let upstream_api_rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "projbase_upstream_api_rate_limit_remaining",
            "Remaining upstream API calls before rate limit",
            upstream_api_rate_limit_remaining.clone(),
        );

        Self {
            cache_lookups,
            coalesced_waiters,
            upstream_fetches,
            upstream_fetch_duration_seconds,
            upstream_rate_limit_retries,
            upstream_abuse_detected,
            upstream_api_rate_limit_remaining,
        }
    }

    pub fn record_lookup(&self, outcome: LookupOutcome) {
        self.cache_lookups.get_or_create(&LookupLabels { outcome }).inc();
    }

    pub fn record_fetch(&self, result: FetchResult) {
        self.upstream_fetches.get_or_create(&FetchLabels { result }).inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
