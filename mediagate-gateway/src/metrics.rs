//! Prometheus metrics for the gateway.
//!
//! All metric names use the `mediagate_` prefix and are exported via the
//! `/metrics` endpoint on the admin port in OpenMetrics text format.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Labels for request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Route identifier (e.g. "/api/ytdl/mp3").
    pub route: String,
    /// Request outcome: "success" or "error".
    pub outcome: String,
}

/// Labels for cache lookup counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    /// Lookup result: "hit" or "miss".
    pub result: String,
}

/// Labels for provider call histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProviderLabels {
    /// Provider identifier: "media", "chat", "screenshot", "mail".
    pub provider: String,
}

/// Provider call duration buckets in milliseconds. Extraction runs for
/// minutes, so the upper buckets are generous.
const PROVIDER_DURATION_BUCKETS: &[f64] = &[
    50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0, 180000.0,
];

/// Prometheus metrics for the gateway.
pub struct GatewayMetrics {
    /// Total requests handled, by route and outcome.
    pub requests_total: Family<RequestLabels, Counter>,
    /// Cache lookups by result.
    pub cache_lookups_total: Family<CacheLabels, Counter>,
    /// Provider call latency in milliseconds.
    pub provider_duration_ms: Family<ProviderLabels, Histogram>,
    /// Breaker trips (0 or 1 for the life of the process).
    pub breaker_trips_total: Counter,
    /// Backup archives produced.
    pub backups_total: Counter,
    /// Currently open client connections.
    pub connections_active: Gauge,
    /// Process uptime in seconds.
    pub uptime_seconds: Gauge,
}

impl GatewayMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "mediagate_requests_total",
            "Total requests handled",
            requests_total.clone(),
        );

        let cache_lookups_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "mediagate_cache_lookups_total",
            "Cache lookups by result",
            cache_lookups_total.clone(),
        );

        let provider_duration_ms = Family::<ProviderLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(PROVIDER_DURATION_BUCKETS.iter().copied())
        });
        registry.register(
            "mediagate_provider_duration_ms",
            "Provider call latency in milliseconds",
            provider_duration_ms.clone(),
        );

        let breaker_trips_total = Counter::default();
        registry.register(
            "mediagate_breaker_trips_total",
            "Traffic breaker trips",
            breaker_trips_total.clone(),
        );

        let backups_total = Counter::default();
        registry.register(
            "mediagate_backups_total",
            "Backup archives produced",
            backups_total.clone(),
        );

        let connections_active = Gauge::default();
        registry.register(
            "mediagate_connections_active",
            "Currently open client connections",
            connections_active.clone(),
        );

        let uptime_seconds = Gauge::default();
        registry.register(
            "mediagate_uptime_seconds",
            "Process uptime in seconds",
            uptime_seconds.clone(),
        );

        Self {
            requests_total,
            cache_lookups_total,
            provider_duration_ms,
            breaker_trips_total,
            backups_total,
            connections_active,
            uptime_seconds,
        }
    }

    pub fn record_request(&self, route: &str, success: bool) {
        self.requests_total
            .get_or_create(&RequestLabels {
                route: route.to_string(),
                outcome: if success { "success" } else { "error" }.to_string(),
            })
            .inc();
    }

    pub fn record_cache_lookup(&self, result: &str) {
        self.cache_lookups_total
            .get_or_create(&CacheLabels {
                result: result.to_string(),
            })
            .inc();
    }

    pub fn record_provider_duration(&self, provider: &str, elapsed_ms: f64) {
        self.provider_duration_ms
            .get_or_create(&ProviderLabels {
                provider: provider.to_string(),
            })
            .observe(elapsed_ms);
    }
}
