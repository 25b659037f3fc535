//! Prometheus metrics for the caching client.
//!
//! Provides metrics for:
//! - Request outcomes and latencies
//! - Cache lookups and evictions
//! - Upstream attempts and retries
//! - Single-flight deduplication
//! - Limiter waits and 429 penalties

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;
use tracing::{error, info};

const NAMESPACE: &str = "fetchgate";

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,
    /// Histogram buckets for request latency
    pub latency_buckets: Vec<f64>,
    /// Histogram buckets for limiter waits
    pub wait_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ],
            wait_buckets: vec![0.0, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        }
    }
}

/// Metrics registry and collectors
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    cache_lookups: IntCounterVec,
    cache_evictions: IntCounterVec,
    upstream_attempts: IntCounterVec,
    retries_total: IntCounter,
    single_flight: IntCounterVec,
    limiter_wait: Histogram,
    limiter_penalties: IntCounter,
    in_flight_fetches: IntGauge,
}

impl GatewayMetrics {
    /// Create a new metrics instance with its own registry
    ///
    /// # Errors
    /// Returns error if metrics cannot be registered
    pub fn new(config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        Self::with_registry(config, Registry::new())
    }

    /// Create a metrics instance registering into `registry`
    ///
    /// # Errors
    /// Returns error if a collector is already registered under the same name
    pub fn with_registry(config: &MetricsConfig, registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Logical requests by outcome").namespace(NAMESPACE),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Logical request latency in seconds")
                .namespace(NAMESPACE)
                .buckets(config.latency_buckets.clone()),
            &["operation"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let cache_lookups = IntCounterVec::new(
            Opts::new("cache_lookups_total", "Cache lookups by result").namespace(NAMESPACE),
            &["result"],
        )?;
        registry.register(Box::new(cache_lookups.clone()))?;

        let cache_evictions = IntCounterVec::new(
            Opts::new("cache_evictions_total", "Cache entries removed by reason").namespace(NAMESPACE),
            &["reason"],
        )?;
        registry.register(Box::new(cache_evictions.clone()))?;

        let upstream_attempts = IntCounterVec::new(
            Opts::new("upstream_attempts_total", "Upstream attempts by result class")
                .namespace(NAMESPACE),
            &["class"],
        )?;
        registry.register(Box::new(upstream_attempts.clone()))?;

        let retries_total = IntCounter::with_opts(
            Opts::new("retries_total", "Retries scheduled after transient failures").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let single_flight = IntCounterVec::new(
            Opts::new("single_flight_total", "Cache misses by single-flight role").namespace(NAMESPACE),
            &["role"],
        )?;
        registry.register(Box::new(single_flight.clone()))?;

        let limiter_wait = Histogram::with_opts(
            HistogramOpts::new("limiter_wait_seconds", "Time spent waiting for limiter tokens")
                .namespace(NAMESPACE)
                .buckets(config.wait_buckets.clone()),
        )?;
        registry.register(Box::new(limiter_wait.clone()))?;

        let limiter_penalties = IntCounter::with_opts(
            Opts::new("limiter_penalties_total", "Bucket drains after upstream 429").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(limiter_penalties.clone()))?;

        let in_flight_fetches = IntGauge::with_opts(
            Opts::new("in_flight_fetches", "Outstanding upstream fetches").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(in_flight_fetches.clone()))?;

        info!("Metrics initialized");

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            cache_lookups,
            cache_evictions,
            upstream_attempts,
            retries_total,
            single_flight,
            limiter_wait,
            limiter_penalties,
            in_flight_fetches,
        })
    }

    /// Record a finished logical request
    pub fn record_request(&self, operation: &str, outcome: &str, duration: Duration) {
        self.requests_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.request_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Record a cache lookup (`hit`, `miss` or `expired`)
    pub fn record_cache_lookup(&self, result: &str) {
        self.cache_lookups.with_label_values(&[result]).inc();
    }

    /// Record entries removed from the cache (`capacity`, `expired` or `invalidated`)
    pub fn record_cache_evictions(&self, reason: &str, count: u64) {
        if count > 0 {
            self.cache_evictions.with_label_values(&[reason]).inc_by(count);
        }
    }

    /// Record one upstream attempt (`success`, `transient` or `permanent`)
    pub fn record_upstream_attempt(&self, class: &str) {
        self.upstream_attempts.with_label_values(&[class]).inc();
    }

    /// Record a scheduled retry
    pub fn record_retry(&self) {
        self.retries_total.inc();
    }

    /// Record a caller's single-flight role (`leader` or `joiner`)
    pub fn record_single_flight(&self, role: &str) {
        self.single_flight.with_label_values(&[role]).inc();
    }

    /// Record time spent waiting for the limiter
    pub fn record_limiter_wait(&self, waited: Duration) {
        self.limiter_wait.observe(waited.as_secs_f64());
    }

    /// Record a 429 penalty applied to the limiter
    pub fn record_limiter_penalty(&self) {
        self.limiter_penalties.inc();
    }

    /// A fetch started
    pub fn fetch_started(&self) {
        self.in_flight_fetches.inc();
    }

    /// A fetch finished
    pub fn fetch_finished(&self) {
        self.in_flight_fetches.dec();
    }

    /// Get metrics as Prometheus text format
    #[must_use]
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Get the Prometheus registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}
