//! Caching, deduplicating, rate-limited client for one upstream target.
//!
//! A logical request first consults the cache. On a miss, concurrent callers
//! for the same fingerprint share a single fetch; the fetch admits every
//! upstream attempt through the token bucket and retries transient failures.
//! Only successful results are cached.

use crate::http::HttpUpstream;
use crate::stats::{AttemptTracker, ClientStats};
use fetchgate_config::GatewayConfig;
use fetchgate_core::{
    CanonicalFingerprintBuilder, FetchSpec, FingerprintBuilder, GatewayError, GatewayResult, Payload,
    RequestFingerprint, UpstreamCaller, UpstreamFailure,
};
use fetchgate_resilience::{
    CacheConfig, CacheLookupResult, Deadline, FlightRole, RateLimiter, RetryConfig, RetryPolicy,
    RetryState, SingleFlight, TimeoutConfig, TimeoutManager, TokenBucketConfig, TtlLruCache,
};
use fetchgate_telemetry::{GatewayMetrics, MetricsConfig};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

/// Shortest period accepted for the cache janitor
const MIN_JANITOR_PERIOD: Duration = Duration::from_secs(1);

/// How a successful request was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestOutcome {
    Hit,
    Fetched,
    Joined,
}

impl RequestOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Fetched => "fetched",
            Self::Joined => "joined",
        }
    }
}

/// Client handle. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    upstream: Arc<dyn UpstreamCaller>,
    fingerprints: Arc<dyn FingerprintBuilder>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    cache: Arc<TtlLruCache<Arc<Payload>>>,
    flights: SingleFlight<RequestFingerprint, Arc<Payload>>,
    timeouts: TimeoutManager,
    operation_ttls: HashMap<String, Duration>,
    tracker: Mutex<AttemptTracker>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl GatewayClient {
    /// Create a new client builder
    #[must_use]
    pub fn builder() -> GatewayClientBuilder {
        GatewayClientBuilder::new()
    }

    /// Build a client talking HTTP to the configured upstream
    ///
    /// # Errors
    /// Returns a configuration error if the HTTP client or limiter cannot be created
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let upstream = HttpUpstream::new(config.upstream.clone())?;
        GatewayClientBuilder::from_config(config)?
            .upstream(Arc::new(upstream))
            .build()
    }

    /// Resolve a logical request under the configured request deadline.
    ///
    /// Serves from the cache when possible. Otherwise joins the fetch already
    /// running for `fingerprint`, or leads a new one. `ttl` overrides the
    /// per-operation TTL for the stored result.
    ///
    /// # Errors
    /// - `GatewayError::LimiterConfig` if `spec.cost` exceeds the bucket capacity
    /// - `GatewayError::Upstream` with the last failure once retries are
    ///   exhausted or a permanent failure occurs
    /// - `GatewayError::Timeout` if the deadline passes first
    pub async fn request(
        &self,
        fingerprint: RequestFingerprint,
        spec: FetchSpec,
        ttl: Option<Duration>,
    ) -> GatewayResult<Arc<Payload>> {
        let deadline = self.inner.timeouts.request_deadline();
        self.request_with_deadline(fingerprint, spec, ttl, deadline).await
    }

    /// Like [`request`](Self::request) with a caller-supplied deadline
    ///
    /// # Errors
    /// Same as [`request`](Self::request)
    #[instrument(skip_all, fields(fingerprint = %fingerprint, operation = %spec.operation))]
    pub async fn request_with_deadline(
        &self,
        fingerprint: RequestFingerprint,
        spec: FetchSpec,
        ttl: Option<Duration>,
        deadline: Deadline,
    ) -> GatewayResult<Arc<Payload>> {
        let started = Instant::now();
        let operation = spec.operation.clone();

        let result = self.resolve(fingerprint, spec, ttl, deadline).await;

        self.inner.observe(|m| {
            let outcome = match &result {
                Ok((_, outcome)) => outcome.as_str(),
                Err(e) => e.error_code(),
            };
            m.record_request(&operation, outcome, started.elapsed());
        });
        result.map(|(payload, _)| payload)
    }

    /// Fingerprint `params` for `operation`, pick the operation TTL and request it
    ///
    /// # Errors
    /// Same as [`request`](Self::request)
    pub async fn fetch(&self, operation: &str, params: Value) -> GatewayResult<Arc<Payload>> {
        let fingerprint = self.fingerprint(operation, &params);
        self.request(fingerprint, FetchSpec::new(operation, params), None)
            .await
    }

    async fn resolve(
        &self,
        fingerprint: RequestFingerprint,
        spec: FetchSpec,
        ttl: Option<Duration>,
        deadline: Deadline,
    ) -> GatewayResult<(Arc<Payload>, RequestOutcome)> {
        let inner = &self.inner;

        let (cached, lookup) = inner.cache.lookup(&fingerprint);
        inner.observe(|m| {
            m.record_cache_lookup(lookup.as_str());
            if lookup == CacheLookupResult::Expired {
                m.record_cache_evictions("expired", 1);
            }
        });
        if let Some(payload) = cached {
            return Ok((payload, RequestOutcome::Hit));
        }

        let capacity = inner.limiter.config().capacity;
        if inner.limiter.is_enabled() && spec.cost > capacity {
            return Err(GatewayError::limiter_config(spec.cost, capacity));
        }

        let ttl = ttl.unwrap_or_else(|| inner.ttl_for(&spec.operation));
        let leader = Arc::clone(inner);
        let key = fingerprint.clone();
        let handle = inner
            .flights
            .join_or_lead(fingerprint, move || leader.lead_fetch(key, spec, ttl));

        let role = handle.role();
        inner.observe(|m| m.record_single_flight(role.as_str()));

        let payload = deadline.run(handle.wait()).await?;
        let outcome = match role {
            FlightRole::Leader => RequestOutcome::Fetched,
            FlightRole::Joiner => RequestOutcome::Joined,
        };
        Ok((payload, outcome))
    }

    /// Fingerprint for `operation` called with `params`
    #[must_use]
    pub fn fingerprint(&self, operation: &str, params: &Value) -> RequestFingerprint {
        self.inner.fingerprints.build(operation, params)
    }

    /// TTL applied to results of `operation` when none is given
    #[must_use]
    pub fn ttl_for(&self, operation: &str) -> Duration {
        self.inner.ttl_for(operation)
    }

    /// Drop the cached result for `fingerprint`
    pub fn invalidate(&self, fingerprint: &RequestFingerprint) -> bool {
        let removed = self.inner.cache.invalidate(fingerprint);
        if removed {
            self.inner.observe(|m| m.record_cache_evictions("invalidated", 1));
        }
        removed
    }

    /// Drop every cached result of `operation`
    pub fn invalidate_operation(&self, operation: &str) -> usize {
        let removed = self.inner.cache.invalidate_operation(operation);
        self.inner
            .observe(|m| m.record_cache_evictions("invalidated", removed as u64));
        removed
    }

    /// Empty the cache
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Purge expired cache entries now
    pub fn cleanup_expired(&self) -> usize {
        let removed = self.inner.cache.cleanup_expired();
        self.inner
            .observe(|m| m.record_cache_evictions("expired", removed as u64));
        removed
    }

    /// Purge expired entries every `period` on a background task.
    ///
    /// The task holds only a weak reference to the cache and stops once the
    /// client is dropped. Usually `period` is `cache.cleanup_interval` from
    /// the loaded [`GatewayConfig`].
    pub fn spawn_cache_janitor(&self, period: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(&self.inner.cache);
        let metrics = self.inner.metrics.clone();
        let period = period.max(MIN_JANITOR_PERIOD);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    debug!("Cache dropped, stopping janitor");
                    break;
                };
                let removed = cache.cleanup_expired();
                if let Some(metrics) = &metrics {
                    metrics.record_cache_evictions("expired", removed as u64);
                }
            }
        })
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> ClientStats {
        let inner = &self.inner;
        let tracker = inner.tracker.lock();
        ClientStats {
            total_attempts: tracker.total(),
            successful_attempts: tracker.successful(),
            avg_response_time: tracker.average_response_time(),
            in_flight: inner.flights.in_flight_count(),
            cache: inner.cache.stats(),
            limiter: inner.limiter.stats(),
        }
    }

    /// Identifier of the upstream
    #[must_use]
    pub fn upstream_id(&self) -> &str {
        self.inner.upstream.id()
    }

    /// The shared rate limiter
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// The result cache
    #[must_use]
    pub fn cache(&self) -> &TtlLruCache<Arc<Payload>> {
        &self.inner.cache
    }

    /// The retry policy
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Attached metrics, if any
    #[must_use]
    pub fn metrics(&self) -> Option<&GatewayMetrics> {
        self.inner.metrics.as_deref()
    }
}

impl ClientInner {
    fn observe(&self, record: impl FnOnce(&GatewayMetrics)) {
        if let Some(metrics) = &self.metrics {
            record(metrics);
        }
    }

    fn ttl_for(&self, operation: &str) -> Duration {
        self.operation_ttls
            .get(operation)
            .copied()
            .unwrap_or_else(|| self.cache.default_ttl())
    }

    /// Body of a single-flight fetch. Runs on its own task.
    async fn lead_fetch(
        self: Arc<Self>,
        fingerprint: RequestFingerprint,
        spec: FetchSpec,
        ttl: Duration,
    ) -> GatewayResult<Arc<Payload>> {
        // A fetch for this key may have finished between our miss and now
        if let Some(payload) = self.cache.peek(&fingerprint) {
            debug!(fingerprint = %fingerprint, "Result stored by a previous fetch");
            return Ok(payload);
        }

        let this: &Self = &self;
        this.observe(GatewayMetrics::fetch_started);
        let result = this
            .retry
            .execute_observed(
                |attempt| this.attempt(&fingerprint, &spec, attempt),
                |_: &RetryState| this.observe(GatewayMetrics::record_retry),
            )
            .await;
        this.observe(GatewayMetrics::fetch_finished);

        let payload = Arc::new(result?);
        if let Some(evicted) = this.cache.put(fingerprint.clone(), Arc::clone(&payload), ttl) {
            debug!(fingerprint = %fingerprint, evicted = %evicted, "Cache full, evicted entry");
            this.observe(|m| m.record_cache_evictions("capacity", 1));
        }
        Ok(payload)
    }

    /// One admitted upstream attempt
    async fn attempt(
        &self,
        fingerprint: &RequestFingerprint,
        spec: &FetchSpec,
        attempt: u32,
    ) -> GatewayResult<Payload> {
        let waited = self.limiter.acquire(spec.cost).await?;
        self.observe(|m| m.record_limiter_wait(waited));

        let deadline = self.timeouts.attempt_deadline();
        let started = Instant::now();
        debug!(fingerprint = %fingerprint, attempt, "Calling upstream");

        let call = self.upstream.call(&spec.operation, &spec.params, deadline);
        let outcome = match tokio::time::timeout_at(deadline, call).await {
            Ok(Ok(response)) => response.into_payload(&spec.operation),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(UpstreamFailure::network(format!(
                "Attempt {attempt} for {fingerprint} timed out after {}ms",
                self.timeouts.attempt_timeout().as_millis()
            ))),
        };

        match outcome {
            Ok(payload) => {
                self.tracker.lock().record_success(started.elapsed());
                self.observe(|m| m.record_upstream_attempt("success"));
                Ok(payload)
            }
            Err(failure) => {
                self.tracker.lock().record_failure();
                let class = if failure.is_transient() { "transient" } else { "permanent" };
                self.observe(|m| m.record_upstream_attempt(class));
                if failure.is_rate_limited() {
                    self.limiter.penalize(failure.retry_after);
                    self.observe(GatewayMetrics::record_limiter_penalty);
                }
                Err(GatewayError::upstream(failure, attempt))
            }
        }
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("upstream", &self.inner.upstream.id())
            .field("limiter", &self.inner.limiter.id())
            .field("cache_entries", &self.inner.cache.len())
            .field("in_flight", &self.inner.flights.in_flight_count())
            .finish_non_exhaustive()
    }
}

/// Builder for [`GatewayClient`]
pub struct GatewayClientBuilder {
    upstream: Option<Arc<dyn UpstreamCaller>>,
    fingerprints: Arc<dyn FingerprintBuilder>,
    token_bucket: Option<TokenBucketConfig>,
    retry: RetryConfig,
    cache: CacheConfig,
    timeouts: TimeoutConfig,
    operation_ttls: HashMap<String, Duration>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl Default for GatewayClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayClientBuilder {
    /// Create a builder with default component settings
    #[must_use]
    pub fn new() -> Self {
        Self {
            upstream: None,
            fingerprints: Arc::new(CanonicalFingerprintBuilder::new()),
            token_bucket: Some(TokenBucketConfig::default()),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
            operation_ttls: HashMap::new(),
            metrics: None,
        }
    }

    /// Builder pre-filled from a loaded configuration (no upstream set)
    ///
    /// # Errors
    /// Returns a configuration error if metrics are enabled but cannot be registered
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let operation_ttls = config
            .cache
            .operation_ttl_seconds
            .iter()
            .map(|(op, secs)| (op.clone(), Duration::from_secs(*secs)))
            .collect();

        let metrics = if config.observability.metrics_enabled {
            let metrics = GatewayMetrics::new(&MetricsConfig::default())
                .map_err(|e| GatewayError::configuration(format!("Failed to register metrics: {e}")))?;
            Some(Arc::new(metrics))
        } else {
            None
        };

        Ok(Self {
            token_bucket: Some(config.rate_limit.token_bucket()),
            retry: config.retry.policy(),
            cache: config.cache.runtime(),
            timeouts: config.timeouts(),
            operation_ttls,
            metrics,
            ..Self::new()
        })
    }

    /// Set the upstream caller
    #[must_use]
    pub fn upstream(mut self, upstream: Arc<dyn UpstreamCaller>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Set the fingerprint builder used by [`GatewayClient::fetch`]
    #[must_use]
    pub fn fingerprint_builder(mut self, builder: Arc<dyn FingerprintBuilder>) -> Self {
        self.fingerprints = builder;
        self
    }

    /// Set the token bucket
    #[must_use]
    pub fn token_bucket(mut self, config: TokenBucketConfig) -> Self {
        self.token_bucket = Some(config);
        self
    }

    /// Turn off outbound rate limiting
    #[must_use]
    pub fn without_rate_limit(mut self) -> Self {
        self.token_bucket = None;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Set the cache size and default TTL
    #[must_use]
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Set the request and attempt deadlines
    #[must_use]
    pub fn timeouts(mut self, config: TimeoutConfig) -> Self {
        self.timeouts = config;
        self
    }

    /// Set the TTL for results of one operation
    #[must_use]
    pub fn operation_ttl(mut self, operation: impl Into<String>, ttl: Duration) -> Self {
        self.operation_ttls.insert(operation.into(), ttl);
        self
    }

    /// Attach metrics
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the client
    ///
    /// # Errors
    /// Returns a configuration error if no upstream was set or the token
    /// bucket settings are invalid
    pub fn build(self) -> GatewayResult<GatewayClient> {
        let upstream = self
            .upstream
            .ok_or_else(|| GatewayError::configuration("an upstream caller is required"))?;

        let limiter = match self.token_bucket {
            Some(config) => RateLimiter::new(upstream.id(), config)?,
            None => RateLimiter::disabled(upstream.id()),
        };

        info!(
            upstream = %upstream.id(),
            rate_limited = limiter.is_enabled(),
            cache_capacity = self.cache.capacity,
            max_attempts = self.retry.max_attempts,
            "Gateway client created"
        );

        Ok(GatewayClient {
            inner: Arc::new(ClientInner {
                limiter,
                retry: RetryPolicy::new(self.retry),
                cache: Arc::new(TtlLruCache::new(self.cache)),
                flights: SingleFlight::new(),
                timeouts: TimeoutManager::new(self.timeouts),
                operation_ttls: self.operation_ttls,
                tracker: Mutex::new(AttemptTracker::default()),
                metrics: self.metrics,
                fingerprints: self.fingerprints,
                upstream,
            }),
        })
    }
}
