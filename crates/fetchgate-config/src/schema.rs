//! Configuration schema definitions.
//!
//! This module defines all configuration types with validation and defaults.

use fetchgate_resilience::{
    CacheConfig as CacheRuntimeConfig, RetryConfig as RetryPolicyConfig, TimeoutConfig,
    TokenBucketConfig,
};
use fetchgate_telemetry::{LogFormat, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    /// Outbound rate limiting
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,

    /// Retry policy
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Result cache
    #[validate(nested)]
    pub cache: CacheConfig,

    /// Overall deadline for one logical request, in milliseconds
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,

    /// Upstream HTTP service
    #[validate(nested)]
    pub upstream: UpstreamConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            request_timeout_ms: 60_000,
            upstream: UpstreamConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration
    ///
    /// # Errors
    /// Returns validation errors if configuration is invalid
    pub fn validate_config(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()
    }

    /// Overall request deadline
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Request and attempt deadlines for the client
    #[must_use]
    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig {
            request: self.request_timeout(),
            attempt: self.upstream.attempt_timeout,
        }
    }
}

/// Outbound rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained requests per second
    #[validate(range(exclusive_min = 0.0, max = 10_000.0))]
    pub per_second: f64,

    /// Maximum burst size
    #[validate(range(min = 1))]
    pub burst_size: u32,

    /// Longest refill pause applied after an upstream 429
    #[serde(with = "humantime_serde")]
    pub max_penalty: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 5.0,
            burst_size: 10,
            max_penalty: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Token bucket settings
    #[must_use]
    pub fn token_bucket(&self) -> TokenBucketConfig {
        TokenBucketConfig {
            capacity: self.burst_size,
            refill_per_second: self.per_second,
            max_penalty: self.max_penalty,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per logical fetch (0 behaves as 1)
    #[validate(range(max = 20))]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Backoff multiplier
    #[validate(range(min = 1.0, max = 10.0))]
    pub backoff_multiplier: f64,

    /// Jitter fraction (0.0 - 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_fraction: f64,

    /// Maximum delay between attempts, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Retry policy settings
    #[must_use]
    pub fn policy(&self) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_attempts: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            jitter: self.jitter_fraction,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached results
    #[validate(range(min = 1))]
    pub capacity: usize,

    /// TTL for operations without an entry in `operation_ttl_seconds`
    #[validate(range(min = 1, max = MAX_TTL_SECONDS))]
    pub default_ttl_seconds: u64,

    /// Per-operation TTL overrides, in seconds
    #[serde(default = "default_operation_ttls")]
    #[validate(custom(function = "validate_operation_ttls"))]
    pub operation_ttl_seconds: HashMap<String, u64>,

    /// How often expired entries are purged in the background
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

const DEFAULT_TTL_SECONDS: u64 = 3600;

/// Longest TTL accepted for any operation (ten years)
const MAX_TTL_SECONDS: u64 = 10 * 365 * 86_400;

fn validate_operation_ttls(ttls: &HashMap<String, u64>) -> Result<(), ValidationError> {
    for (operation, secs) in ttls {
        if !(1..=MAX_TTL_SECONDS).contains(secs) {
            let mut err = ValidationError::new("range");
            err.message = Some(
                format!("TTL for {operation} must be between 1 and {MAX_TTL_SECONDS} seconds").into(),
            );
            return Err(err);
        }
    }
    Ok(())
}

fn default_operation_ttls() -> HashMap<String, u64> {
    // Service metadata changes more often than reference data
    let mut ttls = HashMap::new();
    ttls.insert("service_info".to_string(), 1800);
    for reference in ["gene", "transcript", "exon"] {
        ttls.insert(reference.to_string(), DEFAULT_TTL_SECONDS * 2);
    }
    ttls
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            operation_ttl_seconds: default_operation_ttls(),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Default TTL
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    /// TTL for results of `operation`
    #[must_use]
    pub fn ttl_for(&self, operation: &str) -> Duration {
        self.operation_ttl_seconds
            .get(operation)
            .map_or_else(|| self.default_ttl(), |secs| Duration::from_secs(*secs))
    }

    /// Cache settings
    #[must_use]
    pub fn runtime(&self) -> CacheRuntimeConfig {
        CacheRuntimeConfig {
            capacity: self.capacity,
            default_ttl: self.default_ttl(),
        }
    }
}

/// Upstream HTTP service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL; a trailing slash is added if missing
    #[validate(url)]
    pub base_url: String,

    /// User agent sent with every request
    #[validate(length(min = 1))]
    pub user_agent: String,

    /// Timeout for a single upstream attempt
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,

    /// Operation name to path relative to `base_url`
    #[serde(default = "default_endpoints")]
    pub endpoints: HashMap<String, String>,
}

fn default_endpoints() -> HashMap<String, String> {
    [
        ("gene_search", "reference/geneSearch"),
        ("gene", "reference/gene"),
        ("transcript", "reference/transcript"),
        ("exon", "reference/exon"),
        ("neighbor_gene", "reference/neighborGene"),
        ("median_gene_expression", "expression/medianGeneExpression"),
        ("median_transcript_expression", "expression/medianTranscriptExpression"),
        ("median_exon_expression", "expression/medianExonExpression"),
        ("median_junction_expression", "expression/medianJunctionExpression"),
        ("top_expressed_gene", "expression/topExpressedGene"),
        ("gene_expression", "expression/geneExpression"),
        ("single_nucleus_gene_expression", "expression/singleNucleusGeneExpression"),
        ("tissue_site_detail", "dataset/tissueSiteDetail"),
        ("sample", "dataset/sample"),
        ("subject", "dataset/subject"),
        ("variant", "dataset/variant"),
        ("variant_by_location", "dataset/variantByLocation"),
        ("service_info", ""),
    ]
    .into_iter()
    .map(|(op, path)| (op.to_string(), path.to_string()))
    .collect()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gtexportal.org/api/v2/".to_string(),
            user_agent: concat!("fetchgate/", env!("CARGO_PKG_VERSION")).to_string(),
            attempt_timeout: Duration::from_secs(30),
            endpoints: default_endpoints(),
        }
    }
}

impl UpstreamConfig {
    /// Base URL with a trailing slash
    #[must_use]
    pub fn normalized_base_url(&self) -> String {
        if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        }
    }

    /// Absolute URL for `operation`, if the operation is known
    #[must_use]
    pub fn endpoint_url(&self, operation: &str) -> Option<String> {
        self.endpoints
            .get(operation)
            .map(|path| format!("{}{}", self.normalized_base_url(), path.trim_start_matches('/')))
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1))]
    pub log_level: String,

    /// Log output format
    pub log_format: LogFormat,

    /// Whether Prometheus metrics are recorded
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_enabled: true,
        }
    }
}

impl ObservabilityConfig {
    /// Logging settings for the telemetry bootstrap
    #[must_use]
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig::new()
            .with_level(self.log_level.clone())
            .with_format(self.log_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert!((config.rate_limit.per_second - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.rate_limit.burst_size, 10);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.default_ttl_seconds, 3600);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_operation_ttls() {
        let cache = CacheConfig::default();
        assert_eq!(cache.ttl_for("service_info"), Duration::from_secs(1800));
        assert_eq!(cache.ttl_for("gene"), Duration::from_secs(7200));
        assert_eq!(cache.ttl_for("exon"), Duration::from_secs(7200));
        assert_eq!(cache.ttl_for("median_gene_expression"), Duration::from_secs(3600));
    }

    #[test]
    fn test_endpoint_urls() {
        let upstream = UpstreamConfig {
            base_url: "https://example.org/api/v2".to_string(),
            ..UpstreamConfig::default()
        };
        assert_eq!(
            upstream.endpoint_url("gene_search").as_deref(),
            Some("https://example.org/api/v2/reference/geneSearch")
        );
        assert_eq!(
            upstream.endpoint_url("service_info").as_deref(),
            Some("https://example.org/api/v2/")
        );
        assert_eq!(upstream.endpoint_url("unknown"), None);
    }

    #[test]
    fn test_runtime_conversions() {
        let config = GatewayConfig::default();

        let bucket = config.rate_limit.token_bucket();
        assert_eq!(bucket.capacity, 10);
        assert!((bucket.refill_per_second - 5.0).abs() < f64::EPSILON);

        let retry = config.retry.policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(30));

        let cache = config.cache.runtime();
        assert_eq!(cache.capacity, 1000);
        assert_eq!(cache.default_ttl, Duration::from_secs(3600));

        let timeouts = config.timeouts();
        assert_eq!(timeouts.attempt, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = GatewayConfig::default();
        config.rate_limit.per_second = 0.0;
        assert!(config.validate_config().is_err());

        let mut config = GatewayConfig::default();
        config.rate_limit.burst_size = 0;
        assert!(config.validate_config().is_err());

        let mut config = GatewayConfig::default();
        config.retry.jitter_fraction = 1.5;
        assert!(config.validate_config().is_err());

        let mut config = GatewayConfig::default();
        config.upstream.base_url = "not a url".to_string();
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_ttl_bounds() {
        let mut config = GatewayConfig::default();
        config.cache.default_ttl_seconds = u64::MAX;
        assert!(config.validate_config().is_err());

        config.cache.default_ttl_seconds = MAX_TTL_SECONDS;
        assert!(config.validate_config().is_ok());

        config.cache.operation_ttl_seconds.insert("gene".to_string(), u64::MAX);
        assert!(config.validate_config().is_err());

        config.cache.operation_ttl_seconds.insert("gene".to_string(), 0);
        assert!(config.validate_config().is_err());

        config.cache.operation_ttl_seconds.insert("gene".to_string(), 60);
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_yaml_serialization() {
        let config = GatewayConfig::default();
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        assert!(yaml.contains("rate_limit:"));
        assert!(yaml.contains("burst_size: 10"));
        assert!(yaml.contains("cleanup_interval: 5m"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: GatewayConfig = serde_yaml::from_str("cache:\n  capacity: 5\n").expect("deserialize");
        assert_eq!(config.cache.capacity, 5);
        assert_eq!(config.cache.default_ttl_seconds, 3600);
        assert_eq!(config.cache.ttl_for("service_info"), Duration::from_secs(1800));
        assert_eq!(config.rate_limit.burst_size, 10);
    }
}
