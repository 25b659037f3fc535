//! # Fetchgate Configuration
//!
//! Configuration management for the fetchgate caching client, including:
//! - Configuration schema and validation
//! - Loading from YAML/TOML/JSON files
//! - Environment variable substitution and overrides

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loader;
pub mod schema;

// Re-export main types
pub use loader::{load_config, ConfigError, ConfigLoader, ConfigSource, DEFAULT_ENV_PREFIX};
pub use schema::{
    CacheConfig, GatewayConfig, ObservabilityConfig, RateLimitConfig, RetryConfig, UpstreamConfig,
};
