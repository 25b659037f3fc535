//! # Fetchgate Telemetry
//!
//! Observability for the fetchgate caching client:
//! - Structured logging bootstrap (JSON, pretty or compact)
//! - Prometheus metrics for cache, limiter, retries and single-flight

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

// Re-export main types
pub use logging::{init_logging, LogFormat, LoggingConfig, LoggingError};
pub use metrics::{GatewayMetrics, MetricsConfig};
