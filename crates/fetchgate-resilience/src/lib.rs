//! # Fetchgate Resilience
//!
//! Coordination primitives for a rate-limited caching client:
//! - Rate limiting with token bucket algorithm
//! - Retry policy with exponential backoff and jitter
//! - TTL + LRU result cache
//! - Single-flight deduplication of concurrent fetches
//! - Request and attempt deadlines

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod rate_limiter;
pub mod retry;
pub mod single_flight;
pub mod timeout;

// Re-export main types
pub use cache::{CacheConfig, CacheEntry, CacheLookupResult, CacheStats, TtlLruCache};
pub use rate_limiter::{LimiterStats, RateLimiter, TokenBucketConfig};
pub use retry::{RetryConfig, RetryPolicy, RetryResult, RetryState};
pub use single_flight::{FlightHandle, FlightRole, SingleFlight};
pub use timeout::{instant_after, Deadline, TimeoutConfig, TimeoutManager};
