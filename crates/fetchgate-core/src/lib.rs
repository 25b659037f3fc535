//! # Fetchgate Core
//!
//! Shared types for the fetchgate caching client:
//! - Error taxonomy with transient/permanent classification
//! - Request fingerprints and the canonical fingerprint builder
//! - The upstream transport port and the cached payload type

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod fingerprint;
pub mod upstream;

// Re-export main types
pub use error::{
    ApiError, ApiErrorResponse, FailureClass, GatewayError, GatewayResult, UpstreamFailure,
};
pub use fingerprint::{CanonicalFingerprintBuilder, FingerprintBuilder, RequestFingerprint};
pub use upstream::{FetchSpec, Payload, UpstreamCaller, UpstreamResponse};
