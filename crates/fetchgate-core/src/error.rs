//! Error types and handling for the gateway.
//!
//! Every failure a caller can observe is a variant of [`GatewayError`], so the
//! surrounding route layer can map errors to distinct responses (502 vs 504 vs
//! 400) without inspecting free-text messages. Per-attempt upstream failures
//! are described by [`UpstreamFailure`] and classified as transient or
//! permanent before the retry policy sees them.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using `GatewayError`
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Retry classification of a single upstream failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Timeouts, connection errors, upstream 5xx and 429
    Transient,
    /// Upstream 4xx other than 429, malformed requests or responses, local validation
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure of one upstream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    /// Whether the attempt may be retried
    pub class: FailureClass,
    /// Human readable detail
    pub message: String,
    /// HTTP status returned by the upstream, if a response was received
    pub status_code: Option<u16>,
    /// Server supplied `Retry-After` hint
    pub retry_after: Option<Duration>,
}

impl UpstreamFailure {
    /// Create a transient failure
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
            status_code: None,
            retry_after: None,
        }
    }

    /// Create a permanent failure
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
            status_code: None,
            retry_after: None,
        }
    }

    /// Network-level failure (timeout, connection reset, DNS). Always transient.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::transient(message)
    }

    /// The request could not be expressed (unknown operation, bad parameters).
    #[must_use]
    pub fn malformed_request(message: impl Into<String>) -> Self {
        Self::permanent(message)
    }

    /// Classify a non-success HTTP status.
    ///
    /// 429 and 5xx are transient, every other status is permanent.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let class = if status == StatusCode::TOO_MANY_REQUESTS.as_u16() || status >= 500 {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        };
        Self {
            class,
            message: message.into(),
            status_code: Some(status),
            retry_after,
        }
    }

    /// Whether the retry policy may attempt the call again
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }

    /// Whether the upstream explicitly rate limited us (HTTP 429)
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.status_code == Some(StatusCode::TOO_MANY_REQUESTS.as_u16())
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{} failure (HTTP {status}): {}", self.class, self.message),
            None => write!(f, "{} failure: {}", self.class, self.message),
        }
    }
}

/// Gateway error type covering every terminal outcome of a request
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Final upstream failure: permanent, or transient with retries exhausted
    #[error("Upstream error after {attempts} attempt(s): {failure}")]
    Upstream {
        /// Failure of the last attempt
        failure: UpstreamFailure,
        /// Number of attempts made
        attempts: u32,
    },

    /// Requested limiter cost can never be satisfied
    #[error("Limiter cost {cost} exceeds bucket capacity {capacity}")]
    LimiterConfig {
        /// Requested cost
        cost: u32,
        /// Bucket capacity
        capacity: u32,
    },

    /// Deadline elapsed while the caller was suspended
    #[error("Request timeout after {duration:?}")]
    Timeout {
        /// Deadline that elapsed
        duration: Duration,
    },

    /// A component observed a state that must never occur
    #[error("Internal invariant violated: {message}")]
    InternalInvariant {
        /// Description of the violated invariant
        message: String,
    },

    /// Invalid client configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },
}

impl GatewayError {
    /// Get the HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upstream { failure, .. } => match failure.class {
                FailureClass::Permanent => failure
                    .status_code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .filter(StatusCode::is_client_error)
                    .unwrap_or(StatusCode::BAD_REQUEST),
                FailureClass::Transient => StatusCode::BAD_GATEWAY,
            },
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::LimiterConfig { .. } | Self::InternalInvariant { .. } | Self::Configuration { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether a caller may reasonably issue the same request again later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { failure, .. } => failure.is_transient(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Get the error type string for API responses
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Upstream { failure, .. } => match failure.class {
                FailureClass::Permanent => "invalid_request_error",
                FailureClass::Transient => "upstream_error",
            },
            Self::Timeout { .. } => "timeout_error",
            Self::LimiterConfig { .. } | Self::InternalInvariant { .. } | Self::Configuration { .. } => {
                "internal_error"
            }
        }
    }

    /// Get the error code for programmatic handling
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Upstream { failure, .. } if failure.is_rate_limited() => "upstream_rate_limited",
            Self::Upstream { failure, .. } => match failure.class {
                FailureClass::Permanent => "upstream_rejected",
                FailureClass::Transient => "upstream_unavailable",
            },
            Self::LimiterConfig { .. } => "limiter_cost_exceeds_capacity",
            Self::Timeout { .. } => "timeout",
            Self::InternalInvariant { .. } => "internal_invariant",
            Self::Configuration { .. } => "configuration_error",
        }
    }

    /// Create an upstream error
    #[must_use]
    pub fn upstream(failure: UpstreamFailure, attempts: u32) -> Self {
        Self::Upstream { failure, attempts }
    }

    /// Create a limiter configuration error
    #[must_use]
    pub fn limiter_config(cost: u32, capacity: u32) -> Self {
        Self::LimiterConfig { cost, capacity }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create an internal invariant error
    #[must_use]
    pub fn internal_invariant(message: impl Into<String>) -> Self {
        Self::InternalInvariant {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The upstream failure carried by this error, if any
    #[must_use]
    pub fn upstream_failure(&self) -> Option<&UpstreamFailure> {
        match self {
            Self::Upstream { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// API error response body for the route layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    /// Error details
    pub error: ApiError,
}

/// API error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error type
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error message
    pub message: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Status returned by the upstream, when one was received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
}

impl From<&GatewayError> for ApiErrorResponse {
    fn from(err: &GatewayError) -> Self {
        Self {
            error: ApiError {
                error_type: err.error_type().to_string(),
                message: err.to_string(),
                code: Some(err.error_code().to_string()),
                upstream_status: err.upstream_failure().and_then(|f| f.status_code),
            },
        }
    }
}

impl fmt::Display for ApiErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error.message)
    }
}
