//! Upstream port and the values that cross it.
//!
//! The HTTP transport lives outside the core and is plugged in through
//! [`UpstreamCaller`]. Everything the core caches is a [`Payload`].

use crate::error::UpstreamFailure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Transport that performs a single upstream call.
///
/// Implementations do not retry; retries, admission control and caching are
/// layered on top by the gateway client.
#[async_trait]
pub trait UpstreamCaller: Send + Sync + 'static {
    /// Identifier of the upstream target, used in logs and metrics
    fn id(&self) -> &str;

    /// Perform one call for `operation` with `params`, giving up at `deadline`.
    ///
    /// # Errors
    /// Returns a transient [`UpstreamFailure`] for network-level problems and a
    /// permanent one when the request cannot be expressed at all. HTTP error
    /// statuses are returned as `Ok` responses and classified by the caller.
    async fn call(
        &self,
        operation: &str,
        params: &Value,
        deadline: Instant,
    ) -> Result<UpstreamResponse, UpstreamFailure>;
}

/// Raw upstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    /// HTTP status code
    pub status: u16,
    /// Raw response body
    pub body: Vec<u8>,
    /// Parsed `Retry-After` header, if present
    pub retry_after: Option<Duration>,
}

impl UpstreamResponse {
    /// Create a response with the given status and body
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    /// Successful JSON response
    #[must_use]
    pub fn json(value: &Value) -> Self {
        Self::new(200, value.to_string())
    }

    /// Attach a `Retry-After` hint
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Classify the response and decode a successful body.
    ///
    /// Non-object JSON documents are wrapped as `{"data": ...}`.
    ///
    /// # Errors
    /// Returns the classified failure for non-2xx statuses and a permanent
    /// failure when a 2xx body is not valid JSON.
    pub fn into_payload(self, operation: &str) -> Result<Payload, UpstreamFailure> {
        if !self.is_success() {
            let detail = String::from_utf8_lossy(&self.body);
            let detail: String = detail.chars().take(200).collect();
            let message = if detail.is_empty() {
                format!("HTTP {} for {operation}", self.status)
            } else {
                format!("HTTP {} for {operation}: {detail}", self.status)
            };
            return Err(UpstreamFailure::from_status(self.status, message, self.retry_after));
        }

        let parsed: Value = serde_json::from_slice(&self.body).map_err(|e| {
            UpstreamFailure::permanent(format!("Invalid JSON response for {operation}: {e}"))
        })?;
        let data = match parsed {
            Value::Object(_) => parsed,
            other => serde_json::json!({ "data": other }),
        };

        Ok(Payload {
            data,
            operation: operation.to_string(),
            status: self.status,
            fetched_at: Utc::now(),
        })
    }
}

/// Description of the upstream call to make on a cache miss
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSpec {
    /// Logical operation name, resolved to an endpoint by the transport
    pub operation: String,
    /// Operation parameters
    pub params: Value,
    /// Limiter tokens consumed by each attempt
    pub cost: u32,
}

impl FetchSpec {
    /// Create a spec with a cost of one token
    #[must_use]
    pub fn new(operation: impl Into<String>, params: Value) -> Self {
        Self {
            operation: operation.into(),
            params,
            cost: 1,
        }
    }

    /// Set the limiter cost
    #[must_use]
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

/// Decoded upstream result stored in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Decoded JSON document
    pub data: Value,
    /// Operation that produced it
    pub operation: String,
    /// Upstream HTTP status
    pub status: u16,
    /// When the upstream answered
    pub fetched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use serde_json::json;

    #[test]
    fn test_object_body_is_kept() {
        let payload = UpstreamResponse::json(&json!({"data": [1, 2], "paging": {"page": 0}}))
            .into_payload("gene")
            .expect("payload");
        assert_eq!(payload.data["paging"]["page"], 0);
        assert_eq!(payload.operation, "gene");
        assert_eq!(payload.status, 200);
    }

    #[test]
    fn test_non_object_body_is_wrapped() {
        let payload = UpstreamResponse::new(200, "[1,2,3]")
            .into_payload("tissue_site_detail")
            .expect("payload");
        assert_eq!(payload.data, json!({"data": [1, 2, 3]}));
    }

    #[test]
    fn test_invalid_json_is_permanent() {
        let failure = UpstreamResponse::new(200, "<html>oops</html>")
            .into_payload("gene")
            .expect_err("should fail");
        assert_eq!(failure.class, FailureClass::Permanent);
    }

    #[test]
    fn test_error_statuses_are_classified() {
        let failure = UpstreamResponse::new(503, "maintenance")
            .into_payload("gene")
            .expect_err("should fail");
        assert_eq!(failure.class, FailureClass::Transient);
        assert_eq!(failure.status_code, Some(503));
        assert!(failure.message.contains("maintenance"));

        let failure = UpstreamResponse::new(429, "")
            .with_retry_after(Duration::from_secs(3))
            .into_payload("gene")
            .expect_err("should fail");
        assert!(failure.is_rate_limited());
        assert_eq!(failure.retry_after, Some(Duration::from_secs(3)));

        let failure = UpstreamResponse::new(400, "bad geneId")
            .into_payload("gene")
            .expect_err("should fail");
        assert_eq!(failure.class, FailureClass::Permanent);
    }

    #[test]
    fn test_fetch_spec_cost() {
        let spec = FetchSpec::new("gene", json!({"geneId": "BRCA1"}));
        assert_eq!(spec.cost, 1);
        assert_eq!(spec.with_cost(3).cost, 3);
    }
}
