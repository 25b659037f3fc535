//! HTTP transport for the upstream service.
//!
//! Resolves an operation name to an endpoint URL and performs one `GET` with
//! the parameters encoded as a query string. Status handling is left to the
//! caller; only transport failures are reported as errors here.

use async_trait::async_trait;
use fetchgate_config::UpstreamConfig;
use fetchgate_core::{GatewayError, UpstreamCaller, UpstreamFailure, UpstreamResponse};
use http::header::{ACCEPT, RETRY_AFTER};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Upstream caller over `reqwest`
pub struct HttpUpstream {
    id: String,
    config: UpstreamConfig,
    client: Client,
}

impl HttpUpstream {
    /// Create a new HTTP upstream
    ///
    /// # Errors
    /// Returns a configuration error if the HTTP client cannot be created
    pub fn new(config: UpstreamConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.attempt_timeout)
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| GatewayError::configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            id: config.normalized_base_url(),
            config,
            client,
        })
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn endpoint_url(&self, operation: &str) -> Result<String, UpstreamFailure> {
        self.config
            .endpoint_url(operation)
            .ok_or_else(|| UpstreamFailure::malformed_request(format!("Unknown operation: {operation}")))
    }
}

/// Encode `params` as query pairs.
///
/// Scalars are stringified, arrays become repeated keys and nulls are skipped.
///
/// # Errors
/// Returns a permanent failure if `params` is neither an object nor null
pub fn query_pairs(params: &Value) -> Result<Vec<(String, String)>, UpstreamFailure> {
    let map = match params {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        other => {
            return Err(UpstreamFailure::malformed_request(format!(
                "Parameters must be an object, got {other}"
            )))
        }
    };

    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        match value {
            Value::Array(items) => {
                for item in items {
                    if let Some(text) = scalar_text(item) {
                        pairs.push((key.clone(), text));
                    }
                }
            }
            other => {
                if let Some(text) = scalar_text(other) {
                    pairs.push((key.clone(), text));
                }
            }
        }
    }
    Ok(pairs)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested => Some(nested.to_string()),
    }
}

/// Parse a `Retry-After` value given in seconds
fn parse_retry_after(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

#[async_trait]
impl UpstreamCaller for HttpUpstream {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(
        &self,
        operation: &str,
        params: &Value,
        deadline: Instant,
    ) -> Result<UpstreamResponse, UpstreamFailure> {
        let url = self.endpoint_url(operation)?;
        let query = query_pairs(params)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(UpstreamFailure::network(format!(
                "Deadline elapsed before calling {operation}"
            )));
        }

        debug!(upstream = %self.id, operation, url = %url, "Sending upstream request");

        let response = self
            .client
            .get(&url)
            .query(&query)
            .header(ACCEPT, "application/json")
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    UpstreamFailure::malformed_request(format!("Invalid request for {operation}: {e}"))
                } else {
                    UpstreamFailure::network(format!("Request for {operation} failed: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);

        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamFailure::network(format!("Reading response for {operation} failed: {e}")))?;

        trace!(upstream = %self.id, operation, status, bytes = body.len(), "Upstream responded");

        let mut raw = UpstreamResponse::new(status, body.to_vec());
        raw.retry_after = retry_after;
        Ok(raw)
    }
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("id", &self.id)
            .field("attempt_timeout", &self.config.attempt_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchgate_core::FailureClass;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn upstream(base_url: &str) -> HttpUpstream {
        HttpUpstream::new(UpstreamConfig {
            base_url: base_url.to_string(),
            user_agent: "fetchgate-test".to_string(),
            ..UpstreamConfig::default()
        })
        .expect("client")
    }

    /// Serve one canned response and hand back the raw request head
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&head).to_string()
        });
        (format!("http://{addr}/api"), handle)
    }

    #[test]
    fn test_query_pairs() {
        let pairs = query_pairs(&json!({
            "geneId": "BRCA1",
            "page": 0,
            "tissueSiteDetailId": ["Lung", "Liver"],
            "gencodeVersion": null,
            "attributeSubset": true,
        }))
        .expect("pairs");

        assert!(pairs.contains(&("geneId".to_string(), "BRCA1".to_string())));
        assert!(pairs.contains(&("page".to_string(), "0".to_string())));
        assert!(pairs.contains(&("attributeSubset".to_string(), "true".to_string())));
        let tissues: Vec<_> = pairs
            .iter()
            .filter(|(k, _)| k == "tissueSiteDetailId")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(tissues, vec!["Lung", "Liver"]);
        assert!(!pairs.iter().any(|(k, _)| k == "gencodeVersion"));
    }

    #[test]
    fn test_query_pairs_rejects_non_objects() {
        let failure = query_pairs(&json!(["not", "an", "object"])).expect_err("should fail");
        assert_eq!(failure.class, FailureClass::Permanent);
        assert!(query_pairs(&Value::Null).expect("null").is_empty());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_permanent() {
        let upstream = upstream("https://example.org/api/");
        let failure = upstream
            .call("no_such_operation", &json!({}), Instant::now() + Duration::from_secs(5))
            .await
            .expect_err("should fail");
        assert_eq!(failure.class, FailureClass::Permanent);
    }

    #[tokio::test]
    async fn test_elapsed_deadline_is_transient() {
        let upstream = upstream("https://example.org/api/");
        let failure = upstream
            .call("gene", &json!({}), Instant::now())
            .await
            .expect_err("should fail");
        assert_eq!(failure.class, FailureClass::Transient);
    }

    #[tokio::test]
    async fn test_request_shape_and_retry_after() {
        let (base_url, server) = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 3\r\nContent-Length: 4\r\nConnection: close\r\n\r\nslow",
        )
        .await;
        let upstream = upstream(&base_url);

        let response = upstream
            .call(
                "gene_search",
                &json!({"geneId": "BRCA1", "tissue": ["Lung", "Liver"], "page": null}),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .expect("response");

        assert_eq!(response.status, 429);
        assert_eq!(response.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(response.body, b"slow".to_vec());

        let head = server.await.expect("server").to_lowercase();
        assert!(head.starts_with("get /api/reference/genesearch?"), "{head}");
        assert!(head.contains("geneid=brca1"), "{head}");
        assert!(head.contains("tissue=lung&tissue=liver"), "{head}");
        assert!(!head.contains("page="), "{head}");
        assert!(head.contains("user-agent: fetchgate-test"), "{head}");
        assert!(head.contains("accept: application/json"), "{head}");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let upstream = upstream(&format!("http://{addr}/"));
        let failure = upstream
            .call("gene", &json!({"geneId": "BRCA1"}), Instant::now() + Duration::from_secs(5))
            .await
            .expect_err("should fail");
        assert_eq!(failure.class, FailureClass::Transient);
    }
}
