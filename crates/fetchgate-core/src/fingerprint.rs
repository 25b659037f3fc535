//! Request fingerprints.
//!
//! A fingerprint is the cache and single-flight key for a logical upstream
//! request. Identical requests must map to identical fingerprints regardless
//! of parameter order or how optional fields were spelled.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Number of hash characters shown by [`RequestFingerprint`]'s `Display`
const DISPLAY_HASH_LEN: usize = 8;

/// Deterministic key for a logical upstream request.
///
/// Cloning is cheap; the digest is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestFingerprint {
    operation: Arc<str>,
    digest: Arc<str>,
}

impl RequestFingerprint {
    /// Build a fingerprint from an operation name and a precomputed digest
    #[must_use]
    pub fn from_parts(operation: impl Into<Arc<str>>, digest: impl Into<Arc<str>>) -> Self {
        Self {
            operation: operation.into(),
            digest: digest.into(),
        }
    }

    /// Operation the fingerprint was derived from
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Full hex digest
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.digest.get(..DISPLAY_HASH_LEN).unwrap_or(&self.digest);
        write!(f, "{}:{short}", self.operation)
    }
}

/// Derives fingerprints from an operation name and its parameters.
///
/// Implementations must be pure: the same inputs always yield the same key.
pub trait FingerprintBuilder: Send + Sync + 'static {
    /// Build the fingerprint for `operation` called with `params`
    fn build(&self, operation: &str, params: &Value) -> RequestFingerprint;
}

/// SHA-256 over the operation name and a canonical JSON encoding of the
/// parameters.
///
/// Canonical form: object keys sorted at every depth, `null` members dropped,
/// array order preserved.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalFingerprintBuilder;

impl CanonicalFingerprintBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> =
                    map.iter().filter(|(_, v)| !v.is_null()).collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = Map::new();
                for (key, v) in entries {
                    out.insert(key.clone(), Self::canonicalize(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(Self::canonicalize).collect()),
            other => other.clone(),
        }
    }

    /// Canonical JSON text for `params`
    #[must_use]
    pub fn canonical_json(params: &Value) -> String {
        // Keys are inserted sorted, so output is stable with or without `preserve_order`.
        Self::canonicalize(params).to_string()
    }
}

impl FingerprintBuilder for CanonicalFingerprintBuilder {
    fn build(&self, operation: &str, params: &Value) -> RequestFingerprint {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update([0u8]);
        hasher.update(Self::canonical_json(params).as_bytes());
        RequestFingerprint::from_parts(operation, hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(operation: &str, params: &Value) -> RequestFingerprint {
        CanonicalFingerprintBuilder::new().build(operation, params)
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a = json!({"geneId": "BRCA1", "page": 0, "itemsPerPage": 250});
        let b = json!({"itemsPerPage": 250, "geneId": "BRCA1", "page": 0});
        assert_eq!(fp("gene_search", &a), fp("gene_search", &b));
    }

    #[test]
    fn test_null_fields_equal_absent_fields() {
        let a = json!({"geneId": "BRCA1", "gencodeVersion": null});
        let b = json!({"geneId": "BRCA1"});
        assert_eq!(fp("gene_search", &a), fp("gene_search", &b));
    }

    #[test]
    fn test_nested_objects_are_canonicalized() {
        let a = json!({"filter": {"b": 1, "a": 2}});
        let b = json!({"filter": {"a": 2, "b": 1}});
        assert_eq!(fp("op", &a), fp("op", &b));
    }

    #[test]
    fn test_list_order_is_significant() {
        let a = json!({"tissue": ["Lung", "Liver"]});
        let b = json!({"tissue": ["Liver", "Lung"]});
        assert_ne!(fp("op", &a), fp("op", &b));
    }

    #[test]
    fn test_operation_is_part_of_key() {
        let params = json!({"geneId": "BRCA1"});
        assert_ne!(fp("gene", &params), fp("transcript", &params));
    }

    #[test]
    fn test_distinct_params_distinct_keys() {
        assert_ne!(fp("gene", &json!({"geneId": "BRCA1"})), fp("gene", &json!({"geneId": "BRCA2"})));
        assert_ne!(fp("gene", &json!({"page": 1})), fp("gene", &json!({"page": "1"})));
    }

    #[test]
    fn test_display_is_short() {
        let key = fp("gene", &json!({"geneId": "BRCA1"}));
        let shown = key.to_string();
        assert!(shown.starts_with("gene:"));
        assert_eq!(shown.len(), "gene:".len() + DISPLAY_HASH_LEN);
        assert_eq!(key.digest().len(), 64);
    }

    #[test]
    fn test_serde_preserves_key() {
        let key = fp("gene", &json!({"geneId": "BRCA1"}));
        let encoded = serde_json::to_value(&key).expect("serialize");
        assert_eq!(encoded["operation"], "gene");
        assert_eq!(encoded["digest"], key.digest());

        let decoded: RequestFingerprint = serde_json::from_value(encoded).expect("deserialize");
        assert_eq!(decoded, key);
    }
}
