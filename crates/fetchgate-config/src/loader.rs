//! Configuration loading from files and environment.
//!
//! Sources are parsed into JSON documents and deep-merged in order, so a
//! later source only overrides the keys it actually sets. Environment
//! overrides are applied last, then the result is validated.

use crate::schema::GatewayConfig;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Default prefix for environment overrides
pub const DEFAULT_ENV_PREFIX: &str = "FETCHGATE";

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// The path to the file that was not found
        path: String,
    },

    /// IO error
    #[error("IO error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Unsupported format
    #[error("Unsupported configuration format: {extension}")]
    UnsupportedFormat {
        /// The file extension that was not supported
        extension: String,
    },

    /// Environment override could not be parsed
    #[error("Invalid value {value:?} for environment variable {name}")]
    InvalidEnvValue {
        /// Variable name
        name: String,
        /// Raw value
        value: String,
    },

    /// Substitution pattern failed to compile
    #[error("Invalid substitution pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Configuration source
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path
    File(String),
    /// Raw YAML string
    Yaml(String),
    /// Raw TOML string
    Toml(String),
    /// Raw JSON string
    Json(String),
    /// Default configuration
    Default,
}

/// Configuration loader
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a new config loader
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            env_prefix: None,
        }
    }

    /// Add a configuration source
    #[must_use]
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Add a file source
    #[must_use]
    pub fn with_file(self, path: impl Into<String>) -> Self {
        self.with_source(ConfigSource::File(path.into()))
    }

    /// Set environment variable prefix for overrides
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Load configuration from all sources
    ///
    /// # Errors
    /// Returns error if any source fails to load or validate
    pub async fn load(self) -> Result<GatewayConfig, ConfigError> {
        let mut merged = serde_json::to_value(GatewayConfig::default())?;

        for source in &self.sources {
            let overlay = Self::load_source(source).await?;
            merge_values(&mut merged, overlay);
        }

        let mut config: GatewayConfig = serde_json::from_value(merged)?;

        if let Some(ref prefix) = self.env_prefix {
            Self::apply_env_overrides(&mut config, prefix)?;
        }

        config
            .validate_config()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load from a single source
    async fn load_source(source: &ConfigSource) -> Result<Value, ConfigError> {
        match source {
            ConfigSource::File(path) => Self::load_file(path).await,
            ConfigSource::Yaml(content) => Self::parse_yaml(content),
            ConfigSource::Toml(content) => Self::parse_toml(content),
            ConfigSource::Json(content) => Self::parse_json(content),
            ConfigSource::Default => Ok(serde_json::to_value(GatewayConfig::default())?),
        }
    }

    /// Load configuration from a file
    async fn load_file(path: &str) -> Result<Value, ConfigError> {
        let path = Path::new(path);

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let content = fs::read_to_string(path).await?;
        let content = Self::substitute_env_vars(&content)?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        debug!(path = %path.display(), format = %extension, "Loading configuration file");

        match extension.as_str() {
            "yaml" | "yml" => Self::parse_yaml(&content),
            "toml" => Self::parse_toml(&content),
            "json" => Self::parse_json(&content),
            ext => Err(ConfigError::UnsupportedFormat {
                extension: ext.to_string(),
            }),
        }
    }

    /// Parse YAML content
    fn parse_yaml(content: &str) -> Result<Value, ConfigError> {
        let value: Option<Value> = serde_yaml::from_str(content)?;
        Ok(value.unwrap_or(Value::Null))
    }

    /// Parse TOML content
    fn parse_toml(content: &str) -> Result<Value, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Parse JSON content
    fn parse_json(content: &str) -> Result<Value, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    fn placeholder_pattern() -> Result<&'static Regex, ConfigError> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        if let Some(re) = PATTERN.get() {
            return Ok(re);
        }
        let re = Regex::new(r"\$\{([^}]+)\}")?;
        Ok(PATTERN.get_or_init(|| re))
    }

    /// Substitute environment variables in content
    ///
    /// Supports ${VAR} and ${VAR:-default} syntax. Unset variables without a
    /// default are left in place and logged.
    fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
        let re = Self::placeholder_pattern()?;

        let result = re.replace_all(content, |caps: &regex::Captures<'_>| {
            let var_spec = &caps[1];
            let (var_name, default) = match var_spec.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_spec, None),
            };

            match (std::env::var(var_name), default) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.to_string(),
                (Err(_), None) => {
                    warn!(variable = var_name, "Environment variable not found");
                    caps[0].to_string()
                }
            }
        });

        Ok(result.into_owned())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(config: &mut GatewayConfig, prefix: &str) -> Result<(), ConfigError> {
        override_from_env(prefix, "RATE_LIMIT_PER_SECOND", &mut config.rate_limit.per_second)?;
        override_from_env(prefix, "BURST_SIZE", &mut config.rate_limit.burst_size)?;
        override_from_env(prefix, "CACHE_CAPACITY", &mut config.cache.capacity)?;
        override_from_env(prefix, "CACHE_DEFAULT_TTL_SECONDS", &mut config.cache.default_ttl_seconds)?;
        override_from_env(prefix, "MAX_RETRIES", &mut config.retry.max_retries)?;
        override_from_env(prefix, "BASE_RETRY_DELAY_MS", &mut config.retry.base_delay_ms)?;
        override_from_env(prefix, "RETRY_BACKOFF_MULTIPLIER", &mut config.retry.backoff_multiplier)?;
        override_from_env(prefix, "RETRY_JITTER_FRACTION", &mut config.retry.jitter_fraction)?;
        override_from_env(prefix, "REQUEST_TIMEOUT_MS", &mut config.request_timeout_ms)?;
        override_from_env(prefix, "BASE_URL", &mut config.upstream.base_url)?;
        override_from_env(prefix, "LOG_LEVEL", &mut config.observability.log_level)?;
        override_from_env(prefix, "METRICS_ENABLED", &mut config.observability.metrics_enabled)?;
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn override_from_env<T: FromStr>(prefix: &str, key: &str, target: &mut T) -> Result<(), ConfigError> {
    let name = format!("{prefix}_{key}");
    if let Ok(raw) = std::env::var(&name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnvValue { name: name.clone(), value: raw.clone() })?;
        debug!(variable = %name, "Applied environment override");
    }
    Ok(())
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other overlay value replaces the base value. A null overlay changes nothing.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Load configuration from default locations
///
/// Looks for configuration in order:
/// 1. Path from FETCHGATE_CONFIG environment variable
/// 2. ./fetchgate.yaml
/// 3. ./config/fetchgate.yaml
/// 4. /etc/fetchgate/config.yaml
///
/// # Errors
/// Returns error if a configuration file exists but cannot be parsed or validated
pub async fn load_config() -> Result<GatewayConfig, ConfigError> {
    let config_path = std::env::var(format!("{DEFAULT_ENV_PREFIX}_CONFIG")).ok();

    let search_paths = if let Some(ref path) = config_path {
        vec![path.as_str()]
    } else {
        vec![
            "fetchgate.yaml",
            "fetchgate.yml",
            "fetchgate.toml",
            "config/fetchgate.yaml",
            "/etc/fetchgate/config.yaml",
        ]
    };

    for path in &search_paths {
        if Path::new(path).exists() {
            info!(path, "Loading configuration");
            return ConfigLoader::new()
                .with_file(*path)
                .with_env_prefix(DEFAULT_ENV_PREFIX)
                .load()
                .await;
        }
    }

    warn!("No configuration file found, using defaults");
    ConfigLoader::new().with_env_prefix(DEFAULT_ENV_PREFIX).load().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("FETCHGATE_TEST_SUBST_URL", "https://example.org/api/");

        let content = "base_url: ${FETCHGATE_TEST_SUBST_URL}";
        let result = ConfigLoader::substitute_env_vars(content).expect("substitute");
        assert_eq!(result, "base_url: https://example.org/api/");

        std::env::remove_var("FETCHGATE_TEST_SUBST_URL");
    }

    #[test]
    fn test_env_var_with_default() {
        let content = "level: ${FETCHGATE_NONEXISTENT_VAR:-debug}";
        let result = ConfigLoader::substitute_env_vars(content).expect("substitute");
        assert_eq!(result, "level: debug");
    }

    #[test]
    fn test_missing_env_var_left_in_place() {
        let content = "level: ${FETCHGATE_ALSO_NONEXISTENT}";
        let result = ConfigLoader::substitute_env_vars(content).expect("substitute");
        assert_eq!(result, content);
    }

    #[tokio::test]
    async fn test_load_yaml_content() {
        let yaml = r#"
rate_limit:
  per_second: 2.5
  burst_size: 4
cache:
  capacity: 50
  cleanup_interval: 30s
upstream:
  base_url: "https://example.org/api"
  attempt_timeout: 5s
"#;

        let config = ConfigLoader::new()
            .with_source(ConfigSource::Yaml(yaml.to_string()))
            .load()
            .await
            .expect("load config");

        assert!((config.rate_limit.per_second - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.rate_limit.burst_size, 4);
        assert_eq!(config.cache.capacity, 50);
        assert_eq!(config.cache.cleanup_interval, Duration::from_secs(30));
        assert_eq!(config.upstream.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.upstream.normalized_base_url(), "https://example.org/api/");
        // Untouched sections keep their defaults
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.upstream.endpoints.contains_key("gene_search"));
    }

    #[tokio::test]
    async fn test_load_toml_content() {
        let toml = r#"
request_timeout_ms = 5000

[retry]
max_retries = 5
base_delay_ms = 250
"#;

        let config = ConfigLoader::new()
            .with_source(ConfigSource::Toml(toml.to_string()))
            .load()
            .await
            .expect("load config");

        assert_eq!(config.request_timeout_ms, 5000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 250);
    }

    #[tokio::test]
    async fn test_later_sources_override_only_their_keys() {
        let config = ConfigLoader::new()
            .with_source(ConfigSource::Json(r#"{"cache": {"capacity": 10, "default_ttl_seconds": 60}}"#.to_string()))
            .with_source(ConfigSource::Yaml("cache:\n  capacity: 20\n".to_string()))
            .load()
            .await
            .expect("load config");

        assert_eq!(config.cache.capacity, 20);
        assert_eq!(config.cache.default_ttl_seconds, 60);
    }

    #[tokio::test]
    async fn test_load_default_config() {
        let config = ConfigLoader::new()
            .with_source(ConfigSource::Default)
            .load()
            .await
            .expect("load config");

        assert_eq!(config.rate_limit.burst_size, 10);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = ConfigLoader::new()
            .with_source(ConfigSource::Yaml("rate_limit:\n  burst_size: 0\n".to_string()))
            .load()
            .await;

        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[tokio::test]
    async fn test_load_yaml_file_with_substitution() {
        let file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("create temp file");
        tokio::fs::write(
            file.path(),
            "cache:\n  capacity: ${FETCHGATE_TEST_FILE_CAPACITY:-25}\n",
        )
        .await
        .expect("write config");

        let config = ConfigLoader::new()
            .with_file(file.path().display().to_string())
            .load()
            .await
            .expect("load config");

        assert_eq!(config.cache.capacity, 25);
        assert_eq!(config.cache.default_ttl_seconds, 3600);
    }

    #[tokio::test]
    async fn test_unsupported_extension() {
        let file = tempfile::Builder::new()
            .suffix(".ini")
            .tempfile()
            .expect("create temp file");

        let result = ConfigLoader::new()
            .with_file(file.path().display().to_string())
            .load()
            .await;

        assert!(matches!(result, Err(ConfigError::UnsupportedFormat { .. })));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = ConfigLoader::new()
            .with_file("/nonexistent/fetchgate.yaml")
            .load()
            .await;

        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[tokio::test]
    async fn test_env_overrides() {
        std::env::set_var("FGTEST_OVR_RATE_LIMIT_PER_SECOND", "7.5");
        std::env::set_var("FGTEST_OVR_BURST_SIZE", "3");
        std::env::set_var("FGTEST_OVR_CACHE_CAPACITY", "42");
        std::env::set_var("FGTEST_OVR_CACHE_DEFAULT_TTL_SECONDS", "120");
        std::env::set_var("FGTEST_OVR_MAX_RETRIES", "6");
        std::env::set_var("FGTEST_OVR_BASE_RETRY_DELAY_MS", "50");
        std::env::set_var("FGTEST_OVR_RETRY_BACKOFF_MULTIPLIER", "3.0");
        std::env::set_var("FGTEST_OVR_RETRY_JITTER_FRACTION", "0.5");
        std::env::set_var("FGTEST_OVR_REQUEST_TIMEOUT_MS", "1500");

        let config = ConfigLoader::new()
            .with_source(ConfigSource::Default)
            .with_env_prefix("FGTEST_OVR")
            .load()
            .await
            .expect("load config");

        assert!((config.rate_limit.per_second - 7.5).abs() < f64::EPSILON);
        assert_eq!(config.rate_limit.burst_size, 3);
        assert_eq!(config.cache.capacity, 42);
        assert_eq!(config.cache.default_ttl_seconds, 120);
        assert_eq!(config.retry.max_retries, 6);
        assert_eq!(config.retry.base_delay_ms, 50);
        assert!((config.retry.backoff_multiplier - 3.0).abs() < f64::EPSILON);
        assert!((config.retry.jitter_fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.request_timeout_ms, 1500);

        for key in [
            "RATE_LIMIT_PER_SECOND",
            "BURST_SIZE",
            "CACHE_CAPACITY",
            "CACHE_DEFAULT_TTL_SECONDS",
            "MAX_RETRIES",
            "BASE_RETRY_DELAY_MS",
            "RETRY_BACKOFF_MULTIPLIER",
            "RETRY_JITTER_FRACTION",
            "REQUEST_TIMEOUT_MS",
        ] {
            std::env::remove_var(format!("FGTEST_OVR_{key}"));
        }
    }

    #[tokio::test]
    async fn test_unparseable_env_override() {
        std::env::set_var("FGTEST_BAD_BURST_SIZE", "lots");

        let result = ConfigLoader::new()
            .with_source(ConfigSource::Default)
            .with_env_prefix("FGTEST_BAD")
            .load()
            .await;

        assert!(matches!(result, Err(ConfigError::InvalidEnvValue { .. })));
        std::env::remove_var("FGTEST_BAD_BURST_SIZE");
    }

    #[test]
    fn test_merge_values() {
        let mut base = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_values(&mut base, serde_json::json!({"a": {"c": 20}, "e": 5, "d": null}));
        assert_eq!(base, serde_json::json!({"a": {"b": 1, "c": 20}, "d": 3, "e": 5}));
    }
}
