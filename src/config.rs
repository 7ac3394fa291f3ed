//! Framework configuration
//!
//! Loaded from TOML with every field defaulted, then optionally overridden
//! from `LEDGER_CTX_*` environment variables (a `.env` file is honoured).

use crate::cache::CachePolicy;
use crate::ledger::SendOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid environment variable {name}: {reason}")]
    InvalidEnvVar { name: String, reason: String },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    pub cache: CacheConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Age in milliseconds after which a cached read refetches
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Window in milliseconds in which a no-cache read may join a recent call
    #[serde(default)]
    pub dedup_window_ms: u64,

    /// How long an address that resolved to nothing is remembered; defaults to `ttl_ms`
    #[serde(default)]
    pub address_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on submissions per chained execution
    #[serde(default = "default_max_chain_iterations")]
    pub max_chain_iterations: usize,

    #[serde(default)]
    pub skip_preflight: bool,

    /// Delivery retries delegated to the transport
    #[serde(default)]
    pub max_retries: Option<usize>,

    #[serde(default)]
    pub simulate_before_send: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_ttl_ms() -> u64 {
    10_000
}

fn default_max_chain_iterations() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            dedup_window_ms: 0,
            address_ttl_ms: None,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_chain_iterations: default_max_chain_iterations(),
            skip_preflight: false,
            max_retries: None,
            simulate_before_send: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            cache_ttl: Duration::from_millis(config.ttl_ms),
            dedup_window: Duration::from_millis(config.dedup_window_ms),
            null_address_ttl: Duration::from_millis(config.address_ttl_ms.unwrap_or(config.ttl_ms)),
        }
    }
}

impl ExecutionConfig {
    /// Send options implied by this configuration
    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            skip_preflight: self.skip_preflight,
            max_retries: self.max_retries,
            simulate_first: self.simulate_before_send,
        }
    }
}

impl FrameworkConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load a TOML file (or defaults when `path` is `None`), then apply
    /// `.env` and process environment overrides
    pub fn from_file_with_env<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply `LEDGER_CTX_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("LEDGER_CTX_CACHE_TTL_MS") {
            self.cache.ttl_ms = parse_env("LEDGER_CTX_CACHE_TTL_MS", &value)?;
        }
        if let Some(value) = lookup("LEDGER_CTX_DEDUP_WINDOW_MS") {
            self.cache.dedup_window_ms = parse_env("LEDGER_CTX_DEDUP_WINDOW_MS", &value)?;
        }
        if let Some(value) = lookup("LEDGER_CTX_ADDRESS_TTL_MS") {
            self.cache.address_ttl_ms = Some(parse_env("LEDGER_CTX_ADDRESS_TTL_MS", &value)?);
        }
        if let Some(value) = lookup("LEDGER_CTX_MAX_CHAIN_ITERATIONS") {
            self.execution.max_chain_iterations =
                parse_env("LEDGER_CTX_MAX_CHAIN_ITERATIONS", &value)?;
        }
        if let Some(value) = lookup("LEDGER_CTX_SKIP_PREFLIGHT") {
            self.execution.skip_preflight = parse_env("LEDGER_CTX_SKIP_PREFLIGHT", &value)?;
        }
        if let Some(value) = lookup("LEDGER_CTX_SIMULATE_BEFORE_SEND") {
            self.execution.simulate_before_send =
                parse_env("LEDGER_CTX_SIMULATE_BEFORE_SEND", &value)?;
        }
        if let Some(value) = lookup("LEDGER_CTX_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = lookup("LEDGER_CTX_LOG_JSON") {
            self.logging.json = parse_env("LEDGER_CTX_LOG_JSON", &value)?;
        }
        self.validate()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.dedup_window_ms > self.cache.ttl_ms {
            return Err(ConfigError::Validation(format!(
                "dedup_window_ms ({}) must not exceed ttl_ms ({})",
                self.cache.dedup_window_ms, self.cache.ttl_ms
            )));
        }
        if self.execution.max_chain_iterations == 0 {
            return Err(ConfigError::Validation(
                "max_chain_iterations must be > 0".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Validation("logging.level is empty".to_string()));
        }
        Ok(())
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::from(&self.cache)
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnvVar {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = FrameworkConfig::default();
        assert_eq!(config.cache.ttl_ms, 10_000);
        assert_eq!(config.cache.dedup_window_ms, 0);
        assert_eq!(config.execution.max_chain_iterations, 64);
        assert_eq!(config.logging.level, "info");

        let policy = config.cache_policy();
        assert_eq!(policy.cache_ttl, Duration::from_secs(10));
        assert_eq!(policy.null_address_ttl, Duration::from_secs(10));
        assert!(policy.dedup_window.is_zero());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = FrameworkConfig::from_toml_str(
            r#"
            [cache]
            ttl_ms = 2500
            address_ttl_ms = 500

            [execution]
            simulate_before_send = true
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.ttl_ms, 2500);
        assert_eq!(config.cache_policy().null_address_ttl, Duration::from_millis(500));
        assert_eq!(config.execution.max_chain_iterations, 64);
        assert!(config.execution.send_options().simulate_first);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"\njson = true").unwrap();

        let config = FrameworkConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);

        let missing = FrameworkConfig::from_toml_file("/nonexistent/ledger-ctx.toml");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = FrameworkConfig::from_toml_str("[execution]\nmax_chain_iterations = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err =
            FrameworkConfig::from_toml_str("[cache]\nttl_ms = 100\ndedup_window_ms = 200").unwrap_err();
        assert!(err.to_string().contains("dedup_window_ms"));

        assert!(matches!(
            FrameworkConfig::from_toml_str("[cache\nttl_ms = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LEDGER_CTX_CACHE_TTL_MS", "30000"),
            ("LEDGER_CTX_DEDUP_WINDOW_MS", "250"),
            ("LEDGER_CTX_MAX_CHAIN_ITERATIONS", "8"),
            ("LEDGER_CTX_LOG_LEVEL", "ledger_context=trace"),
        ]
        .into_iter()
        .collect();

        let mut config = FrameworkConfig::default();
        config
            .apply_env_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cache.ttl_ms, 30_000);
        assert_eq!(config.cache.dedup_window_ms, 250);
        assert_eq!(config.execution.max_chain_iterations, 8);
        assert_eq!(config.logging.level, "ledger_context=trace");
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = FrameworkConfig::default();
        let err = config
            .apply_env_overrides(|name| {
                (name == "LEDGER_CTX_SKIP_PREFLIGHT").then(|| "sometimes".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { .. }));
    }
}
