//! Environment-driven configuration.
//!
//! Every setting has a default. Malformed values and values the runtime
//! cannot honour (zero intervals, zero capacities, unbounded lifetimes) are
//! errors.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::feature_flags::ENV_PREFIX;
use crate::health::{DEFAULT_ERROR_THRESHOLD, DEFAULT_PROBE_TIMEOUT};
use crate::idempotency::{DEFAULT_CLIENT_TTL, DEFAULT_SERVER_TTL, DEFAULT_SWEEP_INTERVAL};
use crate::retry::RetryConfig;

/// Longest accepted server-side record lifetime.
pub const MAX_SERVER_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable did not parse
    #[error("Invalid {name}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Parser message
        reason: String,
    },

    /// A `HEALTH_DEPENDENCIES` entry is not `name=url`
    #[error("Invalid HEALTH_DEPENDENCIES entry: {0}")]
    MalformedDependency(String),

    /// A dependency URL did not parse
    #[error("Invalid URL for dependency {name}: {source}")]
    InvalidUrl {
        /// Dependency name
        name: String,
        /// Parser error
        #[source]
        source: url::ParseError,
    },
}

/// Health-check target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTarget {
    /// Name reported in the health output
    pub name: String,
    /// URL probed with GET
    pub url: Url,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// `APP_ENV` value
    pub environment: String,
    /// Service version reported by health checks
    pub service_version: String,
    /// Log ring buffer size
    pub log_buffer_capacity: usize,
    /// Breaker defaults for every dependency
    pub circuit_breaker: CircuitBreakerConfig,
    /// Outbound retry policy
    pub retry: RetryConfig,
    /// Client-side duplicate window
    pub idempotency_client_ttl: Duration,
    /// Client-side sweep period
    pub idempotency_sweep_interval: Duration,
    /// Server-side record lifetime
    pub idempotency_server_ttl: Duration,
    /// Errors per window before health degrades
    pub health_error_threshold: usize,
    /// Timeout for each dependency probe
    pub health_probe_timeout: Duration,
    /// Dependencies probed by the health check
    pub health_dependencies: Vec<DependencyTarget>,
    /// `FEATURE_*` variables, forwarded to the flag store
    pub feature_overrides: Vec<(String, String)>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_buffer_capacity: 500,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            idempotency_client_ttl: DEFAULT_CLIENT_TTL,
            idempotency_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idempotency_server_ttl: DEFAULT_SERVER_TTL,
            health_error_threshold: DEFAULT_ERROR_THRESHOLD,
            health_probe_timeout: DEFAULT_PROBE_TIMEOUT,
            health_dependencies: Vec::new(),
            feature_overrides: Vec::new(),
        }
    }
}

impl ResilienceConfig {
    /// Load from the process environment, reading `.env` first if present.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Load from explicit `(name, value)` pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but malformed.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> =
            vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let env = Vars(&vars);
        let defaults = Self::default();

        let breaker = &defaults.circuit_breaker;
        let circuit_breaker = CircuitBreakerConfig::default()
            .with_failure_threshold(env.parse("CB_FAILURE_THRESHOLD", breaker.failure_threshold)?)
            .with_success_threshold(env.parse("CB_SUCCESS_THRESHOLD", breaker.success_threshold)?)
            .with_reset_timeout(env.millis("CB_RESET_TIMEOUT_MS", breaker.reset_timeout)?);

        let retry = RetryConfig::default()
            .with_max_retries(env.parse("RETRY_MAX_RETRIES", defaults.retry.max_retries)?)
            .with_initial_delay(env.millis("RETRY_INITIAL_DELAY_MS", defaults.retry.initial_delay)?)
            .with_max_delay(env.millis("RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?);

        let mut feature_overrides: Vec<(String, String)> = vars
            .iter()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        feature_overrides.sort();

        let config = Self {
            environment: env.get("APP_ENV").unwrap_or(&defaults.environment).to_string(),
            service_version: env
                .get("SERVICE_VERSION")
                .unwrap_or(&defaults.service_version)
                .to_string(),
            log_buffer_capacity: env.parse("LOG_BUFFER_CAPACITY", defaults.log_buffer_capacity)?,
            circuit_breaker,
            retry,
            idempotency_client_ttl: env
                .secs("IDEMPOTENCY_CLIENT_TTL_SECS", defaults.idempotency_client_ttl)?,
            idempotency_sweep_interval: env
                .secs("IDEMPOTENCY_SWEEP_SECS", defaults.idempotency_sweep_interval)?,
            idempotency_server_ttl: env
                .secs("IDEMPOTENCY_SERVER_TTL_SECS", defaults.idempotency_server_ttl)?,
            health_error_threshold: env
                .parse("HEALTH_ERROR_THRESHOLD", defaults.health_error_threshold)?,
            health_probe_timeout: env
                .millis("HEALTH_PROBE_TIMEOUT_MS", defaults.health_probe_timeout)?,
            health_dependencies: env
                .get("HEALTH_DEPENDENCIES")
                .map_or(Ok(Vec::new()), parse_dependencies)?,
            feature_overrides,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("LOG_BUFFER_CAPACITY", self.log_buffer_capacity == 0)?;
        non_zero("CB_FAILURE_THRESHOLD", self.circuit_breaker.failure_threshold == 0)?;
        non_zero("CB_SUCCESS_THRESHOLD", self.circuit_breaker.success_threshold == 0)?;
        non_zero("IDEMPOTENCY_CLIENT_TTL_SECS", self.idempotency_client_ttl.is_zero())?;
        non_zero("IDEMPOTENCY_SWEEP_SECS", self.idempotency_sweep_interval.is_zero())?;
        non_zero("IDEMPOTENCY_SERVER_TTL_SECS", self.idempotency_server_ttl.is_zero())?;
        non_zero("HEALTH_PROBE_TIMEOUT_MS", self.health_probe_timeout.is_zero())?;
        if self.idempotency_server_ttl > MAX_SERVER_TTL {
            return Err(ConfigError::Invalid {
                name: "IDEMPOTENCY_SERVER_TTL_SECS",
                reason: format!("must not exceed {} seconds", MAX_SERVER_TTL.as_secs()),
            });
        }
        Ok(())
    }

    /// Whether `APP_ENV` names production.
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self.environment.to_lowercase().as_str(), "production" | "prod")
    }
}

fn non_zero(name: &'static str, is_zero: bool) -> Result<(), ConfigError> {
    if is_zero {
        Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        })
    } else {
        Ok(())
    }
}

struct Vars<'a>(&'a HashMap<String, String>);

impl Vars<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn millis(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(name).map_or(Ok(default), |_| self.parse(name, 0_u64).map(Duration::from_millis))
    }

    fn secs(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(name).map_or(Ok(default), |_| self.parse(name, 0_u64).map(Duration::from_secs))
    }
}

/// Parse `name=url,name=url`.
fn parse_dependencies(raw: &str) -> Result<Vec<DependencyTarget>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, url) = entry
                .split_once('=')
                .map(|(n, u)| (n.trim(), u.trim()))
                .filter(|(n, u)| !n.is_empty() && !u.is_empty())
                .ok_or_else(|| ConfigError::MalformedDependency(entry.to_string()))?;
            let url = Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
                name: name.to_string(),
                source,
            })?;
            Ok(DependencyTarget {
                name: name.to_string(),
                url,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let config = ResilienceConfig::from_vars(Vec::<(String, String)>::new())
            .unwrap_or_else(|e| panic!("defaults should load: {e}"));

        assert_eq!(config.environment, "development");
        assert!(!config.is_production());
        assert_eq!(config.log_buffer_capacity, 500);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.idempotency_server_ttl, Duration::from_secs(86_400));
        assert_eq!(config.health_error_threshold, 10);
        assert!(config.health_dependencies.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = ResilienceConfig::from_vars([
            ("APP_ENV", "production"),
            ("SERVICE_VERSION", "2.4.1"),
            ("CB_FAILURE_THRESHOLD", "3"),
            ("CB_RESET_TIMEOUT_MS", "1500"),
            ("RETRY_MAX_RETRIES", "0"),
            ("RETRY_INITIAL_DELAY_MS", "250"),
            ("IDEMPOTENCY_CLIENT_TTL_SECS", "60"),
            ("HEALTH_PROBE_TIMEOUT_MS", "800"),
            ("FEATURE_E_INVOICING", "false"),
        ])
        .unwrap_or_else(|e| panic!("overrides should load: {e}"));

        assert!(config.is_production());
        assert_eq!(config.service_version, "2.4.1");
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(config.idempotency_client_ttl, Duration::from_secs(60));
        assert_eq!(config.health_probe_timeout, Duration::from_millis(800));
        assert_eq!(
            config.feature_overrides,
            vec![("FEATURE_E_INVOICING".to_string(), "false".to_string())]
        );
    }

    #[test]
    fn test_malformed_number_is_an_error() {
        let result = ResilienceConfig::from_vars([("CB_FAILURE_THRESHOLD", "five")]);
        assert!(matches!(result, Err(ConfigError::Invalid { name: "CB_FAILURE_THRESHOLD", .. })));
    }

    #[test]
    fn test_blank_value_uses_default() {
        let config = ResilienceConfig::from_vars([("LOG_BUFFER_CAPACITY", "  ")])
            .unwrap_or_else(|e| panic!("blank value should fall back: {e}"));
        assert_eq!(config.log_buffer_capacity, 500);
    }

    #[test]
    fn test_health_dependencies() {
        let config = ResilienceConfig::from_vars([(
            "HEALTH_DEPENDENCIES",
            "zatca=https://gw.example.com/health, payments = http://localhost:8081/ping",
        )])
        .unwrap_or_else(|e| panic!("dependencies should parse: {e}"));

        let names: Vec<_> = config.health_dependencies.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["zatca", "payments"]);
        assert_eq!(config.health_dependencies[1].url.port(), Some(8081));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        for name in [
            "LOG_BUFFER_CAPACITY",
            "CB_FAILURE_THRESHOLD",
            "CB_SUCCESS_THRESHOLD",
            "IDEMPOTENCY_CLIENT_TTL_SECS",
            "IDEMPOTENCY_SWEEP_SECS",
            "IDEMPOTENCY_SERVER_TTL_SECS",
            "HEALTH_PROBE_TIMEOUT_MS",
        ] {
            match ResilienceConfig::from_vars([(name, "0")]) {
                Err(ConfigError::Invalid { name: rejected, .. }) => assert_eq!(rejected, name),
                other => panic!("{name}=0 should be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_server_ttl_is_capped() {
        let too_long = (MAX_SERVER_TTL.as_secs() + 1).to_string();
        assert!(matches!(
            ResilienceConfig::from_vars([("IDEMPOTENCY_SERVER_TTL_SECS", too_long.as_str())]),
            Err(ConfigError::Invalid {
                name: "IDEMPOTENCY_SERVER_TTL_SECS",
                ..
            })
        ));

        let max = MAX_SERVER_TTL.as_secs().to_string();
        let capped = ResilienceConfig::from_vars([("IDEMPOTENCY_SERVER_TTL_SECS", max.as_str())]);
        assert!(capped.is_ok());
    }

    #[test]
    fn test_bad_dependencies() {
        assert!(matches!(
            ResilienceConfig::from_vars([("HEALTH_DEPENDENCIES", "no-equals-sign")]),
            Err(ConfigError::MalformedDependency(_))
        ));
        assert!(matches!(
            ResilienceConfig::from_vars([("HEALTH_DEPENDENCIES", "svc=not a url")]),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }
}
