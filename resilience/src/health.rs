//! On-demand health aggregation.
//!
//! Combines a persistence probe, HTTP dependency probes, circuit breaker
//! state and the logger's recent error count into one [`SystemHealth`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::error::ResilienceError;
use crate::http::{HttpConfig, build_http_client};
use crate::logger::{LogContext, Logger};

/// Window used for error metrics.
pub const ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Errors in the window above which the system is degraded.
pub const DEFAULT_ERROR_THRESHOLD: usize = 10;

/// Default probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health of one component or of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Working
    Healthy,
    /// Working with problems
    Degraded,
    /// Not working
    Unhealthy,
}

/// Result of probing one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    /// Dependency name
    pub name: String,
    /// Status
    pub status: HealthStatus,
    /// Probe round trip
    pub latency_ms: u64,
    /// When the probe finished
    pub timestamp: DateTime<Utc>,
    /// What went wrong
    pub error: Option<String>,
}

/// Error and resource metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    /// Errors per minute over the window
    pub error_rate: f64,
    /// Errors in the window
    pub recent_errors: usize,
    /// Entries held by the logger
    pub buffered_logs: usize,
    /// Resident memory, where the platform reports it
    pub memory_rss_bytes: Option<u64>,
}

/// Aggregate health.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    /// Overall status
    pub status: HealthStatus,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// Seconds since the aggregator was created
    pub uptime_secs: u64,
    /// Service version
    pub version: String,
    /// Per-dependency results
    pub services: Vec<ServiceHealth>,
    /// Circuit breaker snapshots
    pub circuits: BTreeMap<String, CircuitSnapshot>,
    /// Metrics
    pub metrics: HealthMetrics,
}

/// Liveness check for the persistence layer.
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    /// Round-trip the database.
    async fn ping(&self) -> Result<(), ResilienceError>;
}

/// HTTP GET probe for an external dependency.
#[derive(Debug, Clone)]
pub struct HttpDependencyProbe {
    name: String,
    url: String,
    client: Client,
}

impl HttpDependencyProbe {
    /// Probe `url` with the given client.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }

    /// Probe `url` with a dedicated client bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ResilienceError> {
        let client = build_http_client(&HttpConfig::default().with_timeout(timeout))?;
        Ok(Self::new(name, url, client))
    }

    /// Dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Probe once.
    pub async fn check(&self) -> ServiceHealth {
        let started = Instant::now();
        let (status, error) = match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_server_error() => (
                HealthStatus::Degraded,
                Some(format!("HTTP {}", response.status().as_u16())),
            ),
            Ok(_) => (HealthStatus::Healthy, None),
            Err(err) if err.is_timeout() => (HealthStatus::Degraded, Some("timeout".to_string())),
            Err(err) => (HealthStatus::Unhealthy, Some(err.to_string())),
        };
        service_health(&self.name, status, started.elapsed(), error)
    }
}

/// Builds [`SystemHealth`] on demand.
pub struct HealthAggregator {
    database: Option<Arc<dyn DatabaseProbe>>,
    dependencies: Vec<HttpDependencyProbe>,
    circuits: Arc<CircuitBreakerRegistry>,
    logger: Arc<Logger>,
    error_threshold: usize,
    probe_timeout: Duration,
    version: String,
    started: Instant,
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("database", &self.database.is_some())
            .field("dependencies", &self.dependencies)
            .field("error_threshold", &self.error_threshold)
            .field("probe_timeout", &self.probe_timeout)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl HealthAggregator {
    /// Aggregator over the given registry and logger.
    #[must_use]
    pub fn new(circuits: Arc<CircuitBreakerRegistry>, logger: Arc<Logger>) -> Self {
        Self {
            database: None,
            dependencies: Vec::new(),
            circuits,
            logger,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started: Instant::now(),
        }
    }

    /// Probe the database with `probe`.
    #[must_use]
    pub fn with_database(mut self, probe: Arc<dyn DatabaseProbe>) -> Self {
        self.database = Some(probe);
        self
    }

    /// Add an HTTP dependency probe.
    #[must_use]
    pub fn with_dependency(mut self, probe: HttpDependencyProbe) -> Self {
        self.dependencies.push(probe);
        self
    }

    /// Errors in the window above which the system is degraded.
    #[must_use]
    pub const fn with_error_threshold(mut self, threshold: usize) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Upper bound on a database ping.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Reported version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Run every probe and aggregate.
    pub async fn check(&self) -> SystemHealth {
        let mut services = Vec::with_capacity(self.dependencies.len() + 1);
        if let Some(database) = &self.database {
            services.push(probe_database(database.as_ref(), self.probe_timeout).await);
        }
        services.extend(join_all(self.dependencies.iter().map(HttpDependencyProbe::check)).await);

        let recent_errors = self.logger.error_count(ERROR_WINDOW);
        #[allow(clippy::cast_precision_loss)]
        let error_rate = recent_errors as f64 / (ERROR_WINDOW.as_secs_f64() / 60.0);
        let metrics = HealthMetrics {
            error_rate,
            recent_errors,
            buffered_logs: self.logger.len(),
            memory_rss_bytes: resident_memory(),
        };

        let status = overall_status(&services, recent_errors, self.error_threshold);
        let health = SystemHealth {
            status,
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            version: self.version.clone(),
            services,
            circuits: self.circuits.statuses(),
            metrics,
        };
        self.report(&health);
        health
    }

    fn report(&self, health: &SystemHealth) {
        let failing: Vec<&str> = health
            .services
            .iter()
            .filter(|s| s.status != HealthStatus::Healthy)
            .map(|s| s.name.as_str())
            .collect();
        let context = LogContext::new("health")
            .with_metadata("failing", failing.join(","))
            .with_metadata("recent_errors", health.metrics.recent_errors);
        match health.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded => self.logger.warn("System health degraded", context),
            HealthStatus::Unhealthy => self.logger.error("System unhealthy", context),
        }
    }
}

/// Worst probe status, degraded by a high error count.
#[must_use]
pub fn overall_status(
    services: &[ServiceHealth],
    recent_errors: usize,
    error_threshold: usize,
) -> HealthStatus {
    let worst = services
        .iter()
        .map(|s| s.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);
    if worst == HealthStatus::Healthy && recent_errors > error_threshold {
        return HealthStatus::Degraded;
    }
    worst
}

async fn probe_database(probe: &dyn DatabaseProbe, timeout: Duration) -> ServiceHealth {
    let started = Instant::now();
    let (status, error) = match tokio::time::timeout(timeout, probe.ping()).await {
        Ok(Ok(())) => (HealthStatus::Healthy, None),
        Ok(Err(err)) => (HealthStatus::Unhealthy, Some(err.to_string())),
        Err(_) => (
            HealthStatus::Unhealthy,
            Some(format!("timed out after {}ms", timeout.as_millis())),
        ),
    };
    service_health("database", status, started.elapsed(), error)
}

fn service_health(
    name: &str,
    status: HealthStatus,
    latency: Duration,
    error: Option<String>,
) -> ServiceHealth {
    ServiceHealth {
        name: name.to_string(),
        status,
        latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        timestamp: Utc::now(),
        error,
    }
}

/// Resident set size from `/proc/self/status`, on Linux.
fn resident_memory() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticProbe(bool);

    #[async_trait]
    impl DatabaseProbe for StaticProbe {
        async fn ping(&self) -> Result<(), ResilienceError> {
            if self.0 {
                Ok(())
            } else {
                Err(ResilienceError::storage("connection refused"))
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl DatabaseProbe for HangingProbe {
        async fn ping(&self) -> Result<(), ResilienceError> {
            std::future::pending().await
        }
    }

    fn aggregator(logger: Arc<Logger>) -> HealthAggregator {
        HealthAggregator::new(Arc::new(CircuitBreakerRegistry::default()), logger)
    }

    fn probe(server: &MockServer, route: &str, timeout: Duration) -> HttpDependencyProbe {
        let url = format!("{}{route}", server.uri());
        HttpDependencyProbe::with_timeout("supplier_api", url, timeout)
            .unwrap_or_else(|err| panic!("client: {err}"))
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let health = aggregator(Arc::new(Logger::default()))
            .with_database(Arc::new(StaticProbe(true)))
            .with_dependency(probe(&server, "/health", Duration::from_secs(2)))
            .check()
            .await;

        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.services.len(), 2);
        assert_eq!(health.metrics.recent_errors, 0);
    }

    #[tokio::test]
    async fn test_database_down_is_unhealthy() {
        let logger = Arc::new(Logger::default());
        let health = aggregator(Arc::clone(&logger))
            .with_database(Arc::new(StaticProbe(false)))
            .check()
            .await;

        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.services[0].name, "database");
        assert!(health.services[0].error.is_some());
        assert_eq!(logger.error_count(ERROR_WINDOW), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_database_times_out_as_unhealthy() {
        let health = aggregator(Arc::new(Logger::default()))
            .with_database(Arc::new(HangingProbe))
            .with_probe_timeout(Duration::from_millis(250))
            .check()
            .await;

        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.services[0].name, "database");
        assert_eq!(health.services[0].error.as_deref(), Some("timed out after 250ms"));
    }

    #[tokio::test]
    async fn test_server_error_is_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let health = aggregator(Arc::new(Logger::default()))
            .with_dependency(probe(&server, "/", Duration::from_secs(2)))
            .check()
            .await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.services[0].error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_slow_dependency_is_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let result = probe(&server, "/", Duration::from_millis(100)).check().await;
        assert_eq!(result.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_unreachable_dependency_is_unhealthy() {
        let probe =
            HttpDependencyProbe::with_timeout("tax", "http://127.0.0.1:9/", Duration::from_secs(2))
                .unwrap_or_else(|err| panic!("client: {err}"));
        assert_eq!(probe.check().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_error_count_degrades() {
        let logger = Arc::new(Logger::default());
        for i in 0..11 {
            logger.error(format!("failure {i}"), LogContext::new("sales"));
        }
        let health = aggregator(Arc::clone(&logger))
            .with_database(Arc::new(StaticProbe(true)))
            .check()
            .await;

        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.metrics.recent_errors, 11);
    }

    #[tokio::test]
    async fn test_ten_errors_still_healthy() {
        let logger = Arc::new(Logger::default());
        for _ in 0..10 {
            logger.error("failure", LogContext::new("sales"));
        }
        let health = aggregator(logger).check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_overall_status_worst_wins() {
        let ok = service_health("a", HealthStatus::Healthy, Duration::ZERO, None);
        let bad = service_health("b", HealthStatus::Unhealthy, Duration::ZERO, None);
        assert_eq!(overall_status(&[ok.clone(), bad], 0, 10), HealthStatus::Unhealthy);
        assert_eq!(overall_status(&[ok], 0, 10), HealthStatus::Healthy);
        assert_eq!(overall_status(&[], 11, 10), HealthStatus::Degraded);
    }

    #[test]
    fn test_serializes_lowercase_status() {
        let json = serde_json::to_value(HealthStatus::Degraded).ok();
        assert_eq!(json, Some(serde_json::json!("degraded")));
    }
}
