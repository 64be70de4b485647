//! Composition root.
//!
//! One [`ResilienceContext`] per process owns every shared component. Tests
//! build their own isolated contexts.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::alerts::SystemAlertBus;
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
use crate::classifier::IssueClassifier;
use crate::config::ResilienceConfig;
use crate::error::ResilienceError;
use crate::feature_flags::{FeatureFlagStore, KeyValueStorage, MemoryStorage};
use crate::health::{DatabaseProbe, HealthAggregator, HttpDependencyProbe, SystemHealth};
use crate::idempotency::{
    IdempotencyStore, IdempotencyTracker, InMemoryIdempotencyStore, ServerIdempotency,
};
use crate::logger::{LogContext, Logger};
use crate::metrics::ResilienceMetrics;
use crate::wrapper::{BoundaryWrapper, RequestWrapper, TokenProvider};

/// Shared components for one process.
pub struct ResilienceContext {
    config: ResilienceConfig,
    logger: Arc<Logger>,
    circuits: Arc<CircuitBreakerRegistry>,
    tracker: Arc<IdempotencyTracker>,
    server_idempotency: Arc<ServerIdempotency>,
    flags: Arc<FeatureFlagStore>,
    alerts: Arc<SystemAlertBus>,
    classifier: IssueClassifier,
    metrics: Arc<ResilienceMetrics>,
    health: HealthAggregator,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl std::fmt::Debug for ResilienceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceContext")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .field("tokens", &self.tokens.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ResilienceContext`].
pub struct ContextBuilder {
    config: ResilienceConfig,
    flag_storage: Arc<dyn KeyValueStorage>,
    idempotency_store: Arc<dyn IdempotencyStore>,
    database: Option<Arc<dyn DatabaseProbe>>,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("config", &self.config)
            .field("database", &self.database.is_some())
            .field("tokens", &self.tokens.is_some())
            .finish_non_exhaustive()
    }
}

impl ContextBuilder {
    /// Persist flag overrides in `storage`.
    #[must_use]
    pub fn with_flag_storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.flag_storage = storage;
        self
    }

    /// Keep server idempotency records in `store`.
    #[must_use]
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency_store = store;
        self
    }

    /// Include the database in health checks.
    #[must_use]
    pub fn with_database(mut self, probe: Arc<dyn DatabaseProbe>) -> Self {
        self.database = Some(probe);
        self
    }

    /// Token provider handed to every request wrapper.
    #[must_use]
    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Wire everything together.
    ///
    /// # Errors
    ///
    /// Returns an error if a dependency probe's HTTP client cannot be built.
    pub fn build(self) -> Result<ResilienceContext, ResilienceError> {
        let config = self.config;
        let logger = Arc::new(Logger::new(config.log_buffer_capacity));

        let circuits = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker.clone())
                .with_logger(Arc::clone(&logger)),
        );
        let tracker = Arc::new(
            IdempotencyTracker::new(config.idempotency_client_ttl).with_logger(Arc::clone(&logger)),
        );
        let server_idempotency = Arc::new(
            ServerIdempotency::new(self.idempotency_store, config.idempotency_server_ttl)
                .with_logger(Arc::clone(&logger)),
        );
        let overrides = config.feature_overrides.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        let flags = Arc::new(
            FeatureFlagStore::new(self.flag_storage)
                .with_logger(Arc::clone(&logger))
                .with_env_overrides(overrides),
        );
        let alerts = Arc::new(SystemAlertBus::new().with_logger(Arc::clone(&logger)));
        let classifier = IssueClassifier::new()
            .with_logger(Arc::clone(&logger))
            .with_alerts(Arc::clone(&alerts))
            .with_feature_flags(Arc::clone(&flags));

        let mut health = HealthAggregator::new(Arc::clone(&circuits), Arc::clone(&logger))
            .with_error_threshold(config.health_error_threshold)
            .with_probe_timeout(config.health_probe_timeout)
            .with_version(config.service_version.clone());
        if let Some(database) = self.database {
            health = health.with_database(database);
        }
        for target in &config.health_dependencies {
            health = health.with_dependency(HttpDependencyProbe::with_timeout(
                target.name.clone(),
                target.url.as_str(),
                config.health_probe_timeout,
            )?);
        }

        logger.info(
            "Resilience context ready",
            LogContext::new("resilience")
                .with_metadata("environment", config.environment.as_str())
                .with_metadata("dependencies", config.health_dependencies.len()),
        );

        Ok(ResilienceContext {
            config,
            logger,
            circuits,
            tracker,
            server_idempotency,
            flags,
            alerts,
            classifier,
            metrics: Arc::new(ResilienceMetrics::default()),
            health,
            tokens: self.tokens,
        })
    }
}

impl ResilienceContext {
    /// Builder with in-memory storage.
    #[must_use]
    pub fn builder(config: ResilienceConfig) -> ContextBuilder {
        ContextBuilder {
            config,
            flag_storage: Arc::new(MemoryStorage::new()),
            idempotency_store: Arc::new(InMemoryIdempotencyStore::new()),
            database: None,
            tokens: None,
        }
    }

    /// Context from the process environment with in-memory storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is malformed or a probe cannot be built.
    pub fn from_env() -> Result<Self, ResilienceError> {
        let config = ResilienceConfig::from_env()
            .map_err(|e| ResilienceError::invalid_input(e.to_string()))?;
        Self::builder(config).build()
    }

    /// Outbound wrapper sharing this context's components.
    #[must_use]
    pub fn request_wrapper(&self) -> RequestWrapper {
        let wrapper = RequestWrapper::new(
            Arc::clone(&self.circuits),
            Arc::clone(&self.tracker),
            self.classifier.clone(),
            Arc::clone(&self.logger),
        )
        .with_retry_config(self.config.retry.clone())
        .with_feature_flags(Arc::clone(&self.flags))
        .with_metrics(Arc::clone(&self.metrics));
        match &self.tokens {
            Some(tokens) => wrapper.with_token_provider(Arc::clone(tokens)),
            None => wrapper,
        }
    }

    /// Inbound wrapper sharing this context's components.
    #[must_use]
    pub fn boundary_wrapper(&self) -> BoundaryWrapper {
        BoundaryWrapper::new(
            Arc::clone(&self.flags),
            Arc::clone(&self.server_idempotency),
            self.classifier.clone(),
            Arc::clone(&self.logger),
        )
        .production(self.config.is_production())
        .with_metrics(Arc::clone(&self.metrics))
    }

    /// Aggregate health right now, or `None` when `health_monitoring` is off.
    pub async fn health_check(&self) -> Option<SystemHealth> {
        if !self.flags.is_enabled("health_monitoring") {
            return None;
        }
        Some(self.health.check().await)
    }

    /// Snapshot of every circuit breaker.
    #[must_use]
    pub fn circuit_statuses(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.circuits.statuses()
    }

    /// Metrics as Prometheus text.
    #[must_use]
    pub fn metrics_text(&self) -> String {
        let open = self
            .circuits
            .statuses()
            .values()
            .filter(|snapshot| snapshot.state == CircuitState::Open)
            .count();
        self.metrics.open_circuits.set(open as u64);
        self.metrics.to_prometheus()
    }

    /// Start the client-side idempotency sweeper.
    #[must_use]
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.tracker.spawn_sweeper(self.config.idempotency_sweep_interval)
    }

    /// Resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Shared logger.
    #[must_use]
    pub const fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    /// Circuit breaker registry.
    #[must_use]
    pub const fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    /// Client-side idempotency tracker.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<IdempotencyTracker> {
        &self.tracker
    }

    /// Server-side idempotency.
    #[must_use]
    pub const fn server_idempotency(&self) -> &Arc<ServerIdempotency> {
        &self.server_idempotency
    }

    /// Feature flags.
    #[must_use]
    pub const fn flags(&self) -> &Arc<FeatureFlagStore> {
        &self.flags
    }

    /// System alerts.
    #[must_use]
    pub const fn alerts(&self) -> &Arc<SystemAlertBus> {
        &self.alerts
    }

    /// Issue classifier.
    #[must_use]
    pub const fn classifier(&self) -> &IssueClassifier {
        &self.classifier
    }

    /// Pipeline metrics.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<ResilienceMetrics> {
        &self.metrics
    }
}
