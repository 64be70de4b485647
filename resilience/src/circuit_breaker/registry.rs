//! Name-keyed registry of circuit breakers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::logger::{LogContext, Logger};

/// Lazily creates one breaker per dependency name and hands out shared handles.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    defaults: CircuitBreakerConfig,
    logger: Option<Arc<Logger>>,
}

impl CircuitBreakerRegistry {
    /// Registry whose breakers use `defaults` unless told otherwise.
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            defaults,
            logger: None,
        }
    }

    /// Attach a logger to every breaker created from now on.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Breaker for `name`, created with the registry defaults on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.defaults.clone())
    }

    /// Breaker for `name`, created with `config` on first use.
    ///
    /// An existing breaker keeps the configuration it was created with.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let mut breaker = CircuitBreaker::new(name, config);
            if let Some(logger) = &self.logger {
                breaker = breaker.with_logger(Arc::clone(logger));
            }
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    /// Existing breaker for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Snapshot of every breaker, ordered by name.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }

    /// Force one breaker closed. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        let Some(breaker) = self.get(name) else {
            return false;
        };
        breaker.reset();
        true
    }

    /// Force every breaker closed.
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();
        for breaker in &breakers {
            breaker.reset();
        }
        if let Some(logger) = &self.logger {
            logger.info(
                "All circuit breakers reset",
                LogContext::new("circuit_breaker").with_metadata("count", breakers.len()),
            );
        }
    }

    /// Number of registered breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether no breaker has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::error::ResilienceError;

    #[test]
    fn test_same_name_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("inventory");
        let b = registry.get_or_create("inventory");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_existing_breaker_keeps_config() {
        let registry = CircuitBreakerRegistry::default();
        let first = registry.get_or_create_with(
            "tax",
            CircuitBreakerConfig::default().with_failure_threshold(2),
        );
        let second = registry.get_or_create_with(
            "tax",
            CircuitBreakerConfig::default().with_failure_threshold(9),
        );
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 2);
    }

    #[tokio::test]
    async fn test_statuses_and_reset() {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
        );
        let payments = registry.get_or_create("payments");
        registry.get_or_create("inventory");

        let _ = payments
            .execute(|| async { Err::<(), _>(ResilienceError::unavailable("gateway")) })
            .await;

        let statuses = registry.statuses();
        assert_eq!(statuses.keys().cloned().collect::<Vec<_>>(), ["inventory", "payments"]);
        assert_eq!(statuses["payments"].state, CircuitState::Open);

        assert!(registry.reset("payments"));
        assert!(!registry.reset("unknown"));
        assert_eq!(payments.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_all() {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
        )
        .with_logger(Arc::new(Logger::default()));
        for name in ["a", "b"] {
            let _ = registry
                .get_or_create(name)
                .execute(|| async { Err::<(), _>(ResilienceError::unavailable(name)) })
                .await;
        }
        registry.reset_all();
        assert!(registry.statuses().values().all(|s| s.state == CircuitState::Closed));
    }
}
