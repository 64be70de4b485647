//! Per-dependency circuit breaker.
//!
//! Protects the platform from hammering a dependency that keeps failing.
//! Breakers are shared by name through [`CircuitBreakerRegistry`] so every
//! call site hitting the same dependency drives one state machine.

mod registry;
mod state;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::ResilienceError;
use crate::logger::{LogContext, Logger};

pub use registry::CircuitBreakerRegistry;
pub use state::{Admission, CircuitBreakerState, CircuitState, Transition};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before admitting a trial call
    pub reset_timeout: Duration,
    /// Number of consecutive half-open successes that close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with custom failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Create a new config with custom success threshold.
    #[must_use]
    pub const fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Create a new config with custom reset timeout.
    #[must_use]
    pub const fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Point-in-time view of a breaker for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Dependency name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while CLOSED
    pub failure_count: u32,
    /// Consecutive successes while HALF_OPEN
    pub success_count: u32,
    /// Wall-clock time of the failure that last opened the circuit
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Configured failure threshold
    pub failure_threshold: u32,
    /// Configured success threshold
    pub success_threshold: u32,
    /// Configured reset timeout in milliseconds
    pub reset_timeout_ms: u64,
}

/// Circuit breaker for one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    logger: Option<Arc<Logger>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitBreakerState::new()),
            logger: None,
        }
    }

    /// Create a circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Report transitions through the given logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Run `operation` under circuit protection.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without running the operation
    /// while the circuit is open, otherwise the operation's own error.
    /// A [`ResilienceError::Cancelled`] outcome is not counted against the
    /// dependency.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let (admission, transition) =
            self.state.lock().admit(Instant::now(), self.config.reset_timeout);
        self.report(transition);

        let (trial, epoch) = match admission {
            Admission::Allowed { trial, epoch } => (trial, epoch),
            Admission::Rejected { retry_after } => {
                return Err(ResilienceError::circuit_open(&self.name, retry_after));
            }
        };

        let mut guard = TrialGuard {
            state: &self.state,
            epoch,
            armed: trial,
        };
        let result = operation().await;
        if matches!(result, Err(ResilienceError::Cancelled)) {
            return result;
        }
        guard.armed = false;

        let transition = {
            let mut state = self.state.lock();
            match &result {
                Ok(_) => state.record_success(epoch, self.config.success_threshold),
                Err(_) => {
                    state.record_failure(epoch, self.config.failure_threshold, Instant::now())
                }
            }
        };
        self.report(transition);

        result
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Diagnostics snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_at: state.last_failure_at,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            reset_timeout_ms: u64::try_from(self.config.reset_timeout.as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Force the circuit back to CLOSED.
    pub fn reset(&self) {
        self.state.lock().reset();
        if let Some(logger) = &self.logger {
            logger.info(
                format!("Circuit {} manually reset", self.name),
                self.context(),
            );
        }
    }

    fn context(&self) -> LogContext {
        LogContext::new("circuit_breaker").with_metadata("circuit", self.name.clone())
    }

    fn report(&self, transition: Option<Transition>) {
        let (Some(transition), Some(logger)) = (transition, &self.logger) else {
            return;
        };
        match transition {
            Transition::Opened { failures } => logger.error(
                format!("Circuit {} opened after {failures} consecutive failures", self.name),
                self.context().with_metadata("failures", failures),
            ),
            Transition::HalfOpened => logger.info(
                format!("Circuit {} half-open, admitting trial request", self.name),
                self.context(),
            ),
            Transition::Closed => logger.info(
                format!("Circuit {} recovered and closed", self.name),
                self.context(),
            ),
            Transition::Reopened => logger.warn(
                format!("Circuit {} re-opened after failed trial", self.name),
                self.context(),
            ),
        }
    }
}

/// Releases the half-open trial slot if the call ends without an outcome.
struct TrialGuard<'a> {
    state: &'a Mutex<CircuitBreakerState>,
    epoch: u64,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().abandon_trial(self.epoch);
        }
    }
}
