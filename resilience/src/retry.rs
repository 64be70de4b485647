//! Retry executor with exponential backoff.
//!
//! `delay = min(initial_delay * multiplier^attempt, max_delay)`, optionally
//! perturbed by up to ±25% jitter. Non-retryable errors are returned on the
//! first failure.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::ResilienceError;
use crate::logger::{LogContext, Logger};

/// Fraction of the computed delay that jitter may add or remove.
pub const JITTER_FRACTION: f64 = 0.25;

/// Predicate deciding whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

/// Retry policy configuration.
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
    /// Retryability predicate
    pub is_retryable: RetryPredicate,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            is_retryable: Arc::new(ResilienceError::is_retryable),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom max retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Create a new retry config with custom initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Create a new retry config with custom max delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Create a new retry config with a custom backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Create a new retry config without jitter.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Replace the retryability predicate.
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }
}

/// Retry policy for executing operations with automatic retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    logger: Option<Arc<Logger>>,
    label: String,
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            logger: None,
            label: "retry".to_string(),
        }
    }

    /// Create a retry policy with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Report retries and recoveries through the given logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Name the operation in log records.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Calculate the delay before retry number `attempt + 1`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_ms = self.config.initial_delay.as_secs_f64()
            * 1000.0
            * self.config.multiplier.powi(exponent);
        let mut delay_ms = base_ms.min(self.config.max_delay.as_secs_f64() * 1000.0);

        if self.config.jitter {
            let spread: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
            delay_ms += delay_ms * JITTER_FRACTION * spread;
        }

        Duration::from_millis(delay_ms.max(0.0).round() as u64)
    }

    /// Check if an error should be retried after `attempt` retries.
    #[must_use]
    pub fn should_retry(&self, error: &ResilienceError, attempt: u32) -> bool {
        attempt < self.config.max_retries && (self.config.is_retryable)(error)
    }

    /// Execute an async operation with retries.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the last error once retries
    /// are exhausted.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        self.report_recovery(attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !(self.config.is_retryable)(&error) {
                        return Err(error);
                    }
                    if attempt >= self.config.max_retries {
                        self.report_exhausted(attempt, &error);
                        return Err(error);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    self.report_retry(attempt + 1, delay, &error);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Get the maximum number of retries.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn context(&self) -> LogContext {
        LogContext::new("retry").with_action(self.label.clone())
    }

    fn report_retry(&self, attempt: u32, delay: Duration, error: &ResilienceError) {
        if let Some(logger) = &self.logger {
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            logger.warn(
                format!("Retrying {} after failure: {error}", self.label),
                self.context()
                    .with_metadata("attempt", attempt)
                    .with_metadata("max_retries", self.config.max_retries)
                    .with_metadata("delay_ms", delay_ms),
            );
        }
    }

    fn report_recovery(&self, retries: u32) {
        if let Some(logger) = &self.logger {
            logger.info(
                format!("{} recovered after retry", self.label),
                self.context().with_metadata("attempt", retries + 1),
            );
        }
    }

    fn report_exhausted(&self, retries: u32, error: &ResilienceError) {
        if let Some(logger) = &self.logger {
            logger.error(
                format!("{} failed after {retries} retries: {error}", self.label),
                self.context().with_metadata("attempt", retries + 1),
            );
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Run `operation` under a one-off retry policy.
///
/// # Errors
///
/// Same as [`RetryPolicy::execute`].
pub async fn retry_with_backoff<F, Fut, T>(
    config: RetryConfig,
    operation: F,
) -> Result<T, ResilienceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ResilienceError>>,
{
    RetryPolicy::new(config).execute(operation).await
}
