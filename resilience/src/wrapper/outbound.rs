//! Protected outbound calls.
//!
//! Pipeline: token freshness, idempotency gate, circuit breaker, retry loop,
//! raw call. Terminal failures are classified and major ones raise an alert.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::{ClassifiedIssue, ClassifyContext, IssueCategory, IssueClassifier, Severity};
use crate::error::ResilienceError;
use crate::feature_flags::FeatureFlagStore;
use crate::idempotency::{IdempotencyTracker, OperationClaim, OperationState};
use crate::logger::{LogContext, Logger};
use crate::metrics::ResilienceMetrics;
use crate::retry::{RetryConfig, RetryPolicy};

/// Session token lifecycle, owned by the auth layer.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Whether the token is close to expiry.
    async fn needs_refresh(&self) -> bool;

    /// Obtain a fresh token.
    async fn refresh(&self) -> Result<(), ResilienceError>;

    /// End the session after an unrecoverable auth failure.
    async fn sign_out(&self);
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Dependency name; also the circuit breaker name
    pub dependency: String,
    /// Business module, for classification
    pub module: String,
    /// Logical action, for logs
    pub action: Option<String>,
    /// Idempotency key for mutations
    pub idempotency_key: Option<String>,
    /// Retry transient failures
    pub retry: bool,
    /// Gate the call through the dependency's circuit breaker
    pub circuit_breaker: bool,
    /// Abort the raw call when cancelled
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    /// Options for calling `dependency` from `module`.
    #[must_use]
    pub fn new(dependency: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            module: module.into(),
            action: None,
            idempotency_key: None,
            retry: true,
            circuit_breaker: true,
            cancel: None,
        }
    }

    /// Name the action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Deduplicate by `key`.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Skip the retry loop.
    #[must_use]
    pub const fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Skip the circuit breaker.
    #[must_use]
    pub const fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = false;
        self
    }

    /// Abort when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn classify_context(&self) -> ClassifyContext {
        let ctx = ClassifyContext::new(self.module.clone());
        match &self.action {
            Some(action) => ctx.with_action(action.clone()),
            None => ctx,
        }
    }
}

/// Composes token refresh, idempotency, circuit breaking, retry and
/// classification around outbound calls.
#[derive(Clone)]
pub struct RequestWrapper {
    circuits: Arc<CircuitBreakerRegistry>,
    tracker: Arc<IdempotencyTracker>,
    classifier: IssueClassifier,
    retry: RetryConfig,
    logger: Arc<Logger>,
    tokens: Option<Arc<dyn TokenProvider>>,
    flags: Option<Arc<FeatureFlagStore>>,
    metrics: Option<Arc<ResilienceMetrics>>,
}

impl std::fmt::Debug for RequestWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestWrapper")
            .field("retry", &self.retry)
            .field("tokens", &self.tokens.is_some())
            .finish_non_exhaustive()
    }
}

impl RequestWrapper {
    /// Wrapper over shared components.
    #[must_use]
    pub fn new(
        circuits: Arc<CircuitBreakerRegistry>,
        tracker: Arc<IdempotencyTracker>,
        classifier: IssueClassifier,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            circuits,
            tracker,
            classifier,
            retry: RetryConfig::default(),
            logger,
            tokens: None,
            flags: None,
            metrics: None,
        }
    }

    /// Retry settings for every call.
    #[must_use]
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Refresh tokens before calls and after 401s.
    #[must_use]
    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Honour the `circuit_breaker`, `request_retry` and `idempotency_keys` flags.
    #[must_use]
    pub fn with_feature_flags(mut self, flags: Arc<FeatureFlagStore>) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Count requests, failures and rejections.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ResilienceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send a call through the pipeline.
    ///
    /// `call` may run several times: once per retry, and once more after a
    /// successful token refresh following a 401.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::Duplicate`] while the same idempotency key is in
    /// flight, [`ResilienceError::Cancelled`] when the caller cancelled,
    /// otherwise [`ResilienceError::Classified`] for any terminal failure.
    ///
    /// Dropping the returned future releases a claimed idempotency key.
    pub async fn send<T, F, Fut>(
        &self,
        options: RequestOptions,
        call: F,
    ) -> Result<T, ResilienceError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let ctx = options.classify_context();
        self.record(|m| m.requests.inc());

        if let Some(tokens) = &self.tokens {
            if tokens.needs_refresh().await {
                if let Err(err) = tokens.refresh().await {
                    return Err(self.session_expired(tokens.as_ref(), &err, &ctx).await);
                }
            }
        }

        let key = options
            .idempotency_key
            .as_deref()
            .filter(|_| self.flag_enabled("idempotency_keys"));
        let claim = match key.map(|key| self.claim(key)).transpose()? {
            Some(Claim::Cached(cached)) => return Ok(cached),
            Some(Claim::Owned(claim)) => Some(claim),
            None => None,
        };

        let mut result = self.attempt(&options, &call).await;

        let unauthorized = matches!(&result, Err(err) if is_unauthorized(err));
        if let Some(tokens) = self.tokens.as_ref().filter(|_| unauthorized) {
            match tokens.refresh().await {
                Ok(()) => {
                    self.logger.info(
                        "Token refreshed after 401, replaying request",
                        self.context(&options),
                    );
                    result = self.attempt(&options, &call).await;
                }
                Err(refresh_err) => {
                    drop(claim);
                    return Err(self.session_expired(tokens.as_ref(), &refresh_err, &ctx).await);
                }
            }
        }

        match result {
            Ok(value) => {
                if let Some(claim) = claim {
                    claim.complete(serde_json::to_value(&value).ok());
                }
                Ok(value)
            }
            Err(ResilienceError::Cancelled) => {
                drop(claim);
                self.logger.info("Request cancelled by caller", self.context(&options));
                Err(ResilienceError::Cancelled)
            }
            Err(err) => {
                drop(claim);
                self.record(|m| m.request_failures.inc());
                if matches!(err, ResilienceError::CircuitOpen { .. }) {
                    self.record(|m| m.circuit_rejections.inc());
                }
                Err(self.fail(&err, &ctx))
            }
        }
    }

    /// Cached result for a completed key, or claim the key for this call.
    fn claim<T: DeserializeOwned>(&self, key: &str) -> Result<Claim<'_, T>, ResilienceError> {
        match self.tracker.state(key) {
            Some(OperationState::Completed(Some(cached))) => {
                self.record(|m| m.duplicates_prevented.inc());
                Ok(Claim::Cached(serde_json::from_value(cached)?))
            }
            Some(_) => Err(self.duplicate(key)),
            None => self
                .tracker
                .claim(key)
                .map(Claim::Owned)
                .ok_or_else(|| self.duplicate(key)),
        }
    }

    fn duplicate(&self, key: &str) -> ResilienceError {
        self.record(|m| m.duplicates_prevented.inc());
        ResilienceError::Duplicate { key: key.to_string() }
    }

    async fn attempt<T, F, Fut>(
        &self,
        options: &RequestOptions,
        call: &F,
    ) -> Result<T, ResilienceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let once = || cancellable(options.cancel.as_ref(), call());
        let retrying = || async {
            if options.retry && self.flag_enabled("request_retry") {
                RetryPolicy::new(self.retry.clone())
                    .with_logger(Arc::clone(&self.logger))
                    .with_label(options.dependency.clone())
                    .execute(once)
                    .await
            } else {
                once().await
            }
        };

        if options.circuit_breaker && self.flag_enabled("circuit_breaker") {
            self.circuits.get_or_create(&options.dependency).execute(retrying).await
        } else {
            retrying().await
        }
    }

    async fn session_expired(
        &self,
        tokens: &dyn TokenProvider,
        err: &ResilienceError,
        ctx: &ClassifyContext,
    ) -> ResilienceError {
        self.logger.warn(
            format!("Token refresh failed, signing out: {err}"),
            LogContext::new(ctx.module.clone()),
        );
        tokens.sign_out().await;
        let issue = ClassifiedIssue {
            severity: Severity::Minor,
            category: IssueCategory::AuthFailure,
            message: err.to_string(),
            user_message: self.classifier.user_message(IssueCategory::AuthFailure),
            auto_recoverable: true,
            requires_developer: false,
            module: ctx.module.clone(),
            timestamp: chrono::Utc::now(),
        };
        issue.into()
    }

    fn fail(&self, err: &ResilienceError, ctx: &ClassifyContext) -> ResilienceError {
        let issue = self.classifier.classify_error(err, ctx);
        if issue.is_major()
            && self.flag_enabled("system_alerts")
            && self.classifier.escalate(&issue).is_some()
        {
            self.record(|m| m.alerts_emitted.inc());
        }
        issue.into()
    }

    fn flag_enabled(&self, name: &str) -> bool {
        self.flags.as_ref().is_none_or(|flags| flags.is_enabled(name))
    }

    fn record(&self, f: impl FnOnce(&ResilienceMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    fn context(&self, options: &RequestOptions) -> LogContext {
        let ctx = LogContext::new(options.module.clone())
            .with_metadata("dependency", options.dependency.clone());
        match &options.action {
            Some(action) => ctx.with_action(action.clone()),
            None => ctx,
        }
    }
}

enum Claim<'a, T> {
    Cached(T),
    Owned(OperationClaim<'a>),
}

async fn cancellable<T, Fut>(
    token: Option<&CancellationToken>,
    call: Fut,
) -> Result<T, ResilienceError>
where
    Fut: Future<Output = Result<T, ResilienceError>>,
{
    match token {
        Some(token) => {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(ResilienceError::Cancelled),
                result = call => result,
            }
        }
        None => call.await,
    }
}

fn is_unauthorized(err: &ResilienceError) -> bool {
    matches!(err, ResilienceError::AuthFailed(_)) || err.status_code() == Some(401)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::SystemAlertBus;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTokens {
        stale: AtomicBool,
        refresh_fails: bool,
        refreshes: AtomicU32,
        signed_out: AtomicBool,
    }

    #[async_trait]
    impl TokenProvider for FakeTokens {
        async fn needs_refresh(&self) -> bool {
            self.stale.load(Ordering::SeqCst)
        }

        async fn refresh(&self) -> Result<(), ResilienceError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.refresh_fails {
                return Err(ResilienceError::AuthFailed("refresh token revoked".into()));
            }
            self.stale.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn sign_out(&self) {
            self.signed_out.store(true, Ordering::SeqCst);
        }
    }

    fn wrapper() -> RequestWrapper {
        let logger = Arc::new(Logger::default());
        RequestWrapper::new(
            Arc::new(CircuitBreakerRegistry::new(
                CircuitBreakerConfig::default().with_failure_threshold(2),
            )),
            Arc::new(IdempotencyTracker::default()),
            IssueClassifier::new(),
            logger,
        )
        .with_retry_config(
            RetryConfig::default()
                .with_max_retries(2)
                .with_initial_delay(Duration::from_millis(10))
                .without_jitter(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = wrapper()
            .send(RequestOptions::new("inventory", "inventory"), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ResilienceError::unavailable("inventory api"))
                } else {
                    Ok(7_u32)
                }
            })
            .await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_is_classified() {
        let bus = Arc::new(SystemAlertBus::new());
        let metrics = Arc::new(ResilienceMetrics::default());
        let wrapper = RequestWrapper::new(
            Arc::new(CircuitBreakerRegistry::default()),
            Arc::new(IdempotencyTracker::default()),
            IssueClassifier::new().with_alerts(Arc::clone(&bus)),
            Arc::new(Logger::default()),
        )
        .with_metrics(Arc::clone(&metrics));

        let result: Result<u32, _> = wrapper
            .send(RequestOptions::new("gateway", "payment"), || async {
                Err(ResilienceError::status(402, "card declined"))
            })
            .await;

        let issue = result.err().and_then(|err| err.issue().cloned());
        assert_eq!(issue.map(|i| i.category), Some(IssueCategory::PaymentError));
        assert_eq!(bus.active().len(), 1);
        assert_eq!(metrics.request_failures.get(), 1);
        assert_eq!(metrics.alerts_emitted.get(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_replay_and_in_flight() {
        let wrapper = wrapper();
        let calls = AtomicU32::new(0);
        let options =
            RequestOptions::new("orders", "purchase_orders").with_idempotency_key("po-42");
        let call = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ResilienceError>(String::from("PO-42"))
        };

        assert_eq!(wrapper.send(options.clone(), call).await.ok().as_deref(), Some("PO-42"));
        assert_eq!(wrapper.send(options.clone(), call).await.ok().as_deref(), Some("PO-42"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        wrapper.tracker.start_operation("po-43");
        let duplicate = wrapper
            .send(options.with_idempotency_key("po-43"), call)
            .await;
        assert!(matches!(duplicate, Err(ResilienceError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_and_replays_once() {
        let tokens = Arc::new(FakeTokens::default());
        let wrapper = wrapper().with_token_provider(tokens.clone());
        let calls = AtomicU32::new(0);

        let result = wrapper
            .send(RequestOptions::new("pos", "sales").without_retry(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ResilienceError::status(401, "jwt expired"))
                } else {
                    Ok(true)
                }
            })
            .await;

        assert_eq!(result.ok(), Some(true));
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_signs_out() {
        let tokens = Arc::new(FakeTokens {
            stale: AtomicBool::new(true),
            refresh_fails: true,
            ..FakeTokens::default()
        });
        let wrapper = wrapper().with_token_provider(tokens.clone());

        let result: Result<(), _> = wrapper
            .send(RequestOptions::new("pos", "sales"), || async { Ok(()) })
            .await;

        let issue = result.err().and_then(|err| err.issue().cloned());
        assert_eq!(issue.map(|i| i.category), Some(IssueCategory::AuthFailure));
        assert!(tokens.signed_out.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let wrapper = wrapper();
        let calls = AtomicU32::new(0);
        let options = RequestOptions::new("tax", "e_invoicing").without_retry();
        for _ in 0..2 {
            let _: Result<(), _> = wrapper
                .send(options.clone(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ResilienceError::unavailable("tax authority"))
                })
                .await;
        }

        let rejected: Result<(), _> = wrapper
            .send(options, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(rejected.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_dependency_failure() {
        let bus = Arc::new(SystemAlertBus::new());
        let metrics = Arc::new(ResilienceMetrics::default());
        let circuits = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(2),
        ));
        let wrapper = RequestWrapper::new(
            Arc::clone(&circuits),
            Arc::new(IdempotencyTracker::default()),
            IssueClassifier::new().with_alerts(Arc::clone(&bus)),
            Arc::new(Logger::default()),
        )
        .with_metrics(Arc::clone(&metrics));

        let token = CancellationToken::new();
        token.cancel();
        for _ in 0..3 {
            let result: Result<(), _> = wrapper
                .send(
                    RequestOptions::new("printer", "cash_register")
                        .with_idempotency_key("receipt-5")
                        .with_cancellation(token.clone()),
                    || std::future::pending(),
                )
                .await;
            assert!(matches!(result, Err(ResilienceError::Cancelled)));
        }

        assert!(bus.all().is_empty());
        assert_eq!(metrics.request_failures.get(), 0);
        assert_eq!(circuits.get_or_create("printer").state(), crate::CircuitState::Closed);
        assert!(wrapper.tracker.state("receipt-5").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_send_releases_idempotency_key() {
        let wrapper = wrapper();
        let options = RequestOptions::new("orders", "purchase_orders").with_idempotency_key("po-1");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            wrapper.send(options.clone(), std::future::pending::<Result<u32, ResilienceError>>),
        )
        .await;
        assert!(abandoned.is_err());

        let retried = wrapper
            .send(options, || async { Ok::<_, ResilienceError>(1_u32) })
            .await;
        assert_eq!(retried.ok(), Some(1));
    }

    #[tokio::test]
    async fn test_disabled_flag_skips_breaker() {
        let flags = Arc::new(FeatureFlagStore::default());
        assert!(flags.set("circuit_breaker", false).is_ok());
        let wrapper = wrapper().with_feature_flags(flags);
        let options = RequestOptions::new("tax", "e_invoicing").without_retry();

        for _ in 0..3 {
            let _: Result<(), _> = wrapper
                .send(options.clone(), || async { Err(ResilienceError::unavailable("down")) })
                .await;
        }
        assert!(wrapper.circuits.is_empty());
    }
}
