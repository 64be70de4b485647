//! Protected inbound handlers.
//!
//! Pipeline: required feature flag, maintenance mode, idempotency replay,
//! handler. Handler errors become structured JSON responses; production
//! responses never carry raw error text.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use crate::classifier::{ClassifiedIssue, ClassifyContext, IssueClassifier, Severity};
use crate::error::ResilienceError;
use crate::feature_flags::FeatureFlagStore;
use crate::idempotency::{IDEMPOTENCY_HEADER, ServerIdempotency, is_mutating};
use crate::logger::{LogContext, Logger};
use crate::metrics::ResilienceMetrics;

/// Body error for a disabled feature.
pub const FEATURE_DISABLED_MESSAGE: &str = "This feature is currently disabled";

/// Body error while in maintenance mode.
pub const MAINTENANCE_MESSAGE: &str = "System is in maintenance mode. Please try again later.";

/// Body error for minor failures.
pub const TEMPORARY_ISSUE_MESSAGE: &str = "A temporary issue occurred. Please try again.";

/// Inbound request as seen by the boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundaryRequest {
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Headers, looked up case-insensitively
    pub headers: HashMap<String, String>,
    /// JSON body
    pub body: Value,
}

impl BoundaryRequest {
    /// Request with no headers and a null body.
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Header value, matching the name case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Idempotency key, for mutating methods only.
    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        if !is_mutating(&self.method) {
            return None;
        }
        self.header(IDEMPOTENCY_HEADER).map(str::trim).filter(|key| !key.is_empty())
    }
}

/// Response produced by the boundary or the handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundaryResponse {
    /// HTTP status
    pub status: u16,
    /// JSON body
    pub body: Value,
}

impl BoundaryResponse {
    /// Response with the given status and body.
    #[must_use]
    pub const fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// 200 with `body`.
    #[must_use]
    pub const fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    fn unavailable(message: &str) -> Self {
        Self::new(503, json!({ "success": false, "error": message }))
    }

    fn duplicate() -> Self {
        Self::new(
            409,
            json!({
                "error": "Duplicate request",
                "message": "This operation is already in progress",
            }),
        )
    }
}

/// Per-route options.
#[derive(Debug, Clone, Default)]
pub struct BoundaryOptions {
    /// Business module, for classification and logs
    pub module: String,
    /// Flag that must be on for the route to run
    pub required_flag: Option<String>,
    /// Serve even in maintenance mode
    pub allow_in_maintenance: bool,
    /// Skip idempotency replay
    pub skip_idempotency: bool,
}

impl BoundaryOptions {
    /// Options for a route in `module`.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Self::default()
        }
    }

    /// Require `flag` to be on.
    #[must_use]
    pub fn requires_flag(mut self, flag: impl Into<String>) -> Self {
        self.required_flag = Some(flag.into());
        self
    }

    /// Keep serving in maintenance mode.
    #[must_use]
    pub const fn allow_in_maintenance(mut self) -> Self {
        self.allow_in_maintenance = true;
        self
    }

    /// Do not replay or record responses.
    #[must_use]
    pub const fn skip_idempotency(mut self) -> Self {
        self.skip_idempotency = true;
        self
    }
}

/// Wraps inbound handlers with gating, replay and error shaping.
#[derive(Clone)]
pub struct BoundaryWrapper {
    flags: Arc<FeatureFlagStore>,
    idempotency: Arc<ServerIdempotency>,
    classifier: IssueClassifier,
    logger: Arc<Logger>,
    production: bool,
    metrics: Option<Arc<ResilienceMetrics>>,
}

impl std::fmt::Debug for BoundaryWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundaryWrapper")
            .field("production", &self.production)
            .finish_non_exhaustive()
    }
}

impl BoundaryWrapper {
    /// Wrapper over shared components.
    #[must_use]
    pub fn new(
        flags: Arc<FeatureFlagStore>,
        idempotency: Arc<ServerIdempotency>,
        classifier: IssueClassifier,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            flags,
            idempotency,
            classifier,
            logger,
            production: false,
            metrics: None,
        }
    }

    /// Hide debug details from error bodies.
    #[must_use]
    pub const fn production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    /// Count responses by outcome.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ResilienceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `handler` behind the boundary.
    pub async fn handle<F, Fut>(
        &self,
        request: BoundaryRequest,
        options: &BoundaryOptions,
        handler: F,
    ) -> BoundaryResponse
    where
        F: FnOnce(BoundaryRequest) -> Fut,
        Fut: Future<Output = Result<BoundaryResponse, ResilienceError>>,
    {
        if let Some(flag) = &options.required_flag {
            if !self.flags.is_enabled(flag) {
                self.count("feature_disabled");
                return BoundaryResponse::unavailable(FEATURE_DISABLED_MESSAGE);
            }
        }

        if !options.allow_in_maintenance && self.flags.is_maintenance_mode() {
            self.count("maintenance");
            return BoundaryResponse::unavailable(MAINTENANCE_MESSAGE);
        }

        let key = request
            .idempotency_key()
            .filter(|_| !options.skip_idempotency && self.flags.is_enabled("idempotency_keys"))
            .map(str::to_string);

        let _guard = match &key {
            Some(key) => {
                let guard = self.idempotency.lock(key).await;
                if let Some(stored) = self.idempotency.check(key).await {
                    self.count("replayed");
                    let context = LogContext::new(options.module.clone())
                        .with_metadata("idempotency_key", key.as_str());
                    self.logger.info("Replaying stored response for idempotency key", context);
                    return BoundaryResponse::new(stored.status_code, stored.result);
                }
                Some(guard)
            }
            None => None,
        };

        let action = format!("{} {}", request.method, request.path);
        match handler(request).await {
            Ok(response) => {
                if let Some(key) = &key {
                    if response.status < 500 {
                        self.idempotency.save(key, response.body.clone(), response.status).await;
                    }
                }
                self.count("ok");
                response
            }
            Err(ResilienceError::Duplicate { .. }) => {
                self.count("duplicate");
                BoundaryResponse::duplicate()
            }
            Err(err) => {
                let ctx = ClassifyContext::new(options.module.clone()).with_action(action);
                let issue = self.classifier.classify_error(&err, &ctx);
                if issue.is_major()
                    && self.flags.is_enabled("system_alerts")
                    && self.classifier.escalate(&issue).is_some()
                {
                    self.record(|m| m.alerts_emitted.inc());
                }
                self.error_response(&issue)
            }
        }
    }

    fn error_response(&self, issue: &ClassifiedIssue) -> BoundaryResponse {
        match issue.severity {
            Severity::Major => {
                self.count("major_error");
                let mut body = json!({
                    "success": false,
                    "error": issue.user_message,
                    "category": issue.category,
                    "requiresDeveloper": issue.requires_developer,
                });
                if !self.production {
                    body["debug"] = json!({ "message": issue.message, "module": issue.module });
                }
                BoundaryResponse::new(500, body)
            }
            Severity::Minor => {
                self.count("minor_error");
                BoundaryResponse::new(
                    503,
                    json!({
                        "success": false,
                        "error": TEMPORARY_ISSUE_MESSAGE,
                        "retryable": true,
                    }),
                )
            }
        }
    }

    fn count(&self, outcome: &str) {
        self.record(|m| m.boundary_responses.inc(outcome));
    }

    fn record(&self, f: impl FnOnce(&ResilienceMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}
