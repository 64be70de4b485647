//! Rule-based error classification.
//!
//! Maps a raw error and where it happened to a severity, a category and a
//! message the user can see. Minor issues are absorbed by fallbacks or
//! retries; major ones are surfaced and, when an alert bus is attached,
//! published as system alerts. Anything the rules do not recognise is major.

mod issue;
mod messages;
pub mod recovery;
mod rules;

use std::sync::Arc;

use chrono::Utc;

use crate::alerts::{SystemAlert, SystemAlertBus};
use crate::error::ResilienceError;
use crate::feature_flags::FeatureFlagStore;
use crate::logger::{LogContext, Logger};

pub use issue::{ClassifiedIssue, ClassifyContext, IssueCategory, Severity};
pub use messages::{EnglishCatalog, MessageCatalog};
pub use recovery::Recovery;

/// Classifies errors and routes major ones to the alert bus.
#[derive(Debug, Clone)]
pub struct IssueClassifier {
    catalog: Arc<dyn MessageCatalog>,
    logger: Option<Arc<Logger>>,
    alerts: Option<Arc<SystemAlertBus>>,
    flags: Option<Arc<FeatureFlagStore>>,
}

impl Default for IssueClassifier {
    fn default() -> Self {
        Self {
            catalog: Arc::new(EnglishCatalog),
            logger: None,
            alerts: None,
            flags: None,
        }
    }
}

impl IssueClassifier {
    /// Classifier with the English catalog and no sinks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different message catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn MessageCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Log every classification.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Publish major issues through `alerts`.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<SystemAlertBus>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Honour the `auto_recovery` and `system_alerts` flags.
    #[must_use]
    pub fn with_feature_flags(mut self, flags: Arc<FeatureFlagStore>) -> Self {
        self.flags = Some(flags);
        self
    }

    fn flag_enabled(&self, name: &str) -> bool {
        self.flags.as_ref().is_none_or(|flags| flags.is_enabled(name))
    }

    /// Classify a raw error message.
    ///
    /// # Examples
    ///
    /// ```
    /// use retail_resilience::classifier::{
    ///     ClassifyContext, IssueCategory, IssueClassifier, Severity,
    /// };
    ///
    /// let classifier = IssueClassifier::new();
    /// let issue = classifier.classify("payment declined", &ClassifyContext::new("Payment"));
    /// assert_eq!(issue.category, IssueCategory::PaymentError);
    /// assert_eq!(issue.severity, Severity::Major);
    /// ```
    #[must_use]
    pub fn classify(&self, message: &str, ctx: &ClassifyContext) -> ClassifiedIssue {
        let (category, severity, auto_recoverable, requires_developer) =
            rules::evaluate(message, ctx).map_or(
                (IssueCategory::Unknown, Severity::Major, false, true),
                |rule| {
                    (rule.category, rule.severity, rule.auto_recoverable, rule.requires_developer)
                },
            );

        let issue = ClassifiedIssue {
            severity,
            category,
            message: message.to_string(),
            user_message: self.catalog.message(category),
            auto_recoverable,
            requires_developer,
            module: ctx.module.clone(),
            timestamp: Utc::now(),
        };
        self.log(&issue, ctx);
        issue
    }

    /// Classify a [`ResilienceError`].
    ///
    /// An already-classified error is returned as is. The error's status code
    /// fills in the context when the caller did not supply one.
    #[must_use]
    pub fn classify_error(
        &self,
        error: &ResilienceError,
        ctx: &ClassifyContext,
    ) -> ClassifiedIssue {
        if let Some(issue) = error.issue() {
            return issue.clone();
        }
        let mut ctx = ctx.clone();
        if ctx.status.is_none() {
            ctx.status = error.status_code();
        }
        self.classify(&error.to_string(), &ctx)
    }

    /// Publish `issue` on the alert bus, if one is attached and the issue qualifies.
    pub fn escalate(&self, issue: &ClassifiedIssue) -> Option<SystemAlert> {
        self.alerts.as_ref().and_then(|bus| bus.emit(issue))
    }

    /// User-facing text for `category`.
    #[must_use]
    pub fn user_message(&self, category: IssueCategory) -> String {
        self.catalog.message(category)
    }

    fn log(&self, issue: &ClassifiedIssue, ctx: &ClassifyContext) {
        let Some(logger) = &self.logger else {
            return;
        };
        let mut context = LogContext::new(issue.module.clone())
            .with_metadata("category", issue.category.as_str())
            .with_metadata("severity", issue.severity.as_str())
            .with_metadata("auto_recoverable", issue.auto_recoverable);
        if let Some(action) = &ctx.action {
            context = context.with_action(action.clone());
        }
        if let Some(status) = ctx.status {
            context = context.with_metadata("status", status);
        }

        let message = format!("Classified {}: {}", issue.category, issue.message);
        match (issue.severity, issue.category) {
            (_, IssueCategory::Unknown) => logger.critical(message, context),
            (Severity::Major, _) => logger.error(message, context),
            (Severity::Minor, _) => logger.warn(message, context),
        }
    }
}
