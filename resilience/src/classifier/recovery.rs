//! Safe defaults and auto-recovery.
//!
//! The `safe_*` helpers coerce loosely typed JSON into usable values with a
//! fallback. They are for display and bookkeeping fields only, never for
//! money: a financial field that fails to parse must surface as an error.

use std::future::Future;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::{ClassifiedIssue, ClassifyContext, IssueClassifier, Severity};
use crate::error::ResilienceError;

/// Result of an operation run under auto-recovery.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery<T> {
    /// The operation succeeded
    Ok(T),
    /// The operation failed with a minor issue and the fallback was used
    Recovered {
        /// The fallback value
        value: T,
        /// What went wrong
        issue: ClassifiedIssue,
    },
    /// The operation failed with a major issue
    Failed(ClassifiedIssue),
}

impl<T> Recovery<T> {
    /// The value, whether real or fallback.
    pub fn value(self) -> Option<T> {
        match self {
            Self::Ok(value) | Self::Recovered { value, .. } => Some(value),
            Self::Failed(_) => None,
        }
    }

    /// Convert to a `Result`, turning a major failure into an error.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::Classified`] for [`Recovery::Failed`].
    pub fn into_result(self) -> Result<T, ResilienceError> {
        match self {
            Self::Ok(value) | Self::Recovered { value, .. } => Ok(value),
            Self::Failed(issue) => Err(issue.into()),
        }
    }

    /// Whether the fallback was used.
    pub const fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered { .. })
    }
}

impl IssueClassifier {
    /// Run a fallible operation, absorbing minor issues with `fallback`.
    ///
    /// With the `auto_recovery` flag off every failure is reported as
    /// [`Recovery::Failed`].
    pub fn with_auto_recovery<T, F>(
        &self,
        ctx: &ClassifyContext,
        fallback: T,
        operation: F,
    ) -> Recovery<T>
    where
        F: FnOnce() -> Result<T, ResilienceError>,
    {
        match operation() {
            Ok(value) => Recovery::Ok(value),
            Err(err) => self.recover(&err, ctx, fallback),
        }
    }

    /// Async counterpart of [`IssueClassifier::with_auto_recovery`].
    pub async fn with_async_auto_recovery<T, F, Fut>(
        &self,
        ctx: &ClassifyContext,
        fallback: T,
        operation: F,
    ) -> Recovery<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        match operation().await {
            Ok(value) => Recovery::Ok(value),
            Err(err) => self.recover(&err, ctx, fallback),
        }
    }

    fn recover<T>(&self, err: &ResilienceError, ctx: &ClassifyContext, fallback: T) -> Recovery<T> {
        let issue = self.classify_error(err, ctx);
        if issue.severity == Severity::Minor && self.flag_enabled("auto_recovery") {
            return Recovery::Recovered { value: fallback, issue };
        }
        if self.flag_enabled("system_alerts") {
            self.escalate(&issue);
        }
        Recovery::Failed(issue)
    }
}

/// Number from a JSON number or numeric string, else `default`.
#[must_use]
pub fn safe_number(value: &Value, default: f64) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite()).unwrap_or(default)
}

/// Integer from a JSON number or numeric string, truncating fractions.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn safe_integer(value: &Value, default: i64) -> i64 {
    if let Some(n) = value.as_i64() {
        return n;
    }
    let n = safe_number(value, f64::NAN);
    if n.is_finite() && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        return n.trunc() as i64;
    }
    default
}

/// Date from RFC 3339, `YYYY-MM-DD`, or epoch milliseconds.
#[must_use]
pub fn safe_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| Utc.from_utc_datetime(&dt))
        }
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// The array, or an empty one.
#[must_use]
pub fn safe_array(value: &Value) -> Vec<Value> {
    value.as_array().cloned().unwrap_or_default()
}

/// The object, or an empty one.
#[must_use]
pub fn safe_object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Truthiness: `true`, `1`, `"true"`, `"1"`, `"yes"`.
#[must_use]
pub fn safe_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// Percentage clamped to 0..=100.
#[must_use]
pub fn safe_percentage(value: &Value, default: f64) -> f64 {
    safe_number(value, default).clamp(0.0, 100.0)
}

/// Parse JSON text, or return `default`.
pub fn safe_json_parse<T: DeserializeOwned>(text: &str, default: T) -> T {
    serde_json::from_str(text).unwrap_or(default)
}

/// String form of scalars, or `default`.
#[must_use]
pub fn safe_string(value: &Value, default: &str) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::SystemAlertBus;
    use crate::classifier::IssueCategory;
    use crate::feature_flags::FeatureFlagStore;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_safe_number() {
        assert!((safe_number(&json!(12.5), 0.0) - 12.5).abs() < f64::EPSILON);
        assert!((safe_number(&json!(" 3 "), 0.0) - 3.0).abs() < f64::EPSILON);
        assert!((safe_number(&json!("abc"), 7.0) - 7.0).abs() < f64::EPSILON);
        assert!((safe_number(&json!("NaN"), 1.0) - 1.0).abs() < f64::EPSILON);
        assert!((safe_number(&Value::Null, -1.0) + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_safe_integer() {
        assert_eq!(safe_integer(&json!(42), 0), 42);
        assert_eq!(safe_integer(&json!("9.9"), 0), 9);
        assert_eq!(safe_integer(&json!([]), 5), 5);
    }

    #[test]
    fn test_safe_date_formats() {
        let rfc = safe_date(&json!("2024-03-01T10:00:00Z"));
        assert_eq!(rfc.map(|d| d.timestamp()), Some(1_709_287_200));

        let day = safe_date(&json!("2024-03-01"));
        assert_eq!(day.map(|d| d.timestamp()), Some(1_709_251_200));

        let millis = safe_date(&json!(1_709_251_200_000_i64));
        assert_eq!(millis, day);

        assert!(safe_date(&json!("yesterday")).is_none());
    }

    #[test]
    fn test_safe_collections() {
        assert_eq!(safe_array(&json!([1, 2])).len(), 2);
        assert!(safe_array(&json!({"a": 1})).is_empty());
        assert_eq!(safe_object(&json!({"a": 1})).len(), 1);
        assert!(safe_object(&json!("x")).is_empty());
    }

    #[test]
    fn test_safe_bool() {
        for truthy in [json!(true), json!(1), json!("true"), json!("1"), json!("YES")] {
            assert!(safe_bool(&truthy), "{truthy}");
        }
        for falsy in [json!(false), json!(0), json!("no"), Value::Null] {
            assert!(!safe_bool(&falsy), "{falsy}");
        }
    }

    #[test]
    fn test_safe_percentage_clamps() {
        assert!((safe_percentage(&json!(150), 0.0) - 100.0).abs() < f64::EPSILON);
        assert!(safe_percentage(&json!(-5), 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_safe_json_parse_and_string() {
        let parsed: Vec<u32> = safe_json_parse("[1,2]", Vec::new());
        assert_eq!(parsed, vec![1, 2]);
        let fallback: Vec<u32> = safe_json_parse("{broken", vec![9]);
        assert_eq!(fallback, vec![9]);

        assert_eq!(safe_string(&json!(3), ""), "3");
        assert_eq!(safe_string(&Value::Null, "n/a"), "n/a");
    }

    #[test]
    fn test_minor_failure_recovers_with_fallback() {
        let classifier = IssueClassifier::new();
        let outcome = classifier.with_auto_recovery(&ClassifyContext::new("inventory"), 0_u32, || {
            Err(ResilienceError::operation("Cannot read properties of undefined"))
        });
        assert!(outcome.is_recovered());
        assert_eq!(outcome.into_result().ok(), Some(0));
    }

    #[tokio::test]
    async fn test_major_failure_is_reported() {
        let classifier = IssueClassifier::new();
        let outcome = classifier
            .with_async_auto_recovery(&ClassifyContext::new("Payment"), 0_u32, || async {
                Err(ResilienceError::operation("card declined"))
            })
            .await;

        match outcome.clone() {
            Recovery::Failed(issue) => assert_eq!(issue.category, IssueCategory::PaymentError),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(matches!(outcome.into_result(), Err(ResilienceError::Classified(_))));
    }

    #[test]
    fn test_auto_recovery_flag_off_surfaces_minor_issues() {
        let flags = Arc::new(FeatureFlagStore::default());
        assert!(flags.set("auto_recovery", false).is_ok());
        let classifier = IssueClassifier::new().with_feature_flags(Arc::clone(&flags));
        let ctx = ClassifyContext::new("inventory");
        let fail =
            || Err::<u32, _>(ResilienceError::operation("Cannot read properties of undefined"));

        match classifier.with_auto_recovery(&ctx, 0_u32, fail) {
            Recovery::Failed(issue) => assert_eq!(issue.category, IssueCategory::MissingValue),
            other => panic!("expected failure, got {other:?}"),
        }

        assert!(flags.set("auto_recovery", true).is_ok());
        assert!(classifier.with_auto_recovery(&ctx, 0_u32, fail).is_recovered());
    }

    #[test]
    fn test_system_alerts_flag_off_keeps_bus_quiet() {
        let bus = Arc::new(SystemAlertBus::new());
        let flags = Arc::new(FeatureFlagStore::default());
        assert!(flags.set("system_alerts", false).is_ok());
        let classifier = IssueClassifier::new()
            .with_alerts(Arc::clone(&bus))
            .with_feature_flags(flags);

        let outcome = classifier.with_auto_recovery(&ClassifyContext::new("payment"), 0_u32, || {
            Err(ResilienceError::operation("card declined"))
        });
        assert!(matches!(outcome, Recovery::Failed(_)));
        assert!(bus.all().is_empty());
    }

    #[test]
    fn test_success_passes_through() {
        let outcome =
            IssueClassifier::new().with_auto_recovery(&ClassifyContext::default(), 0, || Ok(5));
        assert_eq!(outcome, Recovery::Ok(5));
    }
}
