//! Test fixtures with sample data.

use retail_resilience::classifier::{ClassifyContext, IssueCategory, Severity};
use serde_json::{Value, json};

/// A raw failure and the classification it should get.
#[derive(Debug, Clone)]
pub struct ClassificationCase {
    /// Raw error text
    pub message: &'static str,
    /// Module the failure came from
    pub module: &'static str,
    /// HTTP status, when there was one
    pub status: Option<u16>,
    /// Expected category
    pub category: IssueCategory,
    /// Expected severity
    pub severity: Severity,
}

impl ClassificationCase {
    /// Context for classifying this case.
    #[must_use]
    pub fn context(&self) -> ClassifyContext {
        let ctx = ClassifyContext::new(self.module);
        match self.status {
            Some(status) => ctx.with_status(status),
            None => ctx,
        }
    }
}

const fn case(
    message: &'static str,
    module: &'static str,
    status: Option<u16>,
    category: IssueCategory,
    severity: Severity,
) -> ClassificationCase {
    ClassificationCase {
        message,
        module,
        status,
        category,
        severity,
    }
}

/// Failures seen in production, one or more per category.
pub const CLASSIFICATION_CASES: &[ClassificationCase] = &[
    case("jwt expired", "sales", Some(401), IssueCategory::AuthFailure, Severity::Minor),
    case("Forbidden", "inventory", Some(403), IssueCategory::AuthFailure, Severity::Minor),
    case(
        "Cannot read properties of undefined (reading 'sku')",
        "inventory",
        None,
        IssueCategory::MissingValue,
        Severity::Minor,
    ),
    case(
        "Invalid date value 2024-13-40",
        "sales",
        None,
        IssueCategory::FormatError,
        Severity::Minor,
    ),
    case(
        "request timed out after 5000ms",
        "purchase_orders",
        None,
        IssueCategory::TransientError,
        Severity::Minor,
    ),
    case(
        "upstream returned",
        "supplier_returns",
        Some(503),
        IssueCategory::TransientError,
        Severity::Minor,
    ),
    case("stock cache outdated", "inventory", None, IssueCategory::StaleData, Severity::Minor),
    case("Hydration failed", "dashboard", None, IssueCategory::UiRenderError, Severity::Minor),
    case("card declined", "sales", None, IssueCategory::PaymentError, Severity::Major),
    case("unexpected response", "checkout", None, IssueCategory::PaymentError, Severity::Major),
    case(
        "zatca rejected the document",
        "sales",
        None,
        IssueCategory::InvoiceError,
        Severity::Major,
    ),
    case(
        "total mismatch on receipt",
        "sales",
        None,
        IssueCategory::CalculationError,
        Severity::Major,
    ),
    case(
        "shift balance off by 0.05",
        "cash_register",
        None,
        IssueCategory::CalculationError,
        Severity::Major,
    ),
    case(
        "E11000 duplicate key error",
        "purchase_orders",
        None,
        IssueCategory::DataIntegrity,
        Severity::Major,
    ),
    case("transaction aborted", "accounting", None, IssueCategory::DatabaseError, Severity::Major),
    case("upstream crashed", "sales", Some(500), IssueCategory::ServiceDown, Severity::Major),
    case("something nobody anticipated", "sales", None, IssueCategory::Unknown, Severity::Major),
];

/// Persisted flag overrides as written by the flag store.
#[must_use]
pub fn stored_flag_overrides() -> Value {
    json!({
        "supplier_returns": false,
        "health_monitoring": false,
        "not_a_flag": true
    })
}

/// Purchase order creation payload.
#[must_use]
pub fn purchase_order_request() -> Value {
    json!({
        "supplierId": "sup-204",
        "lines": [
            { "sku": "COF-1KG", "quantity": 12, "unitPrice": "38.50" },
            { "sku": "MLK-2L", "quantity": 40, "unitPrice": "6.25" }
        ]
    })
}

/// Login payload carrying credentials that must never be logged.
#[must_use]
pub fn login_metadata() -> Value {
    json!({
        "username": "cashier-03",
        "password": "hunter2-but-longer",
        "device": { "id": "till-7", "session": "sess-abc" },
        "card": [{ "cardNumber": "4111111111111111", "cvv": "123" }]
    })
}
