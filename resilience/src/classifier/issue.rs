//! Classification result types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How much an issue matters to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Absorbed by fallback or retry
    Minor,
    /// Surfaced to the user, needs a developer
    Major,
}

impl Severity {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of issue categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    /// A value the code expected was absent
    MissingValue,
    /// A value had the wrong shape for display or parsing
    FormatError,
    /// Network hiccup or overloaded dependency
    TransientError,
    /// Cached or versioned data fell behind
    StaleData,
    /// The presentation layer failed to render
    UiRenderError,
    /// Totals, balances or rounding went wrong
    CalculationError,
    /// Stored data violates a constraint
    DataIntegrity,
    /// A dependency is down
    ServiceDown,
    /// The session is no longer valid
    AuthFailure,
    /// Payment processing failed
    PaymentError,
    /// Invoice or tax-authority submission failed
    InvoiceError,
    /// The document store failed
    DatabaseError,
    /// Nothing matched
    Unknown,
}

impl IssueCategory {
    /// Every category, in declaration order.
    pub const ALL: [Self; 13] = [
        Self::MissingValue,
        Self::FormatError,
        Self::TransientError,
        Self::StaleData,
        Self::UiRenderError,
        Self::CalculationError,
        Self::DataIntegrity,
        Self::ServiceDown,
        Self::AuthFailure,
        Self::PaymentError,
        Self::InvoiceError,
        Self::DatabaseError,
        Self::Unknown,
    ];

    /// Snake-case name, matching the serialized form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MissingValue => "missing_value",
            Self::FormatError => "format_error",
            Self::TransientError => "transient_error",
            Self::StaleData => "stale_data",
            Self::UiRenderError => "ui_render_error",
            Self::CalculationError => "calculation_error",
            Self::DataIntegrity => "data_integrity",
            Self::ServiceDown => "service_down",
            Self::AuthFailure => "auth_failure",
            Self::PaymentError => "payment_error",
            Self::InvoiceError => "invoice_error",
            Self::DatabaseError => "database_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how an error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyContext {
    /// Business module, e.g. `payment` or `cash_register`
    pub module: String,
    /// HTTP-equivalent status, when the failure came from a response
    pub status: Option<u16>,
    /// Logical action being performed
    pub action: Option<String>,
}

impl ClassifyContext {
    /// Context for a module.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Self::default()
        }
    }

    /// Attach a status code.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach an action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// An error after classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedIssue {
    /// Severity
    pub severity: Severity,
    /// Category
    pub category: IssueCategory,
    /// Raw error text
    pub message: String,
    /// Text safe to show the user
    pub user_message: String,
    /// Whether a fallback or retry can absorb it
    pub auto_recoverable: bool,
    /// Whether a developer must look at it
    pub requires_developer: bool,
    /// Module it happened in
    pub module: String,
    /// When it was classified
    pub timestamp: DateTime<Utc>,
}

impl ClassifiedIssue {
    /// Whether the issue is major.
    #[must_use]
    pub fn is_major(&self) -> bool {
        self.severity == Severity::Major
    }

    /// Whether the alert bus should hear about it.
    #[must_use]
    pub fn is_alertable(&self) -> bool {
        self.is_major() && !self.auto_recoverable
    }
}
