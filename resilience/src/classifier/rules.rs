//! Ordered classification rules.
//!
//! First match wins. Minor rules come before major ones so that ambiguous
//! text (say "invalid decimal") lands on the recoverable side.

use once_cell::sync::Lazy;
use regex::Regex;

use super::issue::{ClassifyContext, IssueCategory, Severity};

/// Module names in the payment family.
const PAYMENT_MODULES: &[&str] = &["payment", "payments", "checkout", "refund"];

/// Module names in the invoice family.
const INVOICE_MODULES: &[&str] = &["invoice", "invoices", "e_invoicing", "einvoice", "tax"];

/// Module names in the financial family.
const FINANCIAL_MODULES: &[&str] = &["cash_register", "pos", "accounting", "ledger"];

/// Vocabulary that makes a financial-module failure a calculation problem.
const NUMERIC_VOCABULARY: &[&str] = &["total", "amount", "balance", "sum", "price", "vat"];

/// One row of the rule table.
#[derive(Debug)]
pub struct Rule {
    /// Rule name, used in logs
    pub name: &'static str,
    /// Category assigned on match
    pub category: IssueCategory,
    /// Severity assigned on match
    pub severity: Severity,
    /// Whether fallback or retry may absorb it
    pub auto_recoverable: bool,
    /// Whether a developer must look at it
    pub requires_developer: bool,
    statuses: &'static [u16],
    module_family: &'static [&'static str],
    pattern: &'static str,
}

impl Rule {
    /// Whether the rule matches `message` (already lower-cased) in `ctx`.
    fn matches(&self, message: &str, ctx: &ClassifyContext, pattern: Option<&Regex>) -> bool {
        if ctx.status.is_some_and(|status| self.statuses.contains(&status)) {
            return true;
        }
        if in_family(&ctx.module, self.module_family) {
            return true;
        }
        pattern.is_some_and(|re| re.is_match(message))
    }
}

const fn minor(
    name: &'static str,
    category: IssueCategory,
    statuses: &'static [u16],
    pattern: &'static str,
) -> Rule {
    Rule {
        name,
        category,
        severity: Severity::Minor,
        auto_recoverable: true,
        requires_developer: false,
        statuses,
        module_family: &[],
        pattern,
    }
}

const fn major(
    name: &'static str,
    category: IssueCategory,
    statuses: &'static [u16],
    module_family: &'static [&'static str],
    pattern: &'static str,
) -> Rule {
    Rule {
        name,
        category,
        severity: Severity::Major,
        auto_recoverable: false,
        requires_developer: true,
        statuses,
        module_family,
        pattern,
    }
}

/// The rule table, in evaluation order.
pub static RULES: [Rule; 12] = [
    minor(
        "auth_failure",
        IssueCategory::AuthFailure,
        &[401, 403],
        r"unauthorized|forbidden|jwt expired|token expired",
    ),
    minor(
        "missing_value",
        IssueCategory::MissingValue,
        &[],
        r"cannot read propert|undefined|is null|null value|missing required field|is not defined",
    ),
    minor(
        "format_error",
        IssueCategory::FormatError,
        &[],
        r"invalid date|date format|tofixed|number format|\bnan\b|is not a number|formatting",
    ),
    minor(
        "transient_error",
        IssueCategory::TransientError,
        &[408, 429, 502, 503, 504],
        concat!(
            r"network|timeout|timed out|econnreset|econnrefused|socket hang up|failed to fetch",
            r"|\b50[234]\b|temporarily unavailable",
        ),
    ),
    minor(
        "stale_data",
        IssueCategory::StaleData,
        &[],
        r"stale|cache|outdated|version mismatch|etag",
    ),
    minor(
        "ui_render_error",
        IssueCategory::UiRenderError,
        &[],
        r"render|hydration|chunk load|resizeobserver",
    ),
    major(
        "payment_error",
        IssueCategory::PaymentError,
        &[],
        PAYMENT_MODULES,
        r"payment|card declined|declined|refund failed|insufficient funds",
    ),
    major(
        "invoice_error",
        IssueCategory::InvoiceError,
        &[],
        INVOICE_MODULES,
        r"invoice|tax authority|zatca",
    ),
    // Financial modules only count with numeric vocabulary; handled in `evaluate`.
    major(
        "calculation_error",
        IssueCategory::CalculationError,
        &[],
        &[],
        r"rounding|total mismatch|balance mismatch|calculation|decimal",
    ),
    major(
        "data_integrity",
        IssueCategory::DataIntegrity,
        &[],
        &[],
        r"corrupt|constraint|integrity|duplicate key|e11000|foreign key|inconsistent",
    ),
    major(
        "database_error",
        IssueCategory::DatabaseError,
        &[],
        &[],
        r"mongo|database|db connection|query failed|transaction aborted|write conflict",
    ),
    major(
        "service_down",
        IssueCategory::ServiceDown,
        &[500],
        &[],
        concat!(
            r"service unavailable|circuit breaker|circuit open",
            r"|connection refused permanently|internal server error",
        ),
    ),
];

static COMPILED: Lazy<Vec<Option<Regex>>> =
    Lazy::new(|| RULES.iter().map(|rule| Regex::new(rule.pattern).ok()).collect());

/// First rule matching `message` in `ctx`.
pub fn evaluate(message: &str, ctx: &ClassifyContext) -> Option<&'static Rule> {
    let message = message.to_lowercase();
    RULES.iter().zip(COMPILED.iter()).find_map(|(rule, pattern)| {
        let matched = if rule.category == IssueCategory::CalculationError {
            (in_family(&ctx.module, FINANCIAL_MODULES)
                && NUMERIC_VOCABULARY.iter().any(|word| message.contains(word)))
                || rule.matches(&message, ctx, pattern.as_ref())
        } else {
            rule.matches(&message, ctx, pattern.as_ref())
        };
        matched.then_some(rule)
    })
}

fn in_family(module: &str, family: &[&str]) -> bool {
    if family.is_empty() || module.is_empty() {
        return false;
    }
    let module = module.to_lowercase().replace(['-', ' '], "_");
    family.iter().any(|member| module == *member)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_pattern_compiles() {
        assert!(COMPILED.iter().all(Option::is_some));
    }

    #[test]
    fn test_module_family_matching() {
        assert!(in_family("Payment", PAYMENT_MODULES));
        assert!(in_family("cash-register", FINANCIAL_MODULES));
        assert!(!in_family("inventory", PAYMENT_MODULES));
        assert!(!in_family("", PAYMENT_MODULES));
    }

    #[test]
    fn test_nan_needs_word_boundary() {
        let ctx = ClassifyContext::new("reports");
        assert_eq!(evaluate("value is NaN", &ctx).map(|r| r.name), Some("format_error"));
        let rule = evaluate("financial summary exploded", &ctx).map(|r| r.name);
        assert_ne!(rule, Some("format_error"));
    }

    #[test]
    fn test_financial_module_needs_numeric_vocabulary() {
        let ctx = ClassifyContext::new("cash_register");
        assert_eq!(
            evaluate("drawer total does not add up", &ctx).map(|r| r.name),
            Some("calculation_error")
        );
        assert!(evaluate("drawer jammed", &ctx).is_none());
    }

    #[test]
    fn test_status_beats_text() {
        let ctx = ClassifyContext::new("inventory").with_status(503);
        assert_eq!(evaluate("boom", &ctx).map(|r| r.name), Some("transient_error"));

        let ctx = ClassifyContext::new("inventory").with_status(500);
        assert_eq!(evaluate("boom", &ctx).map(|r| r.name), Some("service_down"));
    }
}
