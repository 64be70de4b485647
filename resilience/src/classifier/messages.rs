//! User-facing messages per issue category.

use super::issue::IssueCategory;

/// Source of user-facing text for classified issues.
///
/// The UI layer can plug in a localized catalog.
pub trait MessageCatalog: Send + Sync + std::fmt::Debug {
    /// Message shown to the user for `category`.
    fn message(&self, category: IssueCategory) -> String;
}

/// Built-in English catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnglishCatalog;

impl MessageCatalog for EnglishCatalog {
    fn message(&self, category: IssueCategory) -> String {
        let text = match category {
            IssueCategory::MissingValue => {
                "Some information could not be loaded. Default values are shown."
            }
            IssueCategory::FormatError => "Some values could not be displayed correctly.",
            IssueCategory::TransientError => "Connection issue. Retrying automatically.",
            IssueCategory::StaleData => "Data may be out of date. Refreshing.",
            IssueCategory::UiRenderError => "Part of the page failed to load. Please refresh.",
            IssueCategory::CalculationError => {
                "A calculation error was detected. The operation was stopped to protect your data."
            }
            IssueCategory::DataIntegrity => {
                "A data consistency problem was detected. Support has been notified."
            }
            IssueCategory::ServiceDown => {
                "The service is temporarily unavailable. Please try again later."
            }
            IssueCategory::AuthFailure => "Your session has expired. Please sign in again.",
            IssueCategory::PaymentError => {
                "The payment could not be processed. No charge was made."
            }
            IssueCategory::InvoiceError => {
                "The invoice could not be submitted. It will need to be resent."
            }
            IssueCategory::DatabaseError => "The data could not be saved. Please try again.",
            IssueCategory::Unknown => "An unexpected error occurred. Support has been notified.",
        };
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_category_has_text() {
        let catalog = EnglishCatalog;
        for category in IssueCategory::ALL {
            assert!(!catalog.message(category).is_empty(), "{category}");
        }
    }
}
