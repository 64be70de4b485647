//! Centralized error type for the resilience layer.
//!
//! Every component returns [`ResilienceError`]. Errors carry enough shape
//! (HTTP-equivalent status, retryability) for the retry executor, the
//! circuit breaker and the classifier to make decisions without inspecting
//! foreign error types.

use std::time::Duration;

use thiserror::Error;

use crate::classifier::ClassifiedIssue;

/// HTTP statuses that indicate a caller mistake rather than a flaky dependency.
pub const NON_RETRYABLE_STATUSES: &[u16] = &[400, 401, 403, 404, 409, 422];

/// Message vocabulary that marks validation or auth failures.
const NON_RETRYABLE_VOCABULARY: &[&str] = &[
    "validation",
    "invalid",
    "unauthorized",
    "forbidden",
    "not found",
    "duplicate",
];

/// Common error type for resilience operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// HTTP transport failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A dependency answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP-equivalent status code
        status: u16,
        /// Message returned by the dependency
        message: String,
    },

    /// Circuit breaker is open for the specified dependency
    #[error("Circuit breaker open for {service}")]
    CircuitOpen {
        /// The dependency name that has an open circuit
        service: String,
        /// Time left before a trial call is admitted
        retry_after: Duration,
    },

    /// Dependency is temporarily unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rate limit exceeded
    #[error("Rate limited")]
    RateLimited,

    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// The same idempotency key is already in flight
    #[error("Duplicate request for idempotency key {key}")]
    Duplicate {
        /// The idempotency key
        key: String,
    },

    /// Persistence layer failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// An operation failed with a free-text message
    #[error("{0}")]
    Operation(String),

    /// A failure that has been through the classifier
    #[error("{}: {}", .0.category, .0.message)]
    Classified(Box<ClassifiedIssue>),

    /// Internal error
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ResilienceError {
    /// HTTP-equivalent status code for this error, when one applies.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http(err) => err.status().map(|s| s.as_u16()).or_else(|| transport_status(err)),
            Self::Status { status, .. } => Some(*status),
            Self::CircuitOpen { .. } | Self::Unavailable(_) => Some(503),
            Self::AuthFailed(_) => Some(401),
            Self::NotFound(_) => Some(404),
            Self::RateLimited => Some(429),
            Self::InvalidInput(_) => Some(400),
            Self::Timeout(_) => Some(504),
            Self::Duplicate { .. } => Some(409),
            _ => None,
        }
    }

    /// Default retryability policy.
    ///
    /// Caller mistakes (4xx-shaped statuses, validation and auth vocabulary),
    /// open circuits, cancellations and already-classified failures are not
    /// retried. Network failures, 5xx and timeouts are.
    ///
    /// # Examples
    ///
    /// ```
    /// use retail_resilience::ResilienceError;
    ///
    /// assert!(ResilienceError::Timeout("inventory".to_string()).is_retryable());
    /// assert!(!ResilienceError::NotFound("supplier".to_string()).is_retryable());
    /// ```
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen { .. }
            | Self::Cancelled
            | Self::Duplicate { .. }
            | Self::Classified(_)
            | Self::AuthFailed(_)
            | Self::NotFound(_)
            | Self::InvalidInput(_)
            | Self::Serialization(_) => false,
            _ => {
                if self
                    .status_code()
                    .is_some_and(|status| NON_RETRYABLE_STATUSES.contains(&status))
                {
                    return false;
                }
                let message = self.to_string().to_lowercase();
                !NON_RETRYABLE_VOCABULARY.iter().any(|word| message.contains(word))
            }
        }
    }

    /// The classification carried by this error, if any.
    #[must_use]
    pub fn issue(&self) -> Option<&ClassifiedIssue> {
        match self {
            Self::Classified(issue) => Some(issue),
            _ => None,
        }
    }

    /// Create an error from a dependency status code and message.
    #[must_use]
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Create a circuit open error for the given dependency.
    #[must_use]
    pub fn circuit_open(service: impl Into<String>, retry_after: Duration) -> Self {
        Self::CircuitOpen {
            service: service.into(),
            retry_after,
        }
    }

    /// Create an unavailable error with the given message.
    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create an invalid input error with the given message.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a free-text operation failure.
    #[must_use]
    pub fn operation(msg: impl Into<String>) -> Self {
        Self::Operation(msg.into())
    }

    /// Create a storage error with the given message.
    #[must_use]
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Status for reqwest failures that never produced a response.
fn transport_status(err: &reqwest::Error) -> Option<u16> {
    if err.is_timeout() {
        Some(504)
    } else if err.is_connect() || err.is_request() {
        Some(503)
    } else {
        None
    }
}

impl From<ClassifiedIssue> for ResilienceError {
    fn from(issue: ClassifiedIssue) -> Self {
        Self::Classified(Box::new(issue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(ResilienceError::RateLimited.is_retryable());
        assert!(ResilienceError::unavailable("tax gateway").is_retryable());
        assert!(ResilienceError::Timeout("inventory".to_string()).is_retryable());
        assert!(ResilienceError::status(502, "bad gateway").is_retryable());
        assert!(ResilienceError::operation("ECONNRESET").is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!ResilienceError::NotFound("sku".to_string()).is_retryable());
        assert!(!ResilienceError::AuthFailed("expired".to_string()).is_retryable());
        assert!(!ResilienceError::invalid_input("qty").is_retryable());
        assert!(!ResilienceError::circuit_open("payments", Duration::from_secs(3)).is_retryable());
        assert!(!ResilienceError::Cancelled.is_retryable());
        for status in NON_RETRYABLE_STATUSES {
            assert!(!ResilienceError::status(*status, "rejected").is_retryable());
        }
    }

    #[test]
    fn test_vocabulary_blocks_retry() {
        assert!(!ResilienceError::operation("Validation failed for field price").is_retryable());
        assert!(!ResilienceError::operation("Forbidden").is_retryable());
        assert!(!ResilienceError::status(500, "duplicate entry").is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ResilienceError::status(418, "teapot").status_code(), Some(418));
        assert_eq!(ResilienceError::Duplicate { key: "k".into() }.status_code(), Some(409));
        assert_eq!(ResilienceError::operation("boom").status_code(), None);
    }

    #[tokio::test]
    async fn test_connect_failure_is_transient() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .unwrap_or_else(|e| panic!("bind failed: {e}"));
        let err: ResilienceError = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
            .map(|_| ())
            .err()
            .map(ResilienceError::from)
            .unwrap_or_else(|| panic!("nothing listens on port {port}"));

        assert_eq!(err.status_code(), Some(503));
        assert!(err.is_retryable());

        let issue = crate::classifier::IssueClassifier::new()
            .classify_error(&err, &crate::classifier::ClassifyContext::new("inventory"));
        assert_eq!(issue.category, crate::classifier::IssueCategory::TransientError);
        assert_eq!(issue.severity, crate::classifier::Severity::Minor);
    }

    #[tokio::test]
    async fn test_client_timeout_maps_to_gateway_timeout() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap_or_else(|e| panic!("client build failed: {e}"));
        let err = client
            .get(server.uri())
            .send()
            .await
            .map(|_| ())
            .err()
            .map(ResilienceError::from)
            .unwrap_or_else(|| panic!("request should time out"));

        assert_eq!(err.status_code(), Some(504));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ResilienceError::RateLimited;
        assert_eq!(err.to_string(), "Rate limited");

        let err = ResilienceError::circuit_open("payments", Duration::from_secs(1));
        assert_eq!(err.to_string(), "Circuit breaker open for payments");

        let err = ResilienceError::operation("Cannot read properties of undefined");
        assert_eq!(err.to_string(), "Cannot read properties of undefined");
    }
}
