//! Structured, sanitized, ring-buffered logger.
//!
//! Every component of the resilience layer reports through [`Logger`]. Each
//! entry is emitted through `tracing` and kept in a bounded in-memory ring
//! buffer that feeds the diagnostics surface (recent logs, error counts).
//! Sensitive metadata never reaches either sink.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

/// Default ring buffer capacity.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Replacement written over redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Metadata key fragments whose values are never logged.
///
/// Keys are compared after lower-casing and removing `_` and `-`.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "apikey",
    "authorization",
    "cookie",
    "cardnumber",
    "creditcard",
    "privatekey",
    "session",
];

/// Short keys that only match exactly.
const SENSITIVE_EXACT_KEYS: &[&str] = &["pin", "cvv", "cvc"];

static BEARER_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[a-z0-9._~+/=-]+").ok());

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level
    Error,
    /// Critical level
    Critical,
}

impl LogLevel {
    /// Convert to string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// Whether this level counts towards error-rate metrics.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

/// Context attached to a log entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogContext {
    /// Component or business module that emitted the entry
    pub module: String,
    /// Tenant (store) identifier
    pub tenant_id: Option<String>,
    /// Acting user
    pub user_id: Option<String>,
    /// Logical action, e.g. `create_purchase_order`
    pub action: Option<String>,
    /// Duration of the operation being reported
    pub duration_ms: Option<u64>,
    /// Free-form metadata, sanitized before storage
    pub metadata: Map<String, Value>,
}

impl LogContext {
    /// Create a context for the given module.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Self::default()
        }
    }

    /// Add tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Add user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Add action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Add duration.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Add metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Error detail attached to a log entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorDetail {
    /// Error type name
    pub name: String,
    /// Error message
    pub message: String,
    /// Optional backtrace or source chain
    pub stack: Option<String>,
    /// Optional error code
    pub code: Option<String>,
}

impl ErrorDetail {
    /// Build a detail from any error, capturing its source chain as the stack.
    #[must_use]
    pub fn from_error(name: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            name: name.into(),
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
            code: None,
        }
    }

    /// Add an error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Immutable log record kept in the ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Message
    pub message: String,
    /// Sanitized context
    pub context: LogContext,
    /// Sanitized error detail
    pub error: Option<ErrorDetail>,
}

impl LogEntry {
    /// Create a new entry stamped with the current time.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>, context: LogContext) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            context,
            error: None,
        }
    }

    /// Attach error detail.
    #[must_use]
    pub fn with_error(mut self, error: ErrorDetail) -> Self {
        self.error = Some(error);
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Structured logger with a bounded FIFO buffer.
#[derive(Debug)]
pub struct Logger {
    capacity: usize,
    buffer: Mutex<VecDeque<LogEntry>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl Logger {
    /// Create a logger keeping at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record an entry. Never fails.
    pub fn record(&self, mut entry: LogEntry) {
        entry.context.metadata = sanitize_map(std::mem::take(&mut entry.context.metadata));
        if let Some(detail) = entry.error.as_mut() {
            detail.message = redact_bearer(&detail.message);
            detail.stack = detail.stack.as_deref().map(redact_bearer);
        }
        entry.message = redact_bearer(&entry.message);

        emit(&entry);

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Log at an arbitrary level.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, context: LogContext) {
        self.record(LogEntry::new(level, message, context));
    }

    /// Log a debug message.
    pub fn debug(&self, message: impl Into<String>, context: LogContext) {
        self.log(LogLevel::Debug, message, context);
    }

    /// Log an info message.
    pub fn info(&self, message: impl Into<String>, context: LogContext) {
        self.log(LogLevel::Info, message, context);
    }

    /// Log a warning message.
    pub fn warn(&self, message: impl Into<String>, context: LogContext) {
        self.log(LogLevel::Warn, message, context);
    }

    /// Log an error message.
    pub fn error(&self, message: impl Into<String>, context: LogContext) {
        self.log(LogLevel::Error, message, context);
    }

    /// Log a critical message.
    pub fn critical(&self, message: impl Into<String>, context: LogContext) {
        self.log(LogLevel::Critical, message, context);
    }

    /// Log an error message with error detail.
    pub fn error_with(&self, message: impl Into<String>, context: LogContext, detail: ErrorDetail) {
        self.record(LogEntry::new(LogLevel::Error, message, context).with_error(detail));
    }

    /// Log a critical message with error detail.
    pub fn critical_with(
        &self,
        message: impl Into<String>,
        context: LogContext,
        detail: ErrorDetail,
    ) {
        self.record(LogEntry::new(LogLevel::Critical, message, context).with_error(detail));
    }

    /// Newest `count` entries in emission order, optionally limited to one level.
    #[must_use]
    pub fn recent_logs(&self, count: usize, level: Option<LogLevel>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        let mut entries: Vec<LogEntry> = buffer
            .iter()
            .rev()
            .filter(|entry| level.is_none_or(|l| entry.level == l))
            .take(count)
            .cloned()
            .collect();
        entries.reverse();
        entries
    }

    /// Number of error and critical entries newer than `window`.
    #[must_use]
    pub fn error_count(&self, window: Duration) -> usize {
        let cutoff = cutoff(window);
        self.buffer
            .lock()
            .iter()
            .filter(|entry| entry.level.is_error() && entry.timestamp >= cutoff)
            .count()
    }

    /// Number of entries of any level newer than `window`.
    #[must_use]
    pub fn entry_count(&self, window: Duration) -> usize {
        let cutoff = cutoff(window);
        self.buffer
            .lock()
            .iter()
            .filter(|entry| entry.timestamp >= cutoff)
            .count()
    }

    /// Current number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Buffer capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every buffered entry.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

fn cutoff(window: Duration) -> DateTime<Utc> {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Whether a metadata key names a sensitive field.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    SENSITIVE_EXACT_KEYS.contains(&normalized.as_str())
        || SENSITIVE_KEYS.iter().any(|pattern| normalized.contains(pattern))
}

/// Redact sensitive fields from a metadata map, recursively.
#[must_use]
pub fn sanitize_map(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            if is_sensitive_key(&key) {
                (key, Value::String(REDACTED.to_string()))
            } else {
                (key, sanitize_value(value))
            }
        })
        .collect()
}

/// Redact sensitive fields from any JSON value, recursively.
#[must_use]
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_map(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}

fn redact_bearer(text: &str) -> String {
    match BEARER_PATTERN.as_ref() {
        Some(pattern) => pattern
            .replace_all(text, format!("Bearer {REDACTED}").as_str())
            .into_owned(),
        None => text.to_string(),
    }
}

/// Emit an entry through `tracing`.
fn emit(entry: &LogEntry) {
    let module = entry.context.module.as_str();
    let action = entry.context.action.as_deref().unwrap_or("-");
    let metadata = Value::Object(entry.context.metadata.clone());
    let error_message = entry.error.as_ref().map_or("-", |e| e.message.as_str());

    match entry.level {
        LogLevel::Debug => debug!(module, action, %metadata, "{}", entry.message),
        LogLevel::Info => info!(module, action, %metadata, "{}", entry.message),
        LogLevel::Warn => {
            warn!(module, action, %metadata, error = error_message, "{}", entry.message);
        }
        LogLevel::Error | LogLevel::Critical => error!(
            module,
            action,
            %metadata,
            error = error_message,
            critical = matches!(entry.level, LogLevel::Critical),
            "{}",
            entry.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_context_builder() {
        let ctx = LogContext::new("cash_register")
            .with_tenant("store-7")
            .with_user("cashier-1")
            .with_action("close_shift")
            .with_duration(Duration::from_millis(42))
            .with_metadata("drawer", "A");

        assert_eq!(ctx.module, "cash_register");
        assert_eq!(ctx.tenant_id.as_deref(), Some("store-7"));
        assert_eq!(ctx.duration_ms, Some(42));
        assert_eq!(ctx.metadata.get("drawer"), Some(&json!("A")));
    }

    #[test]
    fn test_sensitive_fields_redacted_recursively() {
        let logger = Logger::default();
        let ctx = LogContext::new("payments")
            .with_metadata("accessToken", "abc")
            .with_metadata(
                "customer",
                json!({"name": "Ana", "card_number": "4111", "nested": [{"cvv": "123"}]}),
            );
        logger.info("charge", ctx);

        let entry = &logger.recent_logs(1, None)[0];
        let meta = &entry.context.metadata;
        assert_eq!(meta["accessToken"], json!(REDACTED));
        assert_eq!(meta["customer"]["name"], json!("Ana"));
        assert_eq!(meta["customer"]["card_number"], json!(REDACTED));
        assert_eq!(meta["customer"]["nested"][0]["cvv"], json!(REDACTED));
    }

    #[test]
    fn test_sensitive_key_matching() {
        assert!(is_sensitive_key("api_key"));
        assert!(is_sensitive_key("Refresh-Token"));
        assert!(is_sensitive_key("PIN"));
        assert!(!is_sensitive_key("shipping_address"));
        assert!(!is_sensitive_key("quantity"));
    }

    #[test]
    fn test_bearer_tokens_redacted_from_errors() {
        let logger = Logger::default();
        let detail = ErrorDetail {
            name: "Http".into(),
            message: "rejected header Authorization: Bearer eyJhbGciOi.payload".into(),
            ..ErrorDetail::default()
        };
        logger.error_with("request failed", LogContext::new("api"), detail);

        let entry = &logger.recent_logs(1, None)[0];
        let message = &entry.error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
        assert!(!message.contains("eyJhbGciOi"));
        assert!(message.contains(REDACTED));
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let logger = Logger::new(3);
        for i in 0..5 {
            logger.info(format!("message {i}"), LogContext::new("test"));
        }

        let entries = logger.recent_logs(10, None);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "message 2");
        assert_eq!(entries[2].message, "message 4");
    }

    #[test]
    fn test_recent_logs_level_filter() {
        let logger = Logger::default();
        logger.info("a", LogContext::new("t"));
        logger.warn("b", LogContext::new("t"));
        logger.warn("c", LogContext::new("t"));
        logger.error("d", LogContext::new("t"));

        let warnings = logger.recent_logs(1, Some(LogLevel::Warn));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "c");
    }

    #[test]
    fn test_error_count_window() {
        let logger = Logger::default();
        logger.error("recent", LogContext::new("t"));
        logger.critical("recent critical", LogContext::new("t"));
        logger.warn("not an error", LogContext::new("t"));
        logger.record(
            LogEntry::new(LogLevel::Error, "old", LogContext::new("t"))
                .with_timestamp(Utc::now() - chrono::Duration::minutes(10)),
        );

        assert_eq!(logger.error_count(Duration::from_secs(300)), 2);
        assert_eq!(logger.error_count(Duration::from_secs(3600)), 3);
    }

    #[test]
    fn test_log_level_as_str() {
        assert_eq!(LogLevel::Debug.as_str(), "DEBUG");
        assert_eq!(LogLevel::Warn.as_str(), "WARN");
        assert_eq!(LogLevel::Critical.as_str(), "CRITICAL");
        assert!(LogLevel::Critical.is_error());
        assert!(!LogLevel::Warn.is_error());
    }
}
