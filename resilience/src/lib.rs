//! Resilience and auto-recovery layer for retail back-office services.
//!
//! This crate provides:
//! - A structured logger with sensitive-field redaction and a ring buffer
//! - Retry with exponential backoff and jitter
//! - Per-dependency circuit breakers
//! - Rule-based issue classification with safe-default recovery helpers
//! - Client- and server-side idempotency
//! - Feature flags with maintenance mode
//! - A system alert bus for major issues
//! - Health aggregation across dependencies
//! - Outbound and inbound request pipelines composing all of the above

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alerts;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod feature_flags;
pub mod health;
pub mod http;
pub mod idempotency;
pub mod logger;
pub mod metrics;
pub mod retry;
pub mod tracing_config;
pub mod wrapper;

pub use alerts::{Subscription, SystemAlert, SystemAlertBus};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use classifier::{
    ClassifiedIssue, ClassifyContext, IssueCategory, IssueClassifier, Recovery, Severity,
};
pub use config::{ConfigError, ResilienceConfig};
pub use context::{ContextBuilder, ResilienceContext};
pub use error::ResilienceError;
pub use feature_flags::{FeatureFlag, FeatureFlagStore, KeyValueStorage, MemoryStorage};
pub use health::{
    DatabaseProbe, HealthAggregator, HealthStatus, HttpDependencyProbe, SystemHealth,
};
pub use http::{HttpConfig, build_http_client};
pub use idempotency::{
    IdempotencyStore, IdempotencyTracker, InMemoryIdempotencyStore, ServerIdempotency,
};
pub use logger::{LogContext, LogEntry, LogLevel, Logger};
pub use metrics::ResilienceMetrics;
pub use retry::{RetryConfig, RetryPolicy};
pub use tracing_config::{TracingConfig, init_tracing};
pub use wrapper::{
    BoundaryOptions, BoundaryRequest, BoundaryResponse, BoundaryWrapper, RequestOptions,
    RequestWrapper, TokenProvider,
};
