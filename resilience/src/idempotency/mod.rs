//! Operation deduplication by idempotency key.
//!
//! [`IdempotencyTracker`] suppresses duplicate outbound mutations inside one
//! process. [`ServerIdempotency`] replays stored responses for inbound
//! requests that carry an `Idempotency-Key` header.

mod client;
mod server;

pub use client::{
    DEFAULT_CLIENT_TTL, DEFAULT_SWEEP_INTERVAL, IdempotencyTracker, IdempotentOutcome,
    OperationClaim, OperationState, generate_key,
};
pub use server::{
    DEFAULT_SERVER_TTL, IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore, KeyGuard,
    ServerIdempotency, StoredResponse,
};

/// Header carrying the idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// HTTP methods that take part in idempotency.
pub const MUTATING_METHODS: &[&str] = &["POST", "PUT", "PATCH", "DELETE"];

/// Whether `method` is one that mutates state.
#[must_use]
pub fn is_mutating(method: &str) -> bool {
    MUTATING_METHODS.iter().any(|m| m.eq_ignore_ascii_case(method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutating_methods() {
        assert!(is_mutating("post"));
        assert!(is_mutating("DELETE"));
        assert!(!is_mutating("GET"));
        assert!(!is_mutating("options"));
    }
}
