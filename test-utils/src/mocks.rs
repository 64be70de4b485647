//! Mock implementations for testing.
//!
//! Each mock implements one of the seams the resilience layer injects:
//! token lifecycle, database liveness, idempotency persistence and flag
//! storage. They count calls so tests can assert on interactions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use retail_resilience::error::ResilienceError;
use retail_resilience::feature_flags::KeyValueStorage;
use retail_resilience::health::DatabaseProbe;
use retail_resilience::idempotency::{IdempotencyRecord, IdempotencyStore};
use retail_resilience::wrapper::TokenProvider;

/// Mock token provider.
#[derive(Debug, Default)]
pub struct MockTokenProvider {
    stale: AtomicBool,
    refresh_fails: AtomicBool,
    refreshes: AtomicU32,
    sign_outs: AtomicU32,
}

impl MockTokenProvider {
    /// Provider with a fresh token that refreshes successfully.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the token as close to expiry.
    #[must_use]
    pub fn stale(self) -> Self {
        self.stale.store(true, Ordering::SeqCst);
        self
    }

    /// Make every refresh fail.
    #[must_use]
    pub fn failing_refresh(self) -> Self {
        self.refresh_fails.store(true, Ordering::SeqCst);
        self
    }

    /// Number of refresh calls.
    pub fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Number of sign-outs.
    pub fn sign_outs(&self) -> u32 {
        self.sign_outs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn needs_refresh(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    async fn refresh(&self) -> Result<(), ResilienceError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(ResilienceError::AuthFailed("refresh token revoked".into()));
        }
        self.stale.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn sign_out(&self) {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mock database probe that can be switched down.
#[derive(Debug, Default)]
pub struct MockDatabase {
    down: AtomicBool,
    pings: AtomicU32,
}

impl MockDatabase {
    /// Reachable database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make pings fail or succeed.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Number of pings.
    pub fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseProbe for MockDatabase {
    async fn ping(&self) -> Result<(), ResilienceError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(ResilienceError::storage("connection pool exhausted"));
        }
        Ok(())
    }
}

/// Idempotency store whose backend is always down.
#[derive(Debug, Default)]
pub struct FailingIdempotencyStore {
    calls: AtomicU32,
}

impl FailingIdempotencyStore {
    /// Create a new failing store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store calls.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, ResilienceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ResilienceError::storage("idempotency collection unavailable"))
    }
}

#[async_trait]
impl IdempotencyStore for FailingIdempotencyStore {
    async fn find(&self, _key: &str) -> Result<Option<IdempotencyRecord>, ResilienceError> {
        self.fail()
    }

    async fn upsert(&self, _record: IdempotencyRecord) -> Result<(), ResilienceError> {
        self.fail()
    }

    async fn purge_expired(&self) -> Result<usize, ResilienceError> {
        self.fail()
    }
}

/// Flag storage that rejects every operation.
#[derive(Debug, Default)]
pub struct FailingStorage;

impl KeyValueStorage for FailingStorage {
    fn get(&self, _key: &str) -> Result<Option<String>, ResilienceError> {
        Err(ResilienceError::storage("storage quota exceeded"))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), ResilienceError> {
        Err(ResilienceError::storage("storage quota exceeded"))
    }

    fn remove(&self, _key: &str) -> Result<(), ResilienceError> {
        Err(ResilienceError::storage("storage quota exceeded"))
    }
}

/// Remote call that plays back a script of outcomes.
///
/// Once the script is exhausted every further call returns `fallback`.
#[derive(Debug)]
pub struct ScriptedService<T> {
    script: Mutex<VecDeque<Result<T, ResilienceError>>>,
    fallback: T,
    calls: AtomicU32,
}

impl<T: Clone> ScriptedService<T> {
    /// Service that answers `fallback` after the scripted outcomes.
    #[must_use]
    pub fn new(fallback: T) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    /// Fail `times` times with errors built by `error`.
    #[must_use]
    pub fn failing(self, times: usize, error: impl Fn() -> ResilienceError) -> Self {
        self.script.lock().extend((0..times).map(|_| Err(error())));
        self
    }

    /// Answer once with `value`.
    #[must_use]
    pub fn then(self, value: T) -> Self {
        self.script.lock().push_back(Ok(value));
        self
    }

    /// Next outcome.
    pub async fn call(&self) -> Result<T, ResilienceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        tokio::task::yield_now().await;
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    /// Number of calls so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_token_provider() {
        let tokens = MockTokenProvider::new().stale();
        assert!(tokens.needs_refresh().await);
        assert!(tokens.refresh().await.is_ok());
        assert!(!tokens.needs_refresh().await);
        assert_eq!(tokens.refreshes(), 1);

        let revoked = MockTokenProvider::new().failing_refresh();
        assert!(revoked.refresh().await.is_err());
        revoked.sign_out().await;
        assert_eq!(revoked.sign_outs(), 1);
    }

    #[tokio::test]
    async fn test_mock_database() {
        let db = MockDatabase::new();
        assert!(db.ping().await.is_ok());
        db.set_down(true);
        assert!(db.ping().await.is_err());
        assert_eq!(db.pings(), 2);
    }

    #[tokio::test]
    async fn test_scripted_service() {
        let service = ScriptedService::new(7)
            .failing(2, || ResilienceError::unavailable("stock-api"))
            .then(3);

        assert!(service.call().await.is_err());
        assert!(service.call().await.is_err());
        assert_eq!(service.call().await.unwrap(), 3);
        assert_eq!(service.call().await.unwrap(), 7);
        assert_eq!(service.calls(), 4);
    }

    #[tokio::test]
    async fn test_failing_stores() {
        let store = FailingIdempotencyStore::new();
        assert!(store.find("k").await.is_err());
        assert!(store.purge_expired().await.is_err());
        assert_eq!(store.calls(), 2);

        assert!(FailingStorage.get("k").is_err());
    }
}
