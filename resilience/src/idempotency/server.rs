//! Persisted replay protection for inbound mutations.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::ResilienceError;
use crate::logger::{LogContext, Logger};

/// How long a stored response is replayed.
pub const DEFAULT_SERVER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A stored response for one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// The key, unique per store
    pub key: String,
    /// Response body
    pub result: Value,
    /// Response status
    pub status_code: u16,
    /// When the record was written
    pub created_at: DateTime<Utc>,
    /// When the record stops being replayed
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Whether the record is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Body and status replayed for a duplicate request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResponse {
    /// Response body
    pub result: Value,
    /// Response status
    pub status_code: u16,
}

/// Persistence for idempotency records.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Unexpired record for `key`.
    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, ResilienceError>;

    /// Insert or replace the record for `record.key`.
    async fn upsert(&self, record: IdempotencyRecord) -> Result<(), ResilienceError>;

    /// Delete expired records. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, ResilienceError>;
}

/// In-memory store keyed by idempotency key.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, ResilienceError> {
        let now = Utc::now();
        let mut records = self.records.lock();
        match records.get(key).map(|record| record.is_expired(now)) {
            Some(true) => {
                records.remove(key);
                Ok(None)
            }
            Some(false) => Ok(records.get(key).cloned()),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: IdempotencyRecord) -> Result<(), ResilienceError> {
        self.records.lock().insert(record.key.clone(), record);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, ResilienceError> {
        let now = Utc::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok(before - records.len())
    }
}

type KeyLocks = Mutex<HashMap<String, Weak<AsyncMutex<()>>>>;

/// Held while a request with a given key is being processed.
#[derive(Debug)]
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Server-side replay protection over an [`IdempotencyStore`].
pub struct ServerIdempotency {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    locks: KeyLocks,
    logger: Option<Arc<Logger>>,
}

impl std::fmt::Debug for ServerIdempotency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdempotency")
            .field("ttl", &self.ttl)
            .field("locks", &self.locks.lock().len())
            .finish_non_exhaustive()
    }
}

impl ServerIdempotency {
    /// Wrap `store`, replaying records for `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            locks: Mutex::new(HashMap::new()),
            logger: None,
        }
    }

    /// Report storage failures through `logger`.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Stored response for `key`, if any.
    ///
    /// Storage failures are logged and treated as a miss.
    pub async fn check(&self, key: &str) -> Option<StoredResponse> {
        match self.store.find(key).await {
            Ok(record) => record.map(|record| StoredResponse {
                result: record.result,
                status_code: record.status_code,
            }),
            Err(err) => {
                self.warn("Idempotency lookup failed, executing request", key, &err);
                None
            }
        }
    }

    /// Persist the response for `key`. Failures are logged, not returned.
    pub async fn save(&self, key: &str, result: Value, status_code: u16) {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let record = IdempotencyRecord {
            key: key.to_string(),
            result,
            status_code,
            created_at,
            expires_at,
        };
        if let Err(err) = self.store.upsert(record).await {
            self.warn("Failed to persist idempotency record", key, &err);
        }
    }

    /// Serialize processing of requests carrying `key` within this process.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut locks = self.locks.lock();
            locks.retain(|_, weak| weak.strong_count() > 0);
            if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
                existing
            } else {
                let created = Arc::new(AsyncMutex::new(()));
                locks.insert(key.to_string(), Arc::downgrade(&created));
                created
            }
        };
        KeyGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Purge expired records from the store.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn purge_expired(&self) -> Result<usize, ResilienceError> {
        self.store.purge_expired().await
    }

    fn warn(&self, message: &str, key: &str, err: &ResilienceError) {
        if let Some(logger) = &self.logger {
            logger.warn(
                message,
                LogContext::new("idempotency")
                    .with_metadata("idempotency_key", key)
                    .with_metadata("error", err.to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl IdempotencyStore for BrokenStore {
        async fn find(&self, _key: &str) -> Result<Option<IdempotencyRecord>, ResilienceError> {
            Err(ResilienceError::storage("connection reset"))
        }

        async fn upsert(&self, _record: IdempotencyRecord) -> Result<(), ResilienceError> {
            Err(ResilienceError::storage("read only"))
        }

        async fn purge_expired(&self) -> Result<usize, ResilienceError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_save_then_check() {
        let server =
            ServerIdempotency::new(Arc::new(InMemoryIdempotencyStore::new()), DEFAULT_SERVER_TTL);
        assert!(server.check("po-7").await.is_none());

        server.save("po-7", json!({"id": 7}), 201).await;
        let stored = server.check("po-7").await;
        assert_eq!(
            stored,
            Some(StoredResponse {
                result: json!({"id": 7}),
                status_code: 201
            })
        );
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates_expiry() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let server = ServerIdempotency::new(store.clone(), Duration::from_secs(u64::MAX));
        server.save("forever", json!({"id": 1}), 201).await;

        assert_eq!(server.check("forever").await.map(|r| r.status_code), Some(201));
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let server = ServerIdempotency::new(store.clone(), DEFAULT_SERVER_TTL);
        server.save("k", json!(1), 200).await;
        server.save("k", json!(2), 200).await;

        assert_eq!(store.len(), 1);
        assert_eq!(server.check("k").await.map(|r| r.result), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_expired_records_are_not_replayed() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let now = Utc::now();
        store
            .upsert(IdempotencyRecord {
                key: "old".into(),
                result: json!(null),
                status_code: 200,
                created_at: now - chrono::Duration::days(2),
                expires_at: now - chrono::Duration::days(1),
            })
            .await
            .ok();
        store
            .upsert(IdempotencyRecord {
                key: "older".into(),
                result: json!(null),
                status_code: 200,
                created_at: now - chrono::Duration::days(3),
                expires_at: now - chrono::Duration::days(2),
            })
            .await
            .ok();

        let server = ServerIdempotency::new(store.clone(), DEFAULT_SERVER_TTL);
        assert!(server.check("old").await.is_none());
        assert_eq!(server.purge_expired().await.ok(), Some(1));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_fails_open() {
        let logger = Arc::new(Logger::default());
        let server = ServerIdempotency::new(Arc::new(BrokenStore), DEFAULT_SERVER_TTL)
            .with_logger(Arc::clone(&logger));

        assert!(server.check("k").await.is_none());
        server.save("k", json!({}), 200).await;
        assert_eq!(logger.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_serializes_same_key() {
        let server = Arc::new(ServerIdempotency::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            DEFAULT_SERVER_TTL,
        ));
        let guard = server.lock("k").await;

        let contender = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let _guard = server.lock("k").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        let _other = server.lock("other").await;
        drop(guard);
        assert!(contender.await.is_ok());
    }
}
