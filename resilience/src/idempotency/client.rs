//! In-process duplicate suppression for outbound mutations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ResilienceError;
use crate::logger::{LogContext, Logger};

/// How long a key blocks duplicates.
pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(5 * 60);

/// Interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of a tracked key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    /// Running
    Pending,
    /// Finished, with an optional cached result
    Completed(Option<Value>),
}

#[derive(Debug, Clone)]
struct Tracked {
    started_at: Instant,
    state: OperationState,
}

/// What [`IdempotencyTracker::with_idempotency`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotentOutcome<T> {
    /// The operation ran
    Executed(T),
    /// An earlier run's result was returned
    Cached(T),
    /// Another call with the same key is still running
    InFlight,
}

impl<T> IdempotentOutcome<T> {
    /// The value, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Executed(value) | Self::Cached(value) => Some(value),
            Self::InFlight => None,
        }
    }
}

/// Generate a fresh idempotency key.
#[must_use]
pub fn generate_key() -> String {
    Uuid::new_v4().to_string()
}

/// Tracks in-flight and recently completed operations by key.
#[derive(Debug)]
pub struct IdempotencyTracker {
    entries: Mutex<HashMap<String, Tracked>>,
    ttl: Duration,
    logger: Option<Arc<Logger>>,
}

impl Default for IdempotencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_TTL)
    }
}

impl IdempotencyTracker {
    /// Tracker whose keys expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            logger: None,
        }
    }

    /// Report duplicates through `logger`.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Claim `key`. Returns false if it is already claimed and unexpired.
    pub fn start_operation(&self, key: &str) -> bool {
        self.try_start(key).is_some()
    }

    /// Claim `key` for the lifetime of the returned guard.
    ///
    /// The key is released when the guard is dropped without
    /// [`OperationClaim::complete`], so an abandoned caller never blocks
    /// retries for the whole TTL. Returns `None` if the key is taken.
    pub fn claim(&self, key: &str) -> Option<OperationClaim<'_>> {
        self.try_start(key).map(|started_at| OperationClaim {
            tracker: self,
            key: key.to_string(),
            started_at,
            settled: false,
        })
    }

    fn try_start(&self, key: &str) -> Option<Instant> {
        let now = Instant::now();
        let claimed = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if now.saturating_duration_since(entry.started_at) < self.ttl => false,
                _ => {
                    entries.insert(
                        key.to_string(),
                        Tracked {
                            started_at: now,
                            state: OperationState::Pending,
                        },
                    );
                    true
                }
            }
        };
        if claimed {
            Some(now)
        } else {
            self.warn_duplicate(key);
            None
        }
    }

    /// Remove `key` only if it is still the pending claim started at `started_at`.
    fn release(&self, key: &str, started_at: Instant) {
        let mut entries = self.entries.lock();
        let ours = entries.get(key).is_some_and(|entry| {
            entry.started_at == started_at && entry.state == OperationState::Pending
        });
        if ours {
            entries.remove(key);
        }
    }

    /// Mark `key` finished and cache `result`.
    pub fn complete_operation(&self, key: &str, result: Option<Value>) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.state = OperationState::Completed(result);
        }
    }

    /// Release `key` so it can be retried.
    pub fn cancel_operation(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Current state of `key`, ignoring expired entries.
    #[must_use]
    pub fn state(&self, key: &str) -> Option<OperationState> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.started_at.elapsed() < self.ttl)
            .map(|entry| entry.state.clone())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.started_at) < self.ttl);
        before - entries.len()
    }

    /// Number of tracked keys, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Sweep every `interval` until the tracker is dropped.
    ///
    /// Intervals shorter than one second are raised to one second.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                let removed = tracker.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired idempotency keys");
                }
            }
        })
    }

    /// Run `operation` at most once per key within the TTL.
    ///
    /// A completed key returns its cached result; a pending key returns
    /// [`IdempotentOutcome::InFlight`]. A failed operation releases the key.
    ///
    /// # Errors
    ///
    /// Propagates the operation's error, or a serialization error for the
    /// cached result.
    pub async fn with_idempotency<T, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<IdempotentOutcome<T>, ResilienceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        match self.state(key) {
            Some(OperationState::Completed(Some(cached))) => {
                return Ok(IdempotentOutcome::Cached(serde_json::from_value(cached)?));
            }
            Some(_) => {
                self.warn_duplicate(key);
                return Ok(IdempotentOutcome::InFlight);
            }
            None => {}
        }

        let Some(claim) = self.claim(key) else {
            return Ok(IdempotentOutcome::InFlight);
        };

        let value = operation().await?;
        claim.complete(serde_json::to_value(&value).ok());
        Ok(IdempotentOutcome::Executed(value))
    }

    fn warn_duplicate(&self, key: &str) {
        if let Some(logger) = &self.logger {
            logger.warn(
                "Duplicate operation prevented",
                LogContext::new("idempotency").with_metadata("idempotency_key", key),
            );
        }
    }
}

/// A claimed key, released on drop unless completed.
#[derive(Debug)]
#[must_use = "dropping the claim releases the key"]
pub struct OperationClaim<'a> {
    tracker: &'a IdempotencyTracker,
    key: String,
    started_at: Instant,
    settled: bool,
}

impl OperationClaim<'_> {
    /// Claimed key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Mark the operation finished and cache `result`.
    pub fn complete(mut self, result: Option<Value>) {
        self.tracker.complete_operation(&self.key, result);
        self.settled = true;
    }
}

impl Drop for OperationClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.release(&self.key, self.started_at);
        }
    }
}
