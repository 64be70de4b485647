//! System alert bus.
//!
//! Turns major, non-recoverable issues into alerts the UI can show, keeps the
//! most recent ones, and fans each new alert out to subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::classifier::{ClassifiedIssue, IssueCategory, Severity};
use crate::logger::{LogContext, Logger};

/// Number of alerts kept.
pub const MAX_ALERTS: usize = 20;

/// Callback invoked for every new alert.
pub type AlertListener = Arc<dyn Fn(&SystemAlert) + Send + Sync>;

type Listeners = Mutex<Vec<(u64, AlertListener)>>;

/// An alert shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAlert {
    /// Unique id
    pub id: Uuid,
    /// Severity of the underlying issue
    pub severity: Severity,
    /// Category of the underlying issue
    pub category: IssueCategory,
    /// User-facing message
    pub message: String,
    /// Module the issue came from
    pub module: String,
    /// When the alert was raised
    pub timestamp: DateTime<Utc>,
    /// Whether the user dismissed it
    pub dismissed: bool,
    /// Whether the system recovered on its own
    pub auto_recovered: bool,
}

/// Publish/subscribe channel for system alerts.
pub struct SystemAlertBus {
    alerts: Mutex<VecDeque<SystemAlert>>,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
    logger: Option<Arc<Logger>>,
}

impl std::fmt::Debug for SystemAlertBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemAlertBus")
            .field("alerts", &self.alerts.lock().len())
            .field("listeners", &self.listeners.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for SystemAlertBus {
    fn default() -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(MAX_ALERTS)),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
            logger: None,
        }
    }
}

impl SystemAlertBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every alert raised.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Raise an alert for `issue` if it is major and not auto-recoverable.
    pub fn emit(&self, issue: &ClassifiedIssue) -> Option<SystemAlert> {
        if !issue.is_alertable() {
            return None;
        }

        let alert = SystemAlert {
            id: Uuid::new_v4(),
            severity: issue.severity,
            category: issue.category,
            message: issue.user_message.clone(),
            module: issue.module.clone(),
            timestamp: Utc::now(),
            dismissed: false,
            auto_recovered: false,
        };

        {
            let mut alerts = self.alerts.lock();
            alerts.push_back(alert.clone());
            while alerts.len() > MAX_ALERTS {
                alerts.pop_front();
            }
        }

        if let Some(logger) = &self.logger {
            let context = LogContext::new(alert.module.clone())
                .with_metadata("alert_id", alert.id.to_string());
            logger.info(format!("System alert raised: {}", alert.category), context);
        }

        let listeners: Vec<AlertListener> =
            self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(&alert);
        }

        Some(alert)
    }

    /// Register a listener. It stays attached until the handle is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SystemAlert) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Mark an alert dismissed. Returns false if no alert has that id.
    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut alerts = self.alerts.lock();
        alerts.iter_mut().find(|a| a.id == id).is_some_and(|alert| {
            alert.dismissed = true;
            true
        })
    }

    /// Remove every alert.
    pub fn clear(&self) {
        self.alerts.lock().clear();
    }

    /// Alerts not yet dismissed, oldest first.
    #[must_use]
    pub fn active(&self) -> Vec<SystemAlert> {
        self.alerts.lock().iter().filter(|a| !a.dismissed).cloned().collect()
    }

    /// Every kept alert, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<SystemAlert> {
        self.alerts.lock().iter().cloned().collect()
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Handle for an attached listener; detaches on drop.
#[derive(Debug)]
#[must_use = "dropping the subscription detaches the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Detach now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifyContext, IssueClassifier};
    use std::sync::atomic::AtomicUsize;

    fn major_issue() -> ClassifiedIssue {
        IssueClassifier::new().classify("refund failed", &ClassifyContext::new("sales"))
    }

    #[test]
    fn test_minor_issue_raises_nothing() {
        let bus = SystemAlertBus::new();
        let minor = IssueClassifier::new().classify("network blip", &ClassifyContext::new("sales"));
        assert!(bus.emit(&minor).is_none());
        assert!(bus.all().is_empty());
    }

    #[test]
    fn test_major_issue_reaches_subscribers() {
        let bus = SystemAlertBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let subscription = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let alert = bus.emit(&major_issue());
        assert!(alert.is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        bus.emit(&major_issue());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_capped_at_max_alerts() {
        let bus = SystemAlertBus::new();
        let first = bus.emit(&major_issue()).map(|a| a.id);
        for _ in 0..MAX_ALERTS {
            bus.emit(&major_issue());
        }
        let all = bus.all();
        assert_eq!(all.len(), MAX_ALERTS);
        assert!(all.iter().all(|a| Some(a.id) != first));
    }

    #[test]
    fn test_dismiss_and_clear() {
        let bus = SystemAlertBus::new();
        let id = bus.emit(&major_issue()).map(|a| a.id).unwrap_or_default();
        bus.emit(&major_issue());

        assert!(bus.dismiss(id));
        assert!(!bus.dismiss(Uuid::new_v4()));
        assert_eq!(bus.active().len(), 1);
        assert_eq!(bus.all().len(), 2);

        bus.clear();
        assert!(bus.all().is_empty());
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let subscription = {
            let bus = SystemAlertBus::new();
            bus.subscribe(|_| {})
        };
        drop(subscription);
    }
}
