//! Prometheus text metrics for the request pipelines.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Monotonic counter.
#[derive(Debug)]
pub struct Counter {
    name: String,
    help: String,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by `amount`.
    pub fn inc_by(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prometheus exposition text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = header(&self.name, &self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
        out
    }
}

/// Point-in-time value.
#[derive(Debug)]
pub struct Gauge {
    name: String,
    help: String,
    value: AtomicU64,
}

impl Gauge {
    /// Create a new gauge.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Set the value.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Prometheus exposition text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = header(&self.name, &self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
        out
    }
}

/// Counter split by one label.
#[derive(Debug)]
pub struct LabeledCounter {
    name: String,
    help: String,
    label: &'static str,
    values: Mutex<BTreeMap<String, u64>>,
}

impl LabeledCounter {
    /// Create a counter labelled by `label`.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>, label: &'static str) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    /// Increment the series for `value`.
    pub fn inc(&self, value: &str) {
        *self.values.lock().entry(value.to_string()).or_insert(0) += 1;
    }

    /// Current value of the series for `value`.
    #[must_use]
    pub fn get(&self, value: &str) -> u64 {
        self.values.lock().get(value).copied().unwrap_or(0)
    }

    /// Prometheus exposition text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = header(&self.name, &self.help, "counter");
        for (value, count) in self.values.lock().iter() {
            let _ = writeln!(out, "{}{{{}=\"{}\"}} {count}", self.name, self.label, value);
        }
        out
    }
}

fn header(name: &str, help: &str, kind: &str) -> String {
    format!("# HELP {name} {help}\n# TYPE {name} {kind}\n")
}

/// Pipeline metrics.
#[derive(Debug)]
pub struct ResilienceMetrics {
    /// Outbound requests sent
    pub requests: Counter,
    /// Outbound requests that failed terminally
    pub request_failures: Counter,
    /// Calls rejected by an open circuit
    pub circuit_rejections: Counter,
    /// Duplicate mutations suppressed or replayed
    pub duplicates_prevented: Counter,
    /// System alerts raised
    pub alerts_emitted: Counter,
    /// Inbound responses by outcome
    pub boundary_responses: LabeledCounter,
    /// Circuits currently open, refreshed on render
    pub open_circuits: Gauge,
}

impl Default for ResilienceMetrics {
    fn default() -> Self {
        Self::new("retail")
    }
}

impl ResilienceMetrics {
    /// Metrics named `<prefix>_...`.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            requests: Counter::new(format!("{prefix}_requests_total"), "Outbound requests sent"),
            request_failures: Counter::new(
                format!("{prefix}_request_failures_total"),
                "Outbound requests that failed after recovery attempts",
            ),
            circuit_rejections: Counter::new(
                format!("{prefix}_circuit_rejections_total"),
                "Calls rejected by an open circuit breaker",
            ),
            duplicates_prevented: Counter::new(
                format!("{prefix}_duplicates_prevented_total"),
                "Duplicate mutations suppressed or replayed",
            ),
            alerts_emitted: Counter::new(
                format!("{prefix}_alerts_emitted_total"),
                "System alerts raised",
            ),
            boundary_responses: LabeledCounter::new(
                format!("{prefix}_boundary_responses_total"),
                "Inbound responses by outcome",
                "outcome",
            ),
            open_circuits: Gauge::new(
                format!("{prefix}_open_circuits"),
                "Circuit breakers currently open",
            ),
        }
    }

    /// Every metric as Prometheus text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        [
            self.requests.to_prometheus(),
            self.request_failures.to_prometheus(),
            self.circuit_rejections.to_prometheus(),
            self.duplicates_prevented.to_prometheus(),
            self.alerts_emitted.to_prometheus(),
            self.boundary_responses.to_prometheus(),
            self.open_circuits.to_prometheus(),
        ]
        .concat()
    }
}
