//! Circuit breaker state machine.
//!
//! Pure transition logic; locking and logging live in the parent module.
//! Legal edges: CLOSED→OPEN, OPEN→HALF_OPEN, HALF_OPEN→CLOSED, HALF_OPEN→OPEN.
//!
//! Every state change bumps an epoch. Admissions carry the epoch they were
//! granted in, and outcomes from an older epoch are ignored.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests flow through normally
    Closed,
    /// Circuit is open, requests fail fast
    Open,
    /// Circuit is admitting a trial request
    HalfOpen,
}

impl CircuitState {
    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of asking the circuit whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may run; `trial` marks the single HALF_OPEN probe
    Allowed {
        /// Whether this call is the half-open trial
        trial: bool,
        /// State epoch the call was admitted in
        epoch: u64,
    },
    /// The call is rejected without running
    Rejected {
        /// Time left before a trial call is admitted
        retry_after: Duration,
    },
}

/// A state change worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// CLOSED→OPEN after `failures` consecutive failures
    Opened {
        /// Consecutive failures that tripped the circuit
        failures: u32,
    },
    /// OPEN→HALF_OPEN after the reset timeout
    HalfOpened,
    /// HALF_OPEN→CLOSED after enough successful trials
    Closed,
    /// HALF_OPEN→OPEN after a failed trial
    Reopened,
}

/// Mutable breaker state.
#[derive(Debug)]
pub struct CircuitBreakerState {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while CLOSED
    pub failure_count: u32,
    /// Consecutive successes while HALF_OPEN
    pub success_count: u32,
    /// Monotonic time of the failure that last opened the circuit
    pub last_failure_time: Option<Instant>,
    /// Wall-clock time of the same failure, for reporting
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Whether the half-open trial call is running
    pub trial_in_flight: bool,
    /// Incremented on every state change
    pub epoch: u64,
}

impl CircuitBreakerState {
    /// Fresh CLOSED state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_failure_at: None,
            trial_in_flight: false,
            epoch: 0,
        }
    }

    /// Decide whether a call may run at `now`.
    pub fn admit(
        &mut self,
        now: Instant,
        reset_timeout: Duration,
    ) -> (Admission, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (self.allowed(false), None),
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    (Admission::Rejected { retry_after: Duration::ZERO }, None)
                } else {
                    self.trial_in_flight = true;
                    (self.allowed(true), None)
                }
            }
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_time
                    .map_or(reset_timeout, |last| now.saturating_duration_since(last));
                if elapsed >= reset_timeout {
                    self.enter(CircuitState::HalfOpen);
                    self.success_count = 0;
                    self.trial_in_flight = true;
                    (self.allowed(true), Some(Transition::HalfOpened))
                } else {
                    (
                        Admission::Rejected {
                            retry_after: reset_timeout.saturating_sub(elapsed),
                        },
                        None,
                    )
                }
            }
        }
    }

    /// Record a successful call admitted in `epoch`.
    pub fn record_success(&mut self, epoch: u64, success_threshold: u32) -> Option<Transition> {
        if epoch != self.epoch {
            return None;
        }
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
                self.success_count += 1;
                if self.success_count >= success_threshold {
                    self.enter(CircuitState::Closed);
                    self.failure_count = 0;
                    self.success_count = 0;
                    Some(Transition::Closed)
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed call admitted in `epoch`.
    pub fn record_failure(
        &mut self,
        epoch: u64,
        failure_threshold: u32,
        now: Instant,
    ) -> Option<Transition> {
        if epoch != self.epoch {
            return None;
        }
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= failure_threshold {
                    self.open(now);
                    Some(Transition::Opened {
                        failures: self.failure_count,
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
                self.open(now);
                Some(Transition::Reopened)
            }
            CircuitState::Open => None,
        }
    }

    /// Release the trial slot of a call admitted in `epoch` that never completed.
    pub fn abandon_trial(&mut self, epoch: u64) {
        if epoch == self.epoch {
            self.trial_in_flight = false;
        }
    }

    /// Administrative reset to CLOSED.
    pub fn reset(&mut self) {
        let epoch = self.epoch;
        *self = Self::new();
        self.epoch = epoch.wrapping_add(1);
    }

    const fn allowed(&self, trial: bool) -> Admission {
        Admission::Allowed {
            trial,
            epoch: self.epoch,
        }
    }

    const fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn open(&mut self, now: Instant) {
        self.enter(CircuitState::Open);
        self.success_count = 0;
        self.last_failure_time = Some(now);
        self.last_failure_at = Some(Utc::now());
    }
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::new()
    }
}
