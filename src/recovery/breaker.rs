//! Per-operation circuit breaker.
//!
//! State machine: `Closed` counts consecutive failures; reaching the
//! threshold opens the breaker. `Open` short-circuits callers until the
//! reset time has elapsed since the last failure, then the next caller is
//! admitted as a `HalfOpen` probe. A probe success closes the breaker and
//! clears the counter; a probe failure re-opens it.
//!
//! Time is passed in explicitly (`tokio::time::Instant`) so tests drive
//! the clock instead of sleeping.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    /// Normal operation; failures are counted.
    Closed,
    /// Downstream failing; calls short-circuit.
    Open,
    /// One probe call admitted to test recovery.
    HalfOpen,
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures counted while closed.
    pub consecutive_failures: u32,
    /// Times the breaker has opened over its lifetime.
    pub trips: u64,
}

/// Circuit breaker for one named operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    reset_time: Duration,
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    trips: u64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, threshold: u32, reset_time: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            reset_time,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            trips: 0,
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// Transitions `Open → HalfOpen` when the reset time has elapsed since
    /// the last failure; the admitted call is the recovery probe.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at));
                if elapsed.is_some_and(|e| e >= self.reset_time) {
                    info!(breaker = %self.name, "reset time elapsed, admitting half-open probe");
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. A half-open probe success closes the
    /// breaker; any success clears the failure counter.
    pub fn record_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            info!(breaker = %self.name, "half-open probe succeeded, closing");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
    }

    /// Record a failed call. Returns `true` when this failure opened the
    /// breaker (threshold reached, or half-open probe failed).
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.last_failure_at = Some(now);
        match self.state {
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "half-open probe failed, re-opening");
                self.state = BreakerState::Open;
                self.trips = self.trips.saturating_add(1);
                true
            }
            BreakerState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.threshold {
                    warn!(
                        breaker = %self.name,
                        failures = self.consecutive_failures,
                        "failure threshold reached, opening"
                    );
                    self.state = BreakerState::Open;
                    self.trips = self.trips.saturating_add(1);
                    true
                } else {
                    false
                }
            }
            // Failures reported while open (in-flight calls that started
            // earlier) only refresh the reset window.
            BreakerState::Open => false,
        }
    }

    /// Current state without side effects.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Point-in-time view for status reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            trips: self.trips,
        }
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
