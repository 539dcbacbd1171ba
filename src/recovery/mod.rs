//! Error recovery: retry with backoff, circuit breakers, fallbacks.
//!
//! [`ErrorRecoveryManager`] wraps arbitrary async operations with a named
//! circuit breaker and the retry policy. Operations report
//! [`OrchestrationError`]s; retry and fallback decisions key off
//! [`ErrorKind`] classification, never concrete types. The retry backoff
//! sleep observes the caller's cancellation token.

pub mod breaker;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::types::{ErrorKind, OrchestrationError};

use self::breaker::{BreakerSnapshot, CircuitBreaker};

/// Base delay before the first retry, in milliseconds.
const BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound on a single backoff sleep, in milliseconds.
const BACKOFF_CAP_MS: u64 = 10_000;

/// Attempts granted to `unknown`-classified failures regardless of the
/// configured maximum.
const UNKNOWN_MAX_ATTEMPTS: u32 = 2;

/// Service-wide recovery posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Everything nominal.
    Normal,
    /// Sustained failures observed; still serving.
    Degraded,
    /// Failure threshold tripped; new work rejected upstream.
    Emergency,
    /// Inference daemon unreachable.
    Offline,
}

/// Global recovery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    /// Current posture.
    pub mode: RecoveryMode,
    /// Failed attempts, lifetime.
    pub total_failures: u64,
    /// Successes that followed at least one failed attempt.
    pub total_recoveries: u64,
    /// Terminal failures since the last success.
    pub consecutive_failures: u32,
    /// Breaker open transitions, lifetime.
    pub breaker_trips: u64,
    /// Fallback executions, lifetime.
    pub fallback_executions: u64,
}

impl Default for RecoveryMetrics {
    fn default() -> Self {
        Self {
            mode: RecoveryMode::Normal,
            total_failures: 0,
            total_recoveries: 0,
            consecutive_failures: 0,
            breaker_trips: 0,
            fallback_executions: 0,
        }
    }
}

/// Outcome of the guarded retry loop, before fallback handling.
enum AttemptFailure {
    /// The breaker rejected the call outright; the operation never ran.
    BreakerOpen(OrchestrationError),
    /// The operation ran and failed terminally.
    Operation(OrchestrationError),
}

impl AttemptFailure {
    fn into_error(self) -> OrchestrationError {
        match self {
            Self::BreakerOpen(e) | Self::Operation(e) => e,
        }
    }

    /// Whether a provided fallback should run for this failure.
    fn wants_fallback(&self) -> bool {
        match self {
            Self::BreakerOpen(_) => true,
            Self::Operation(e) => e.is_retriable(),
        }
    }
}

/// Wraps operations with breaker, retry, and fallback behavior.
pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    metrics: Mutex<RecoveryMetrics>,
}

impl ErrorRecoveryManager {
    /// Create a manager with all breakers closed.
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            metrics: Mutex::new(RecoveryMetrics::default()),
        }
    }

    /// Execute `operation` under the breaker named `name`, retrying
    /// retriable failures with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns the terminal operation error, or an `ai-model-unavailable`
    /// error when the breaker is open.
    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        name: &str,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, OrchestrationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
    {
        self.run_guarded(name, operation, cancel)
            .await
            .map_err(AttemptFailure::into_error)
    }

    /// Like [`Self::execute_with_recovery`], but with a fallback raced
    /// against the fallback timeout when the primary fails retriably or
    /// the breaker is open.
    ///
    /// # Errors
    ///
    /// Returns the fallback's error, a timeout error when the fallback
    /// exceeds its deadline, or the primary error when no fallback applies.
    pub async fn execute_with_recovery_or<T, F, Fut, FB, FbFut>(
        &self,
        name: &str,
        operation: F,
        fallback: FB,
        cancel: &CancellationToken,
    ) -> Result<T, OrchestrationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, OrchestrationError>>,
    {
        match self.run_guarded(name, operation, cancel).await {
            Ok(value) => Ok(value),
            Err(failure) if failure.wants_fallback() => {
                let primary = failure.into_error();
                debug!(operation = name, error = %primary, "running fallback");
                self.run_fallback(name, fallback).await
            }
            Err(failure) => Err(failure.into_error()),
        }
    }

    /// Current metrics.
    pub fn metrics(&self) -> RecoveryMetrics {
        *self.metrics.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Force the recovery posture (emergency/offline are policy decisions
    /// made above this layer).
    pub fn set_mode(&self, mode: RecoveryMode) {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if metrics.mode != mode {
            info!(from = ?metrics.mode, to = ?mode, "recovery mode changed");
            metrics.mode = mode;
        }
    }

    /// Snapshot of one breaker, if it exists.
    pub fn breaker_snapshot(&self, name: &str) -> Option<BreakerSnapshot> {
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .map(CircuitBreaker::snapshot)
    }

    fn with_breaker<R>(&self, name: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let breaker = breakers.entry(name.to_owned()).or_insert_with(|| {
            CircuitBreaker::new(
                name,
                self.config.circuit_breaker_threshold,
                Duration::from_millis(self.config.circuit_breaker_reset_time_ms),
            )
        });
        f(breaker)
    }

    /// Attempts allowed for an error of the given kind.
    fn effective_max_attempts(&self, kind: ErrorKind) -> u32 {
        let configured = self.config.max_retry_attempts.max(1);
        if kind == ErrorKind::Unknown {
            configured.min(UNKNOWN_MAX_ATTEMPTS)
        } else {
            configured
        }
    }

    /// Backoff before the attempt after `failed_attempt` (1-based).
    fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let factor = u64::from(self.config.retry_backoff_multiplier).saturating_pow(exponent);
        Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor).min(BACKOFF_CAP_MS))
    }

    async fn run_guarded<T, F, Fut>(
        &self,
        name: &str,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, AttemptFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
    {
        if !self.with_breaker(name, |b| b.try_acquire(Instant::now())) {
            debug!(operation = name, "breaker open, short-circuiting");
            return Err(AttemptFailure::BreakerOpen(
                OrchestrationError::model_unavailable(format!(
                    "circuit breaker '{name}' is open"
                )),
            ));
        }

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match operation().await {
                Ok(value) => {
                    self.with_breaker(name, CircuitBreaker::record_success);
                    self.note_success(attempt);
                    return Ok(value);
                }
                Err(error) => {
                    // The breaker counts one failure per invocation, on the
                    // first failed attempt; later attempts share downstream
                    // state with the first.
                    if attempt == 1 {
                        let tripped =
                            self.with_breaker(name, |b| b.record_failure(Instant::now()));
                        if tripped {
                            let mut metrics = self
                                .metrics
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                            metrics.breaker_trips = metrics.breaker_trips.saturating_add(1);
                        }
                    }
                    {
                        let mut metrics = self
                            .metrics
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        metrics.total_failures = metrics.total_failures.saturating_add(1);
                    }

                    let max_attempts = self.effective_max_attempts(error.kind);
                    if !error.is_retriable() || attempt >= max_attempts {
                        self.note_terminal_failure();
                        warn!(
                            operation = name,
                            attempts = attempt,
                            kind = %error.kind,
                            error = %error.message,
                            "operation failed terminally"
                        );
                        return Err(AttemptFailure::Operation(error));
                    }

                    let delay = self.backoff_delay(attempt);
                    debug!(
                        operation = name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        kind = %error.kind,
                        "retrying after backoff"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(AttemptFailure::Operation(OrchestrationError::unknown(
                                format!("'{name}' cancelled during retry backoff"),
                            )));
                        }
                        () = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_fallback<T, FB, FbFut>(
        &self,
        name: &str,
        fallback: FB,
    ) -> Result<T, OrchestrationError>
    where
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, OrchestrationError>>,
    {
        {
            let mut metrics = self
                .metrics
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            metrics.fallback_executions = metrics.fallback_executions.saturating_add(1);
        }
        let deadline = Duration::from_millis(self.config.fallback_timeout_ms);
        match tokio::time::timeout(deadline, fallback()).await {
            Ok(Ok(value)) => {
                self.note_success(2);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.note_terminal_failure();
                Err(e)
            }
            Err(_) => {
                self.note_terminal_failure();
                Err(OrchestrationError::model_timeout(format!(
                    "fallback for '{name}' exceeded {}ms",
                    self.config.fallback_timeout_ms
                )))
            }
        }
    }

    fn note_success(&self, attempt: u32) {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if attempt > 1 {
            metrics.total_recoveries = metrics.total_recoveries.saturating_add(1);
        }
        metrics.consecutive_failures = 0;
        if metrics.mode == RecoveryMode::Degraded {
            info!("sustained success, returning to normal mode");
            metrics.mode = RecoveryMode::Normal;
        }
    }

    fn note_terminal_failure(&self) {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        metrics.consecutive_failures = metrics.consecutive_failures.saturating_add(1);
        if metrics.mode == RecoveryMode::Normal
            && metrics.consecutive_failures >= self.config.max_consecutive_failures
        {
            warn!(
                consecutive = metrics.consecutive_failures,
                "consecutive failure threshold reached, entering degraded mode"
            );
            metrics.mode = RecoveryMode::Degraded;
        }
    }
}
