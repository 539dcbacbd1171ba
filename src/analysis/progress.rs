//! Per-request progress accounting.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::ProgressSnapshot;
use crate::types::RequestPhase;

/// Mutable progress counters for one request.
///
/// `processed == completed + failed` holds at all times, and `processed`
/// only ever grows.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    request_id: Uuid,
    phase: RequestPhase,
    total: usize,
    completed: usize,
    failed: usize,
    current_file: Option<String>,
    total_execution_ms: u64,
    started_at: DateTime<Utc>,
}

impl ProgressTracker {
    /// Tracker for a freshly accepted request.
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            phase: RequestPhase::Initializing,
            total: 0,
            completed: 0,
            failed: 0,
            current_file: None,
            total_execution_ms: 0,
            started_at: Utc::now(),
        }
    }

    /// Add generated tasks to the total.
    pub fn add_total(&mut self, count: usize) {
        self.total = self.total.saturating_add(count);
    }

    /// Move the request to a new phase.
    pub fn set_phase(&mut self, phase: RequestPhase) {
        self.phase = phase;
    }

    /// Record one completed task.
    pub fn record_completed(&mut self, file_name: Option<String>, execution_ms: u64) {
        self.completed = self.completed.saturating_add(1);
        self.total_execution_ms = self.total_execution_ms.saturating_add(execution_ms);
        self.current_file = file_name;
    }

    /// Record one failed task.
    pub fn record_failed(&mut self, file_name: Option<String>, execution_ms: u64) {
        self.failed = self.failed.saturating_add(1);
        self.total_execution_ms = self.total_execution_ms.saturating_add(execution_ms);
        self.current_file = file_name;
    }

    /// Tasks with a terminal outcome so far.
    pub fn processed(&self) -> usize {
        self.completed.saturating_add(self.failed)
    }

    /// Whether every generated task has a terminal outcome.
    pub fn is_done(&self) -> bool {
        self.total > 0 && self.processed() >= self.total
    }

    /// Current phase.
    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Total generated tasks.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Completed count.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Failed count.
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Sum of per-task execution times, ms.
    pub fn total_execution_ms(&self) -> u64 {
        self.total_execution_ms
    }

    /// Mean per-task execution time, ms. Zero before any outcome.
    pub fn average_execution_ms(&self) -> u64 {
        self.total_execution_ms
            .checked_div(u64::try_from(self.processed()).unwrap_or(0).max(1))
            .unwrap_or(0)
    }

    /// When the request was accepted.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Snapshot for publication. `concurrency` scales the remaining-time
    /// estimate (`ceil(remaining × avg / concurrency)`).
    pub fn snapshot(&self, concurrency: usize) -> ProgressSnapshot {
        let processed = self.processed();
        #[allow(clippy::cast_precision_loss)] // task counts are small
        let error_rate = if processed == 0 {
            0.0
        } else {
            self.failed as f64 / processed as f64
        };

        let remaining = self.total.saturating_sub(processed);
        let eta_seconds = if remaining == 0 || processed == 0 {
            None
        } else {
            let remaining_ms = u64::try_from(remaining)
                .unwrap_or(u64::MAX)
                .saturating_mul(self.average_execution_ms());
            let divisor = u64::try_from(concurrency.max(1))
                .unwrap_or(1)
                .saturating_mul(1_000);
            Some(remaining_ms.div_ceil(divisor))
        };

        ProgressSnapshot {
            request_id: self.request_id,
            phase: self.phase,
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            processed,
            current_file: self.current_file.clone(),
            error_rate,
            eta_seconds,
        }
    }
}
