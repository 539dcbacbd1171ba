//! Task records owned by the scheduler.

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::events::TaskMetadata;
use crate::types::{OrchestrationError, TaskKind, TaskPriority, TaskState};

/// Parameters for submitting a task.
#[derive(Debug, Clone)]
pub struct TaskParams {
    /// What the task does.
    pub kind: TaskKind,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Deadline for the executor.
    pub timeout: Duration,
    /// Scheduler-level retries granted on retriable failure.
    pub max_retries: u32,
    /// Estimated memory the task needs while running, in MB.
    pub estimated_memory_mb: u64,
    /// Correlation metadata (file, model, prompt, request).
    pub metadata: TaskMetadata,
}

/// One unit of work owned by the Agent Manager.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stable identifier.
    pub id: Uuid,
    /// What the task does.
    pub kind: TaskKind,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Lifecycle state.
    pub state: TaskState,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the task was admitted to a slot.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Executor deadline.
    pub timeout: Duration,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retries granted.
    pub max_retries: u32,
    /// Estimated memory while running, in MB.
    pub estimated_memory_mb: u64,
    /// Correlation metadata.
    pub metadata: TaskMetadata,
    /// Admission sequence; ties on priority break by this, ascending.
    pub seq: u64,
    /// Raw executor result, set on completion.
    pub result: Option<String>,
    /// Failure detail, set on failure or timeout.
    pub error: Option<OrchestrationError>,
    /// Reason supplied with a cancellation request, if any.
    pub cancel_reason: Option<String>,
}

impl Task {
    /// Create a queued task from submission parameters.
    pub fn new(params: TaskParams, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: params.kind,
            priority: params.priority,
            state: TaskState::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout: params.timeout,
            retry_count: 0,
            max_retries: params.max_retries,
            estimated_memory_mb: params.estimated_memory_mb,
            metadata: params.metadata,
            seq,
            result: None,
            error: None,
            cancel_reason: None,
        }
    }

    /// Apply a lifecycle transition, enforcing the state machine.
    ///
    /// Valid edges: `Queued → {Running, Cancelled, Failed}` (the `Failed`
    /// edge covers tasks whose memory alone exceeds the total budget) and
    /// `Running → {Completed, Failed, Cancelled, TimedOut}`. Terminal
    /// states accept nothing (re-enqueue for retry goes through
    /// [`Task::requeue_for_retry`] instead).
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error for an illegal edge.
    pub fn transition(&mut self, next: TaskState) -> Result<(), OrchestrationError> {
        let legal = match self.state {
            TaskState::Queued => matches!(
                next,
                TaskState::Running | TaskState::Cancelled | TaskState::Failed
            ),
            TaskState::Running => next.is_terminal(),
            _ => false,
        };
        if !legal {
            return Err(OrchestrationError::validation(format!(
                "illegal task transition {} -> {}",
                self.state.as_str(),
                next.as_str()
            )));
        }
        match next {
            TaskState::Running => self.started_at = Some(Utc::now()),
            state if state.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Whether a failed or timed-out task has retry budget left.
    pub fn can_retry(&self) -> bool {
        matches!(self.state, TaskState::Failed | TaskState::TimedOut)
            && self.retry_count < self.max_retries
    }

    /// Reset a failed or timed-out task back to `Queued`, consuming one
    /// retry. Keeps the identifier and admission sequence so ordering
    /// among equal priorities stays stable.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error when no retry budget remains or the
    /// task is not in a retriable terminal state.
    pub fn requeue_for_retry(&mut self) -> Result<(), OrchestrationError> {
        if !self.can_retry() {
            return Err(OrchestrationError::validation(format!(
                "task {} has no retry budget in state {}",
                self.id,
                self.state.as_str()
            )));
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.state = TaskState::Queued;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        self.error = None;
        Ok(())
    }
}
