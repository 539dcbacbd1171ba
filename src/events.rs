//! Events published by the orchestration core.
//!
//! Components are wired explicitly: each publisher owns an [`EventChannel`]
//! and consumers call `subscribe()` for a typed receiver. There are no
//! process-wide emitter singletons. Publishing never blocks the publisher;
//! slow consumers observe `Lagged` on their own receiver instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{AnalysisKind, OrchestrationError, Suggestion, TaskKind};

/// Default broadcast buffer depth for core event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Typed broadcast channel with a subscription interface.
#[derive(Debug)]
pub struct EventChannel<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventChannel<T> {
    /// Create a channel with the given buffer depth.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Obtain a new receiver. Events published before the call are not seen.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publish an event. A send with no live receivers is not an error.
    pub fn publish(&self, event: T) {
        let _ = self.tx.send(event);
    }

    /// Number of live receivers, for health reporting.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

// ── Agent Manager events ──

/// Correlation metadata carried by a task from creation to its terminal
/// event. Opaque to the scheduler; the Analysis Service uses `request_id`
/// to route results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// File the task analyses, if any.
    pub file_id: Option<i64>,
    /// Model name the executor should run.
    pub model: String,
    /// Fully rendered prompt.
    pub prompt: String,
    /// Analysis kind the prompt implements, if any.
    pub analysis_kind: Option<AnalysisKind>,
    /// Request this task belongs to, if any.
    pub request_id: Option<Uuid>,
}

/// Terminal report for one task, carried on `task-completed` and
/// `task-failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Task identifier.
    pub task_id: Uuid,
    /// Task kind.
    pub kind: TaskKind,
    /// Whether the executor succeeded.
    pub success: bool,
    /// Raw model response on success.
    pub result: Option<String>,
    /// Failure classification and detail on failure.
    pub error: Option<OrchestrationError>,
    /// Executor wall-clock time.
    pub execution_time_ms: u64,
    /// Memory that was reserved for the slot, in MB.
    pub memory_reserved_mb: u64,
    /// Whether the scheduler is re-enqueueing the task for another
    /// attempt. Consumers tracking terminal outcomes should skip reports
    /// with this set.
    pub retrying: bool,
    /// Correlation metadata.
    pub metadata: TaskMetadata,
}

/// Aggregate health published with `system-health` and returned from
/// `AgentManager::status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemHealthSnapshot {
    /// Whether the inference daemon answered its last probe.
    pub daemon_reachable: bool,
    /// Models known to the daemon.
    pub model_count: usize,
    /// Current memory budget, MB.
    pub budget_mb: u64,
    /// Memory reserved by active slots, MB.
    pub memory_in_use_mb: u64,
    /// Tasks currently running.
    pub running: usize,
    /// Tasks waiting in the ready-queue.
    pub queued: usize,
}

/// Events published by the Agent Manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentEvent {
    /// A task finished with a result.
    TaskCompleted(TaskReport),
    /// A task finished with an error or timeout.
    TaskFailed(TaskReport),
    /// A task was cancelled before completing.
    TaskCancelled {
        /// Task identifier.
        task_id: Uuid,
        /// Caller-supplied reason.
        reason: String,
    },
    /// The memory budget and effective slot count were recomputed.
    SlotsRecomputed {
        /// Effective slots before the recompute.
        previous_slots: usize,
        /// Effective slots after the recompute.
        new_slots: usize,
        /// New budget in bytes.
        budget_bytes: u64,
    },
    /// Periodic aggregate health.
    SystemHealth(SystemHealthSnapshot),
    /// The scheduler dropped to zero slots and drained its queue.
    EmergencyStop {
        /// Caller-supplied reason.
        reason: String,
    },
}

// ── Analysis Service events ──

/// Point-in-time progress counters for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Request identifier.
    pub request_id: Uuid,
    /// Current phase.
    pub phase: crate::types::RequestPhase,
    /// Total tasks generated for the request.
    pub total: usize,
    /// Tasks completed successfully.
    pub completed: usize,
    /// Tasks failed.
    pub failed: usize,
    /// `completed + failed`.
    pub processed: usize,
    /// File currently being analysed, if known.
    pub current_file: Option<String>,
    /// Failed / processed, in [0, 1].
    pub error_rate: f64,
    /// Estimated seconds until the request finishes, if computable.
    pub eta_seconds: Option<u64>,
}

/// Final outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    /// Request identifier.
    pub request_id: Uuid,
    /// Total tasks the request generated.
    pub total: usize,
    /// Tasks completed successfully.
    pub successful: usize,
    /// Tasks failed.
    pub failed: usize,
    /// Sum of per-task execution times.
    pub total_execution_time_ms: u64,
    /// Mean per-task execution time.
    pub average_execution_time_ms: u64,
    /// When the request finished.
    pub finished_at: DateTime<Utc>,
    /// First few error messages, most recent last.
    pub errors: Vec<String>,
}

/// Events published by the Analysis Service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnalysisEvent {
    /// A request was accepted and its tasks are being generated.
    Started {
        /// Request identifier.
        request_id: Uuid,
        /// Files the request covers.
        total_files: usize,
    },
    /// Periodic progress counters for an active request.
    ProgressUpdate(ProgressSnapshot),
    /// One file finished; carries its scored suggestions.
    PreviewUpdate {
        /// Request identifier.
        request_id: Uuid,
        /// File the result belongs to.
        file_id: Option<i64>,
        /// Analysis kind of the finished task.
        kind: Option<AnalysisKind>,
        /// Ranked suggestions, empty on failure.
        suggestions: Vec<Suggestion>,
        /// Progress after recording this result.
        progress: ProgressSnapshot,
    },
    /// The request finished; all tasks terminal.
    Complete(SessionResult),
    /// The request was cancelled.
    Cancelled {
        /// Request identifier.
        request_id: Uuid,
        /// Caller-supplied reason.
        reason: String,
    },
    /// The request failed as a whole.
    Error {
        /// Request identifier.
        request_id: Uuid,
        /// Failure detail.
        error: OrchestrationError,
    },
    /// The service entered emergency mode; new requests are rejected.
    EmergencyMode {
        /// What tripped the threshold.
        reason: String,
    },
    /// The cool-down elapsed; the service accepts work again.
    EmergencyModeExit,
}
