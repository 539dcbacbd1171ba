//! Agent Manager: priority scheduling with memory-budgeted admission.
//!
//! All queue and slot state lives inside a single scheduler task driven by
//! an `mpsc` command channel; the loop never performs I/O. Executors run
//! as spawned tasks on the worker pool and report back through the same
//! channel, so every mutation is serialized and events are published in
//! completion order.

pub mod executor;
pub mod memory;
pub mod queue;
pub mod slots;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::events::{AgentEvent, EventChannel, SystemHealthSnapshot, TaskReport};
use crate::inference::ModelCatalog;
use crate::types::{OrchestrationError, TaskState};

use self::executor::{ExecutionContext, ExecutionOutput, TaskExecutor};
use self::memory::{effective_slots, p50_memory_mb, MemoryBudget, MemoryProbe, MIB};
use self::queue::ReadyQueue;
use self::slots::SlotTable;
use self::task::{Task, TaskParams};

/// Command channel depth. Submissions beyond this apply backpressure to
/// callers rather than growing unbounded.
const COMMAND_CHANNEL_CAPACITY: usize = 512;

/// Partial configuration update; unset fields keep their current values.
/// Applies to subsequent admissions only — existing slots are never
/// preempted.
#[derive(Debug, Clone, Default)]
pub struct AgentConfigUpdate {
    /// New slot ceiling.
    pub max_concurrent_slots: Option<usize>,
    /// New safety factor.
    pub safety_factor: Option<f64>,
    /// New OS memory reserve, MB.
    pub os_reserved_memory_mb: Option<u64>,
    /// New default task timeout, ms.
    pub task_timeout_ms: Option<u64>,
}

/// Snapshot returned by [`AgentManager::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    /// Tasks currently running.
    pub running: usize,
    /// Slots free for admission.
    pub slots_available: usize,
    /// Effective slot ceiling.
    pub slots_total: usize,
    /// Tasks waiting in the ready-queue.
    pub queued: usize,
    /// Live (queued + running) task counts by kind string.
    pub per_kind: HashMap<String, usize>,
    /// Aggregate health.
    pub health: SystemHealthSnapshot,
    /// Memory reserved by active slots, MB.
    pub memory_in_use_mb: u64,
    /// Current budget, MB.
    pub budget_mb: u64,
}

/// How one executor invocation ended.
#[derive(Debug)]
enum ExecOutcome {
    Completed(ExecutionOutput),
    Failed(OrchestrationError),
    Cancelled,
    TimedOut,
}

enum Command {
    Submit {
        params: TaskParams,
        reply: oneshot::Sender<Result<Uuid, OrchestrationError>>,
    },
    Cancel {
        task_id: Uuid,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<AgentStatus>,
    },
    UpdateConfig {
        update: AgentConfigUpdate,
    },
    RecomputeSlots {
        daemon: Option<(bool, usize)>,
        reply: Option<oneshot::Sender<()>>,
    },
    EmergencyStop {
        reason: String,
    },
    TaskFinished {
        task_id: Uuid,
        outcome: ExecOutcome,
    },
    Shutdown,
}

/// Public handle to the scheduler. Cheap to clone through an `Arc`.
pub struct AgentManager {
    cmd_tx: mpsc::Sender<Command>,
    events: Arc<EventChannel<AgentEvent>>,
    catalog: Option<Arc<ModelCatalog>>,
}

impl AgentManager {
    /// Start the scheduler loop and return its handle.
    ///
    /// `catalog` feeds the recompute path with fresh model footprints;
    /// pass `None` when no daemon is reachable (tests, dry runs).
    pub fn start(
        config: AgentConfig,
        task_executor: Arc<dyn TaskExecutor>,
        probe: Box<dyn MemoryProbe>,
        catalog: Option<Arc<ModelCatalog>>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let events = Arc::new(EventChannel::default());

        let scheduler = Scheduler::new(
            config,
            task_executor,
            probe,
            Arc::clone(&events),
            cmd_tx.clone(),
        );
        tokio::spawn(scheduler.run(cmd_rx));

        Arc::new(Self {
            cmd_tx,
            events,
            catalog,
        })
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Submit a task for scheduling. Returns its identifier.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error for missing required fields or a zero
    /// memory estimate on an inference kind, and an `Unknown` error when
    /// the scheduler has stopped.
    pub async fn submit(&self, params: TaskParams) -> Result<Uuid, OrchestrationError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { params, reply }).await?;
        rx.await
            .map_err(|_| OrchestrationError::unknown("scheduler stopped"))?
    }

    /// Cancel a task. `true` when cancellation was applied or initiated;
    /// `false` for terminal or unknown tasks and repeated requests.
    pub async fn cancel(&self, task_id: Uuid, reason: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .send(Command::Cancel {
                task_id,
                reason: reason.to_owned(),
                reply,
            })
            .await
            .is_ok();
        if !sent {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Current scheduler status.
    ///
    /// # Errors
    ///
    /// Returns an `Unknown` error when the scheduler has stopped.
    pub async fn status(&self) -> Result<AgentStatus, OrchestrationError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await
            .map_err(|_| OrchestrationError::unknown("scheduler stopped"))
    }

    /// Apply a partial configuration update to subsequent admissions.
    pub async fn update_config(&self, update: AgentConfigUpdate) {
        let _ = self.send(Command::UpdateConfig { update }).await;
    }

    /// Refresh model footprints and recompute the budget and slot count.
    pub async fn recompute_slot_capacity(&self) {
        let daemon = match &self.catalog {
            Some(catalog) => match catalog.refresh().await {
                Ok(count) => Some((true, count)),
                Err(e) => {
                    warn!(error = %e, "model refresh failed during recompute");
                    Some((false, 0))
                }
            },
            None => None,
        };
        let (reply, rx) = oneshot::channel();
        if self
            .send(Command::RecomputeSlots {
                daemon,
                reply: Some(reply),
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Drop to zero slots, cancel everything running, drain the queue.
    pub async fn emergency_stop(&self, reason: &str) {
        let _ = self
            .send(Command::EmergencyStop {
                reason: reason.to_owned(),
            })
            .await;
    }

    /// Stop the scheduler loop. In-flight executors are cancelled.
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> Result<(), OrchestrationError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| OrchestrationError::unknown("scheduler stopped"))
    }
}

// ── Scheduler loop ──

struct Scheduler {
    config: AgentConfig,
    task_executor: Arc<dyn TaskExecutor>,
    budget: MemoryBudget,
    events: Arc<EventChannel<AgentEvent>>,
    cmd_tx: mpsc::Sender<Command>,
    tasks: HashMap<Uuid, Task>,
    ready: ReadyQueue,
    slots: SlotTable,
    cancel_tokens: HashMap<Uuid, CancellationToken>,
    budget_mb: u64,
    slots_total: usize,
    next_seq: u64,
    emergency: bool,
    daemon_reachable: bool,
    model_count: usize,
}

impl Scheduler {
    fn new(
        config: AgentConfig,
        task_executor: Arc<dyn TaskExecutor>,
        probe: Box<dyn MemoryProbe>,
        events: Arc<EventChannel<AgentEvent>>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        let budget = MemoryBudget::new(probe, config.safety_factor, config.os_reserved_memory_mb);
        let budget_mb = budget.current_budget_mb();
        let slots_total = effective_slots(
            config.max_concurrent_slots,
            budget_mb,
            config.default_task_memory_mb,
        );
        info!(
            budget_mb,
            slots = slots_total,
            max_slots = config.max_concurrent_slots,
            "scheduler starting"
        );
        Self {
            config,
            task_executor,
            budget,
            events,
            cmd_tx,
            tasks: HashMap::new(),
            ready: ReadyQueue::new(),
            slots: SlotTable::new(),
            cancel_tokens: HashMap::new(),
            budget_mb,
            slots_total,
            next_seq: 0,
            emergency: false,
            daemon_reachable: false,
            model_count: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Submit { params, reply } => {
                    let _ = reply.send(self.handle_submit(params));
                }
                Command::Cancel {
                    task_id,
                    reason,
                    reply,
                } => {
                    let _ = reply.send(self.handle_cancel(task_id, &reason));
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.build_status());
                }
                Command::UpdateConfig { update } => self.handle_update_config(update),
                Command::RecomputeSlots { daemon, reply } => {
                    self.handle_recompute(daemon);
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
                Command::EmergencyStop { reason } => self.handle_emergency_stop(&reason),
                Command::TaskFinished { task_id, outcome } => {
                    self.handle_task_finished(task_id, outcome);
                }
                Command::Shutdown => break,
            }
        }
        // Signal in-flight executors on the way out.
        for token in self.cancel_tokens.values() {
            token.cancel();
        }
        debug!("scheduler loop stopped");
    }

    fn handle_submit(&mut self, params: TaskParams) -> Result<Uuid, OrchestrationError> {
        if params.kind.requires_inference() {
            if params.estimated_memory_mb == 0 {
                return Err(OrchestrationError::validation(
                    "inference task requires a non-zero memory estimate",
                ));
            }
            if params.metadata.model.is_empty() {
                return Err(OrchestrationError::validation(
                    "inference task requires a model",
                ));
            }
            if params.metadata.prompt.is_empty() {
                return Err(OrchestrationError::validation(
                    "inference task requires a prompt",
                ));
            }
        }
        let mut params = params;
        if params.timeout.is_zero() {
            params.timeout = Duration::from_millis(self.config.task_timeout_ms.max(1));
        }

        self.next_seq = self.next_seq.saturating_add(1);
        let task = Task::new(params, self.next_seq);
        let task_id = task.id;
        debug!(
            task_id = %task_id,
            kind = task.kind.as_str(),
            priority = %task.priority,
            memory_mb = task.estimated_memory_mb,
            "task submitted"
        );
        self.ready.push(&task);
        self.tasks.insert(task_id, task);
        self.admit();
        Ok(task_id)
    }

    fn handle_cancel(&mut self, task_id: Uuid, reason: &str) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        match task.state {
            TaskState::Queued => {
                self.ready.remove(task_id);
                task.cancel_reason = Some(reason.to_owned());
                if task.transition(TaskState::Cancelled).is_err() {
                    return false;
                }
                self.events.publish(AgentEvent::TaskCancelled {
                    task_id,
                    reason: reason.to_owned(),
                });
                self.tasks.remove(&task_id);
                true
            }
            TaskState::Running => {
                if task.cancel_reason.is_some() {
                    // Cancellation already in flight.
                    return false;
                }
                task.cancel_reason = Some(reason.to_owned());
                if let Some(token) = self.cancel_tokens.get(&task_id) {
                    token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    fn handle_update_config(&mut self, update: AgentConfigUpdate) {
        if let Some(slots) = update.max_concurrent_slots {
            self.config.max_concurrent_slots = slots.max(1);
        }
        if let Some(factor) = update.safety_factor {
            if factor > 0.0 {
                self.config.safety_factor = factor;
            }
        }
        if let Some(reserved) = update.os_reserved_memory_mb {
            self.config.os_reserved_memory_mb = reserved;
        }
        if let Some(timeout_ms) = update.task_timeout_ms {
            self.config.task_timeout_ms = timeout_ms;
        }
        self.budget
            .set_parameters(self.config.safety_factor, self.config.os_reserved_memory_mb);
        self.emergency = false;
        info!("agent configuration updated");
        self.handle_recompute(None);
    }

    fn handle_recompute(&mut self, daemon: Option<(bool, usize)>) {
        if let Some((reachable, models)) = daemon {
            self.daemon_reachable = reachable;
            self.model_count = models;
        }
        self.emergency = false;
        self.budget_mb = self.budget.current_budget_mb();
        let p50 = p50_memory_mb(
            self.tasks
                .values()
                .filter(|t| !t.state.is_terminal())
                .map(|t| t.estimated_memory_mb)
                .collect(),
        )
        .unwrap_or(self.config.default_task_memory_mb);
        let new_total = effective_slots(self.config.max_concurrent_slots, self.budget_mb, p50);
        if new_total != self.slots_total {
            info!(
                previous = self.slots_total,
                new = new_total,
                budget_mb = self.budget_mb,
                "slot capacity recomputed"
            );
            self.events.publish(AgentEvent::SlotsRecomputed {
                previous_slots: self.slots_total,
                new_slots: new_total,
                budget_bytes: self.budget_mb.saturating_mul(MIB),
            });
            self.slots_total = new_total;
        }
        self.events
            .publish(AgentEvent::SystemHealth(self.health_snapshot()));
        self.admit();
    }

    fn handle_emergency_stop(&mut self, reason: &str) {
        warn!(reason, "emergency stop");
        self.emergency = true;

        // Cancel everything running; slots release as outcomes arrive.
        for task_id in self.slots.task_ids() {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                if task.cancel_reason.is_none() {
                    task.cancel_reason = Some(reason.to_owned());
                }
            }
            if let Some(token) = self.cancel_tokens.get(&task_id) {
                token.cancel();
            }
        }

        // Drain the queue into cancelled.
        for task_id in self.ready.drain() {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.cancel_reason = Some(reason.to_owned());
                if task.transition(TaskState::Cancelled).is_ok() {
                    self.events.publish(AgentEvent::TaskCancelled {
                        task_id,
                        reason: reason.to_owned(),
                    });
                }
                self.tasks.remove(&task_id);
            }
        }

        self.events.publish(AgentEvent::EmergencyStop {
            reason: reason.to_owned(),
        });
    }

    fn handle_task_finished(&mut self, task_id: Uuid, outcome: ExecOutcome) {
        let released = self.slots.release(task_id);
        self.cancel_tokens.remove(&task_id);
        let memory_reserved_mb = released.map_or(0, |s| s.allocated_memory_mb);

        let known = self
            .tasks
            .get(&task_id)
            .map(|task| (task.state, task.timeout));
        let Some((state, timeout)) = known else {
            self.admit();
            return;
        };
        if state != TaskState::Running {
            // A cancel raced the completion; nothing further to record,
            // but the freed slot can admit the next task.
            self.admit();
            return;
        }

        match outcome {
            ExecOutcome::Completed(output) => self.finish_completed(task_id, output, memory_reserved_mb),
            ExecOutcome::Failed(error) => {
                self.finish_with_failure(task_id, TaskState::Failed, error, memory_reserved_mb);
            }
            ExecOutcome::TimedOut => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                let error = OrchestrationError::model_timeout(format!(
                    "task exceeded its {timeout_ms}ms timeout"
                ));
                self.finish_with_failure(task_id, TaskState::TimedOut, error, memory_reserved_mb);
            }
            ExecOutcome::Cancelled => self.finish_cancelled(task_id),
        }
        self.admit();
    }

    fn finish_completed(
        &mut self,
        task_id: Uuid,
        output: ExecutionOutput,
        memory_reserved_mb: u64,
    ) {
        let mut report = None;
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.result = Some(output.response.clone());
            if task.transition(TaskState::Completed).is_ok() {
                report = Some(TaskReport {
                    task_id,
                    kind: task.kind,
                    success: true,
                    result: Some(output.response),
                    error: None,
                    execution_time_ms: output.execution_time_ms,
                    memory_reserved_mb,
                    retrying: false,
                    metadata: task.metadata.clone(),
                });
            }
        }
        if let Some(report) = report {
            self.tasks.remove(&task_id);
            self.events.publish(AgentEvent::TaskCompleted(report));
        }
    }

    fn finish_cancelled(&mut self, task_id: Uuid) {
        let mut event = None;
        if let Some(task) = self.tasks.get_mut(&task_id) {
            let reason = task
                .cancel_reason
                .clone()
                .unwrap_or_else(|| "cancelled".to_owned());
            if task.transition(TaskState::Cancelled).is_ok() {
                event = Some(AgentEvent::TaskCancelled { task_id, reason });
            }
        }
        if let Some(event) = event {
            self.tasks.remove(&task_id);
            self.events.publish(event);
        }
    }

    fn finish_with_failure(
        &mut self,
        task_id: Uuid,
        terminal: TaskState,
        error: OrchestrationError,
        memory_reserved_mb: u64,
    ) {
        let mut report = None;
        let mut requeue = None;
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.error = Some(error.clone());
            if task.transition(terminal).is_ok() {
                let retrying = error.is_retriable() && task.can_retry();
                let execution_time_ms = task
                    .started_at
                    .and_then(|started| {
                        task.completed_at
                            .map(|done| done.signed_duration_since(started))
                    })
                    .and_then(|d| u64::try_from(d.num_milliseconds()).ok())
                    .unwrap_or(0);

                report = Some(TaskReport {
                    task_id,
                    kind: task.kind,
                    success: false,
                    result: None,
                    error: Some(error),
                    execution_time_ms,
                    memory_reserved_mb,
                    retrying,
                    metadata: task.metadata.clone(),
                });

                if retrying && task.requeue_for_retry().is_ok() {
                    debug!(
                        task_id = %task_id,
                        retry = task.retry_count,
                        of = task.max_retries,
                        "re-enqueueing failed task"
                    );
                    requeue = Some(task.clone());
                }
            }
        }

        if let Some(report) = report {
            let retrying = report.retrying;
            self.events.publish(AgentEvent::TaskFailed(report));
            match requeue {
                Some(task) => self.ready.push(&task),
                None if !retrying => {
                    self.tasks.remove(&task_id);
                }
                None => {}
            }
        }
    }

    /// Admission: walk the head of the queue while slots and budget allow.
    ///
    /// A head task that fits the total budget but not the remaining budget
    /// blocks the queue — smaller lower-priority tasks never overtake it.
    fn admit(&mut self) {
        if self.emergency {
            return;
        }
        while self.slots.active_count() < self.slots_total {
            let Some(head_id) = self.ready.peek() else {
                break;
            };
            let Some(head) = self.tasks.get(&head_id) else {
                self.ready.remove(head_id);
                continue;
            };
            let estimate = head.estimated_memory_mb;

            if estimate > self.budget_mb {
                // Can never fit; fail it out rather than blocking forever.
                // The scheduler does not retry resource exhaustion.
                self.ready.remove(head_id);
                let error = OrchestrationError::resource_exhaustion(format!(
                    "task needs {estimate}MB but the total budget is {}MB",
                    self.budget_mb
                ));
                let mut report = None;
                if let Some(task) = self.tasks.get_mut(&head_id) {
                    task.error = Some(error.clone());
                    if task.transition(TaskState::Failed).is_ok() {
                        report = Some(TaskReport {
                            task_id: head_id,
                            kind: task.kind,
                            success: false,
                            result: None,
                            error: Some(error),
                            execution_time_ms: 0,
                            memory_reserved_mb: 0,
                            retrying: false,
                            metadata: task.metadata.clone(),
                        });
                    }
                }
                self.tasks.remove(&head_id);
                if let Some(report) = report {
                    self.events.publish(AgentEvent::TaskFailed(report));
                }
                continue;
            }

            if self.slots.memory_in_use_mb().saturating_add(estimate) > self.budget_mb {
                // Head-of-line blocking is accepted to preserve priority
                // ordering.
                break;
            }

            self.ready.pop();
            self.start_task(head_id);
        }
    }

    fn start_task(&mut self, task_id: Uuid) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.transition(TaskState::Running).is_err() {
            return;
        }
        self.slots.allocate(task_id, task.estimated_memory_mb);

        let cancel = CancellationToken::new();
        self.cancel_tokens.insert(task_id, cancel.clone());

        let ctx = ExecutionContext {
            task_id,
            kind: task.kind,
            metadata: task.metadata.clone(),
            timeout: task.timeout,
            cancel: cancel.clone(),
        };
        let timeout = task.timeout;
        let grace = Duration::from_millis(self.config.cancel_grace_ms);
        let task_executor = Arc::clone(&self.task_executor);
        let cmd_tx = self.cmd_tx.clone();

        debug!(task_id = %task_id, "task admitted to slot");
        tokio::spawn(async move {
            let outcome = run_executor(task_executor, ctx, timeout, grace, cancel).await;
            let _ = cmd_tx
                .send(Command::TaskFinished { task_id, outcome })
                .await;
        });
    }

    fn health_snapshot(&self) -> SystemHealthSnapshot {
        SystemHealthSnapshot {
            daemon_reachable: self.daemon_reachable,
            model_count: self.model_count,
            budget_mb: self.budget_mb,
            memory_in_use_mb: self.slots.memory_in_use_mb(),
            running: self.slots.active_count(),
            queued: self.ready.len(),
        }
    }

    fn build_status(&self) -> AgentStatus {
        let mut per_kind: HashMap<String, usize> = HashMap::new();
        for task in self.tasks.values() {
            if !task.state.is_terminal() {
                let count = per_kind.entry(task.kind.as_str().to_owned()).or_insert(0);
                *count = count.saturating_add(1);
            }
        }
        AgentStatus {
            running: self.slots.active_count(),
            slots_available: self.slots_total.saturating_sub(self.slots.active_count()),
            slots_total: self.slots_total,
            queued: self.ready.len(),
            per_kind,
            health: self.health_snapshot(),
            memory_in_use_mb: self.slots.memory_in_use_mb(),
            budget_mb: self.budget_mb,
        }
    }
}

/// Drive one executor invocation: enforce the deadline, signal cooperative
/// cancellation, and grant the grace period before giving up on an
/// acknowledgement. The slot is released when the outcome is processed,
/// regardless of how the executor behaved.
async fn run_executor(
    task_executor: Arc<dyn TaskExecutor>,
    ctx: ExecutionContext,
    timeout: Duration,
    grace: Duration,
    cancel: CancellationToken,
) -> ExecOutcome {
    let exec_fut = async move { task_executor.execute(&ctx).await };
    tokio::pin!(exec_fut);

    tokio::select! {
        result = &mut exec_fut => match result {
            Ok(output) => ExecOutcome::Completed(output),
            Err(_) if cancel.is_cancelled() => ExecOutcome::Cancelled,
            Err(error) => ExecOutcome::Failed(error),
        },
        () = tokio::time::sleep(timeout) => {
            cancel.cancel();
            // Cooperative ack window; the deadline has already passed, so
            // the outcome is timed-out either way.
            let _ = tokio::time::timeout(grace, &mut exec_fut).await;
            ExecOutcome::TimedOut
        }
        () = cancel.cancelled() => {
            let _ = tokio::time::timeout(grace, &mut exec_fut).await;
            ExecOutcome::Cancelled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::memory::FixedProbe;
    use crate::events::TaskMetadata;
    use crate::inference::GIB;
    use crate::types::{ErrorKind, TaskKind, TaskPriority};
    use async_trait::async_trait;

    struct InstantExecutor;

    #[async_trait]
    impl TaskExecutor for InstantExecutor {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
        ) -> Result<ExecutionOutput, OrchestrationError> {
            Ok(ExecutionOutput {
                response: r#"{"candidates":[]}"#.to_owned(),
                execution_time_ms: 5,
            })
        }
    }

    fn agent_config() -> AgentConfig {
        AgentConfig {
            max_concurrent_slots: 4,
            safety_factor: 1.0,
            os_reserved_memory_mb: 0,
            task_timeout_ms: 5_000,
            cancel_grace_ms: 100,
            default_task_memory_mb: 1024,
        }
    }

    fn params(memory_mb: u64) -> TaskParams {
        TaskParams {
            kind: TaskKind::FileAnalysis,
            priority: TaskPriority::Normal,
            timeout: Duration::from_secs(5),
            max_retries: 0,
            estimated_memory_mb: memory_mb,
            metadata: TaskMetadata {
                file_id: Some(1),
                model: "llama3.1:8b".to_owned(),
                prompt: "p".to_owned(),
                analysis_kind: None,
                request_id: None,
            },
        }
    }

    fn manager_with(probe_gib: u64) -> Arc<AgentManager> {
        AgentManager::start(
            agent_config(),
            Arc::new(InstantExecutor),
            Box::new(FixedProbe::new(probe_gib * GIB)),
            None,
        )
    }

    #[tokio::test]
    async fn test_submit_rejects_zero_memory_estimate() {
        let manager = manager_with(16);
        let error = manager.submit(params(0)).await.expect_err("validation");
        assert_eq!(error.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_prompt() {
        let manager = manager_with(16);
        let mut bad = params(1024);
        bad.metadata.prompt = String::new();
        let error = manager.submit(bad).await.expect_err("validation");
        assert_eq!(error.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_task_completes_and_emits_event() {
        let manager = manager_with(16);
        let mut events = manager.subscribe();
        let task_id = manager.submit(params(1024)).await.expect("submit");

        let event = events.recv().await.expect("event");
        match event {
            AgentEvent::TaskCompleted(report) => {
                assert_eq!(report.task_id, task_id);
                assert!(report.success);
                assert!(report.result.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_false() {
        let manager = manager_with(16);
        assert!(!manager.cancel(Uuid::new_v4(), "nope").await);
    }

    #[tokio::test]
    async fn test_status_reports_budget_and_slots() {
        let manager = manager_with(8);
        let status = manager.status().await.expect("status");
        // 8 GiB × 1.0 − 0 reserved = 8192 MB; p50 default 1024 → 4 slots cap.
        assert_eq!(status.budget_mb, 8192);
        assert_eq!(status.slots_total, 4);
        assert_eq!(status.running, 0);
        assert_eq!(status.queued, 0);
    }

    #[tokio::test]
    async fn test_update_config_shrinks_slots() {
        let manager = manager_with(8);
        manager
            .update_config(AgentConfigUpdate {
                max_concurrent_slots: Some(1),
                ..AgentConfigUpdate::default()
            })
            .await;
        let status = manager.status().await.expect("status");
        assert_eq!(status.slots_total, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_scheduler() {
        let manager = manager_with(8);
        manager.shutdown().await;
        // Give the loop a moment to exit, then observe the closed channel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let error = manager.submit(params(1024)).await.expect_err("stopped");
        assert_eq!(error.kind, ErrorKind::Unknown);
    }
}
