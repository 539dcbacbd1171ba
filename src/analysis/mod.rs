//! Analysis Service: per-request pipeline coordination.
//!
//! Owns active requests and their progress. A single consumer task holds
//! all per-request state: it drains service commands, the Agent Manager's
//! event stream, and a progress tick from one `select!` loop, so result
//! handling is serialized and `preview-update` emission follows completion
//! order within a request.

pub mod progress;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::AgentManager;
use crate::config::{AnalysisConfig, AnalysisModelsConfig};
use crate::events::{
    AgentEvent, AnalysisEvent, EventChannel, ProgressSnapshot, SessionResult, TaskReport,
};
use crate::generator::{GenerateSpec, TaskGenerator};
use crate::recovery::{ErrorRecoveryManager, RecoveryMode};
use crate::scoring::{ConfidenceScorer, ScoreContext};
use crate::store::{AnalysisSession, FileRecord, ModelPreferences, Store};
use crate::types::{
    AnalysisKind, OrchestrationError, RequestPhase, Suggestion, TaskPriority,
};

/// Service command channel depth.
const SERVICE_CHANNEL_CAPACITY: usize = 64;

/// Cap on error messages carried in a session result.
const MAX_SESSION_ERRORS: usize = 10;

/// A user-facing analysis request.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    /// Identifier; generated when absent. Must not collide with an active
    /// request.
    pub request_id: Option<Uuid>,
    /// Explicit file set.
    pub file_ids: Option<Vec<i64>>,
    /// Root path to enumerate when no explicit set is given.
    pub root_path: Option<String>,
    /// One or more analysis kinds.
    pub kinds: Vec<AnalysisKind>,
    /// Interactive requests get `high` priority tasks.
    pub interactive: bool,
    /// Explicit priority, overriding the interactivity rule.
    pub priority: Option<TaskPriority>,
    /// Model override winning over the routing table.
    pub model_override: Option<String>,
}

struct RequestState {
    tracker: progress::ProgressTracker,
    files: HashMap<i64, FileRecord>,
    task_ids: Vec<Uuid>,
    errors: Vec<String>,
}

enum ServiceCommand {
    Start {
        request: AnalysisRequest,
        reply: oneshot::Sender<Result<Uuid, OrchestrationError>>,
    },
    CancelRequest {
        request_id: Uuid,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    GetProgress {
        request_id: Uuid,
        reply: oneshot::Sender<Option<ProgressSnapshot>>,
    },
    InEmergency {
        reply: oneshot::Sender<bool>,
    },
    SetRouting {
        kind: AnalysisKind,
        model: String,
    },
    ExitEmergency {
        epoch: u64,
    },
    Shutdown,
}

/// Public handle to the Analysis Service.
pub struct AnalysisService {
    cmd_tx: mpsc::Sender<ServiceCommand>,
    events: Arc<EventChannel<AnalysisEvent>>,
    store: Arc<dyn Store>,
}

impl AnalysisService {
    /// Start the service loop, seeding model routing from persisted
    /// preferences.
    pub async fn start(
        config: AnalysisConfig,
        store: Arc<dyn Store>,
        generator: Arc<TaskGenerator>,
        agent: Arc<AgentManager>,
        recovery: Arc<ErrorRecoveryManager>,
        default_model: String,
        concurrency_hint: usize,
    ) -> Arc<Self> {
        let prefs = match store.model_preferences().await {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!(error = %e, "model preferences unavailable, using defaults");
                ModelPreferences::default()
            }
        };
        let routing = build_routing(&config.models, &prefs, &default_model);
        info!(?routing, "analysis model routing seeded");

        let (cmd_tx, cmd_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let events = Arc::new(EventChannel::default());
        let agent_rx = agent.subscribe();

        let service_loop = ServiceLoop {
            config,
            store: Arc::clone(&store),
            generator,
            agent,
            recovery,
            scorer: ConfidenceScorer::default(),
            events: Arc::clone(&events),
            cmd_tx: cmd_tx.clone(),
            active: HashMap::new(),
            task_index: HashMap::new(),
            routing,
            consecutive_errors: 0,
            emergency: false,
            emergency_epoch: 0,
            concurrency_hint: concurrency_hint.max(1),
        };
        tokio::spawn(service_loop.run(cmd_rx, agent_rx));

        Arc::new(Self {
            cmd_tx,
            events,
            store,
        })
    }

    /// Subscribe to analysis events.
    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.events.subscribe()
    }

    /// Validate and accept a request; returns its identifier.
    ///
    /// # Errors
    ///
    /// Returns `ai-model-unavailable` while in emergency mode and
    /// `validation` for malformed or duplicate requests.
    pub async fn start_analysis(
        &self,
        request: AnalysisRequest,
    ) -> Result<Uuid, OrchestrationError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceCommand::Start { request, reply }).await?;
        rx.await
            .map_err(|_| OrchestrationError::unknown("analysis service stopped"))?
    }

    /// Cancel an active request. `false` for unknown or finished requests.
    pub async fn cancel_analysis(&self, request_id: Uuid, reason: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .send(ServiceCommand::CancelRequest {
                request_id,
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

    /// Progress counters for an active request.
    pub async fn progress(&self, request_id: Uuid) -> Option<ProgressSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceCommand::GetProgress { request_id, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Persisted suggestions for a request (available during and after the
    /// run; finalization discards only in-memory state).
    ///
    /// # Errors
    ///
    /// Returns an `IoError` when the store read fails.
    pub async fn results(&self, request_id: Uuid) -> Result<Vec<Suggestion>, OrchestrationError> {
        Ok(self.store.suggestions_for_request(request_id).await?)
    }

    /// Whether the service is currently rejecting work.
    pub async fn in_emergency(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.send(ServiceCommand::InEmergency { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Update the routing table for one analysis kind.
    pub async fn set_model_routing(&self, kind: AnalysisKind, model: &str) {
        let _ = self
            .send(ServiceCommand::SetRouting {
                kind,
                model: model.to_owned(),
            })
            .await;
    }

    /// Stop the service loop.
    pub async fn shutdown(&self) {
        let _ = self.send(ServiceCommand::Shutdown).await;
    }

    async fn send(&self, command: ServiceCommand) -> Result<(), OrchestrationError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| OrchestrationError::unknown("analysis service stopped"))
    }
}

fn build_routing(
    models: &AnalysisModelsConfig,
    prefs: &ModelPreferences,
    default_model: &str,
) -> HashMap<AnalysisKind, String> {
    let main = prefs
        .main_model
        .clone()
        .unwrap_or_else(|| default_model.to_owned());
    let sub = prefs.sub_model.clone().unwrap_or_else(|| main.clone());
    HashMap::from([
        (
            AnalysisKind::RenameSuggestions,
            models.rename.clone().unwrap_or_else(|| main.clone()),
        ),
        (
            AnalysisKind::Classification,
            models.classification.clone().unwrap_or_else(|| main.clone()),
        ),
        (
            AnalysisKind::ContentSummary,
            models.summary.clone().unwrap_or_else(|| sub.clone()),
        ),
        (
            AnalysisKind::MetadataExtraction,
            models.metadata.clone().unwrap_or(sub),
        ),
    ])
}

// ── Service loop ──

struct ServiceLoop {
    config: AnalysisConfig,
    store: Arc<dyn Store>,
    generator: Arc<TaskGenerator>,
    agent: Arc<AgentManager>,
    recovery: Arc<ErrorRecoveryManager>,
    scorer: ConfidenceScorer,
    events: Arc<EventChannel<AnalysisEvent>>,
    cmd_tx: mpsc::Sender<ServiceCommand>,
    active: HashMap<Uuid, RequestState>,
    task_index: HashMap<Uuid, Uuid>,
    routing: HashMap<AnalysisKind, String>,
    consecutive_errors: u32,
    emergency: bool,
    emergency_epoch: u64,
    concurrency_hint: usize,
}

impl ServiceLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ServiceCommand>,
        agent_rx: broadcast::Receiver<AgentEvent>,
    ) {
        let mut agent_events = BroadcastStream::new(agent_rx);
        let mut agent_alive = true;
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.config.progress_update_interval_ms.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_command = cmd_rx.recv() => match maybe_command {
                    None | Some(ServiceCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                maybe_event = agent_events.next(), if agent_alive => match maybe_event {
                    Some(Ok(event)) => self.handle_agent_event(event).await,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "analysis consumer lagged behind scheduler events");
                    }
                    None => {
                        warn!("scheduler event channel closed");
                        agent_alive = false;
                    }
                },
                _ = ticker.tick() => self.publish_progress(),
            }
        }
        debug!("analysis service loop stopped");
    }

    async fn handle_command(&mut self, command: ServiceCommand) {
        match command {
            ServiceCommand::Start { request, reply } => {
                let _ = reply.send(self.handle_start(request).await);
            }
            ServiceCommand::CancelRequest {
                request_id,
                reason,
                reply,
            } => {
                let cancelled = self
                    .cancel_request(request_id, &reason, RequestPhase::Cancelled)
                    .await;
                let _ = reply.send(cancelled);
            }
            ServiceCommand::GetProgress { request_id, reply } => {
                let snapshot = self
                    .active
                    .get(&request_id)
                    .map(|s| s.tracker.snapshot(self.concurrency_hint));
                let _ = reply.send(snapshot);
            }
            ServiceCommand::InEmergency { reply } => {
                let _ = reply.send(self.emergency);
            }
            ServiceCommand::SetRouting { kind, model } => {
                info!(kind = %kind, model, "model routing updated");
                self.routing.insert(kind, model);
            }
            ServiceCommand::ExitEmergency { epoch } => self.exit_emergency(epoch),
            ServiceCommand::Shutdown => {}
        }
    }

    async fn handle_start(
        &mut self,
        request: AnalysisRequest,
    ) -> Result<Uuid, OrchestrationError> {
        if self.emergency {
            return Err(OrchestrationError::model_unavailable(
                "analysis service is in emergency mode",
            ));
        }
        let request_id = request.request_id.unwrap_or_else(Uuid::new_v4);
        if self.active.contains_key(&request_id) {
            return Err(OrchestrationError::validation(format!(
                "request {request_id} is already active"
            )));
        }
        if self.active.len() >= self.config.max_concurrent_analysis {
            return Err(OrchestrationError::validation(format!(
                "at most {} concurrent analyses",
                self.config.max_concurrent_analysis
            )));
        }
        if request.kinds.is_empty() {
            return Err(OrchestrationError::validation(
                "at least one analysis kind is required",
            ));
        }

        let files = self.resolve_files(&request).await?;
        if files.is_empty() {
            return Err(OrchestrationError::validation(
                "no files found to analyse",
            ));
        }

        let mut state = RequestState {
            tracker: progress::ProgressTracker::new(request_id),
            files: files.iter().map(|f| (f.id, f.clone())).collect(),
            task_ids: Vec::new(),
            errors: Vec::new(),
        };
        let session = AnalysisSession {
            request_id,
            phase: RequestPhase::Initializing,
            total: 0,
            successful: 0,
            failed: 0,
            started_at: state.tracker.started_at(),
            finished_at: None,
        };
        if let Err(e) = self.store.create_analysis_session(&session).await {
            warn!(request_id = %request_id, error = %e, "session row creation failed");
        }

        info!(
            request_id = %request_id,
            files = files.len(),
            kinds = request.kinds.len(),
            "analysis started"
        );
        self.events.publish(AnalysisEvent::Started {
            request_id,
            total_files: files.len(),
        });

        let priority = request.priority.unwrap_or(if request.interactive {
            TaskPriority::High
        } else {
            TaskPriority::Normal
        });
        let file_ids: Vec<i64> = files.iter().map(|f| f.id).collect();

        // Large requests go to the generator in bounded chunks so each
        // call's batch pause stays short.
        let chunk_size = self.config.batch_processing_size.max(1);
        for kind in &request.kinds {
            let model = self.model_for(*kind, request.model_override.as_deref());
            for chunk in file_ids.chunks(chunk_size) {
                let spec = GenerateSpec {
                    request_id,
                    file_ids: Some(chunk.to_vec()),
                    root_path: None,
                    kind: *kind,
                    model: model.clone(),
                    priority,
                    max_retries: self.config.retry_attempts,
                };
                match self.generator.generate(&spec).await {
                    Ok(result) => {
                        for task_id in &result.task_ids {
                            self.task_index.insert(*task_id, request_id);
                        }
                        state.task_ids.extend(result.task_ids);
                        state.tracker.add_total(result.created);
                    }
                    Err(e) => {
                        warn!(request_id = %request_id, kind = %kind, error = %e, "generation failed");
                        state.errors.push(e.to_string());
                    }
                }
            }
        }

        if state.tracker.total() == 0 {
            let error =
                OrchestrationError::validation("no tasks could be generated for the request");
            self.events.publish(AnalysisEvent::Error {
                request_id,
                error: error.clone(),
            });
            self.update_session(request_id, &state.tracker, RequestPhase::Error, true)
                .await;
            return Err(error);
        }

        state.tracker.set_phase(RequestPhase::Analyzing);
        self.update_session(request_id, &state.tracker, RequestPhase::Analyzing, false)
            .await;
        self.active.insert(request_id, state);
        Ok(request_id)
    }

    async fn resolve_files(
        &self,
        request: &AnalysisRequest,
    ) -> Result<Vec<FileRecord>, OrchestrationError> {
        match (&request.file_ids, &request.root_path) {
            (Some(ids), _) if !ids.is_empty() => Ok(self.store.files_by_ids(ids).await?),
            (_, Some(root)) if !root.is_empty() => {
                Ok(self.store.files_by_root_path(root).await?)
            }
            _ => Err(OrchestrationError::validation(
                "a file set or a root path is required",
            )),
        }
    }

    fn model_for(&self, kind: AnalysisKind, override_model: Option<&str>) -> String {
        if let Some(model) = override_model {
            return model.to_owned();
        }
        self.routing
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| "llama3.1:8b".to_owned())
    }

    async fn handle_agent_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::TaskCompleted(report) => self.on_task_completed(report).await,
            AgentEvent::TaskFailed(report) => self.on_task_failed(report).await,
            AgentEvent::TaskCancelled { task_id, .. } => {
                self.task_index.remove(&task_id);
            }
            AgentEvent::SlotsRecomputed { .. }
            | AgentEvent::SystemHealth(_)
            | AgentEvent::EmergencyStop { .. } => {}
        }
    }

    async fn on_task_completed(&mut self, report: TaskReport) {
        let Some(request_id) = self.task_index.remove(&report.task_id) else {
            return;
        };
        let Some(state) = self.active.get_mut(&request_id) else {
            return;
        };

        let file = report.metadata.file_id.and_then(|id| state.files.get(&id));
        let file_name = file.map(|f| f.name.clone());
        let kind = report
            .metadata
            .analysis_kind
            .unwrap_or(AnalysisKind::ContentSummary);
        let ctx = ScoreContext {
            file_id: report.metadata.file_id.unwrap_or(0),
            file_name: file_name.clone().unwrap_or_default(),
            file_extension: file.map(|f| f.extension.clone()).unwrap_or_default(),
            request_id,
            kind,
            model: report.metadata.model.clone(),
            execution_time_ms: report.execution_time_ms,
        };
        let response = report.result.as_deref().unwrap_or_default();
        let suggestions = self.scorer.score(&ctx, response);

        if !suggestions.is_empty() {
            if let Err(e) = self.store.save_suggestions(&suggestions).await {
                warn!(request_id = %request_id, error = %e, "suggestion persistence failed");
            }
        }

        state
            .tracker
            .record_completed(file_name, report.execution_time_ms);
        self.consecutive_errors = 0;

        let snapshot = state.tracker.snapshot(self.concurrency_hint);
        self.events.publish(AnalysisEvent::PreviewUpdate {
            request_id,
            file_id: report.metadata.file_id,
            kind: report.metadata.analysis_kind,
            suggestions,
            progress: snapshot,
        });

        if self
            .active
            .get(&request_id)
            .is_some_and(|s| s.tracker.is_done())
        {
            self.finalize(request_id).await;
        }
    }

    async fn on_task_failed(&mut self, report: TaskReport) {
        if report.retrying {
            // Interim failure; the scheduler re-enqueued the task.
            return;
        }
        let Some(request_id) = self.task_index.remove(&report.task_id) else {
            return;
        };
        let Some(state) = self.active.get_mut(&request_id) else {
            return;
        };

        let file_name = report
            .metadata
            .file_id
            .and_then(|id| state.files.get(&id))
            .map(|f| f.name.clone());
        let message = report
            .error
            .as_ref()
            .map_or_else(|| "task failed".to_owned(), ToString::to_string);
        state.errors.push(message);
        state
            .tracker
            .record_failed(file_name, report.execution_time_ms);

        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.consecutive_errors >= self.config.error_threshold && !self.emergency {
            self.enter_emergency("consecutive task failures crossed the error threshold")
                .await;
            return;
        }

        if self
            .active
            .get(&request_id)
            .is_some_and(|s| s.tracker.is_done())
        {
            self.finalize(request_id).await;
        }
    }

    async fn finalize(&mut self, request_id: Uuid) {
        let Some(state) = self.active.remove(&request_id) else {
            return;
        };
        for task_id in &state.task_ids {
            self.task_index.remove(task_id);
        }
        let tracker = state.tracker;
        let result = SessionResult {
            request_id,
            total: tracker.total(),
            successful: tracker.completed(),
            failed: tracker.failed(),
            total_execution_time_ms: tracker.total_execution_ms(),
            average_execution_time_ms: tracker.average_execution_ms(),
            finished_at: chrono::Utc::now(),
            errors: state
                .errors
                .iter()
                .take(MAX_SESSION_ERRORS)
                .cloned()
                .collect(),
        };
        info!(
            request_id = %request_id,
            successful = result.successful,
            failed = result.failed,
            "analysis complete"
        );
        self.update_session(request_id, &tracker, RequestPhase::Complete, true)
            .await;
        self.events.publish(AnalysisEvent::Complete(result));
    }

    async fn cancel_request(
        &mut self,
        request_id: Uuid,
        reason: &str,
        terminal: RequestPhase,
    ) -> bool {
        let Some(mut state) = self.active.remove(&request_id) else {
            return false;
        };
        for task_id in &state.task_ids {
            self.task_index.remove(task_id);
            let _ = self.agent.cancel(*task_id, reason).await;
        }
        state.tracker.set_phase(terminal);
        self.update_session(request_id, &state.tracker, terminal, true)
            .await;
        match terminal {
            RequestPhase::Error => self.events.publish(AnalysisEvent::Error {
                request_id,
                error: OrchestrationError::model_unavailable(reason),
            }),
            _ => self.events.publish(AnalysisEvent::Cancelled {
                request_id,
                reason: reason.to_owned(),
            }),
        }
        true
    }

    async fn enter_emergency(&mut self, reason: &str) {
        warn!(reason, "entering emergency mode");
        self.emergency = true;
        self.emergency_epoch = self.emergency_epoch.saturating_add(1);
        self.recovery.set_mode(RecoveryMode::Emergency);
        self.events.publish(AnalysisEvent::EmergencyMode {
            reason: reason.to_owned(),
        });

        let request_ids: Vec<Uuid> = self.active.keys().copied().collect();
        for request_id in request_ids {
            self.cancel_request(request_id, "emergency mode", RequestPhase::Error)
                .await;
        }

        let epoch = self.emergency_epoch;
        let cooldown = Duration::from_millis(self.config.emergency_cooldown_ms);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let _ = cmd_tx.send(ServiceCommand::ExitEmergency { epoch }).await;
        });
    }

    fn exit_emergency(&mut self, epoch: u64) {
        if !self.emergency || epoch != self.emergency_epoch {
            // A newer emergency superseded this timer.
            return;
        }
        info!("emergency cool-down elapsed, accepting work again");
        self.emergency = false;
        self.consecutive_errors = 0;
        self.recovery.set_mode(RecoveryMode::Normal);
        self.events.publish(AnalysisEvent::EmergencyModeExit);
    }

    fn publish_progress(&self) {
        for state in self.active.values() {
            if state.tracker.phase() == RequestPhase::Analyzing {
                self.events.publish(AnalysisEvent::ProgressUpdate(
                    state.tracker.snapshot(self.concurrency_hint),
                ));
            }
        }
    }

    async fn update_session(
        &self,
        request_id: Uuid,
        tracker: &progress::ProgressTracker,
        phase: RequestPhase,
        finished: bool,
    ) {
        let session = AnalysisSession {
            request_id,
            phase,
            total: tracker.total(),
            successful: tracker.completed(),
            failed: tracker.failed(),
            started_at: tracker.started_at(),
            finished_at: finished.then(chrono::Utc::now),
        };
        if let Err(e) = self.store.update_analysis_session(&session).await {
            warn!(request_id = %request_id, error = %e, "session row update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::executor::{ExecutionContext, ExecutionOutput, TaskExecutor};
    use crate::agent::memory::FixedProbe;
    use crate::config::{AgentConfig, GeneratorConfig, RecoveryConfig};
    use crate::inference::GIB;
    use crate::store::sqlite::SqliteStore;
    use async_trait::async_trait;

    struct JsonExecutor;

    #[async_trait]
    impl TaskExecutor for JsonExecutor {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
        ) -> Result<ExecutionOutput, OrchestrationError> {
            Ok(ExecutionOutput {
                response: serde_json::json!({
                    "candidates": [
                        {"value": "quarterly_report.pdf", "confidence": 92, "reasoning": "title"},
                        {"value": "q1_summary.pdf", "confidence": 78, "reasoning": "content"},
                    ]
                })
                .to_string(),
                execution_time_ms: 20,
            })
        }
    }

    async fn seeded_store(count: usize) -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().await.expect("open"));
        for i in 0..count {
            store
                .upsert_file(&FileRecord {
                    id: 0,
                    path: format!("/t/file_{i}.pdf"),
                    name: format!("file_{i}.pdf"),
                    extension: "pdf".to_owned(),
                    size_bytes: 1_024_000,
                    modified_at: 1_700_000_000,
                    parent_dir: "/t".to_owned(),
                    relative_path: None,
                })
                .await
                .expect("upsert");
        }
        store
    }

    async fn service_with(
        store: Arc<SqliteStore>,
        task_executor: Arc<dyn TaskExecutor>,
        tune: impl FnOnce(&mut AnalysisConfig),
    ) -> Arc<AnalysisService> {
        let agent = AgentManager::start(
            AgentConfig::default(),
            task_executor,
            Box::new(FixedProbe::new(32 * GIB)),
            None,
        );
        let generator = Arc::new(TaskGenerator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&agent),
            None,
            GeneratorConfig::default(),
        ));
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default()));
        let mut config = AnalysisConfig::default();
        tune(&mut config);
        AnalysisService::start(
            config,
            store,
            generator,
            agent,
            recovery,
            "llama3.1:8b".to_owned(),
            4,
        )
        .await
    }

    fn request(kinds: Vec<AnalysisKind>) -> AnalysisRequest {
        AnalysisRequest {
            root_path: Some("/t".to_owned()),
            kinds,
            interactive: true,
            ..AnalysisRequest::default()
        }
    }

    async fn wait_for_complete(
        events: &mut broadcast::Receiver<AnalysisEvent>,
    ) -> SessionResult {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event before timeout")
                .expect("channel open");
            if let AnalysisEvent::Complete(result) = event {
                return result;
            }
        }
    }

    #[tokio::test]
    async fn test_start_rejects_empty_kinds() {
        let store = seeded_store(1).await;
        let service = service_with(store, Arc::new(JsonExecutor), |_| {}).await;
        let error = service
            .start_analysis(request(vec![]))
            .await
            .expect_err("validation");
        assert_eq!(error.kind, crate::types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_start_rejects_missing_selection() {
        let store = seeded_store(1).await;
        let service = service_with(store, Arc::new(JsonExecutor), |_| {}).await;
        let error = service
            .start_analysis(AnalysisRequest {
                kinds: vec![AnalysisKind::RenameSuggestions],
                ..AnalysisRequest::default()
            })
            .await
            .expect_err("validation");
        assert_eq!(error.kind, crate::types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_start_rejects_duplicate_active_id() {
        let store = seeded_store(1).await;
        let service = service_with(store, Arc::new(JsonExecutor), |_| {}).await;
        let request_id = Uuid::new_v4();

        let mut first = request(vec![AnalysisKind::RenameSuggestions]);
        first.request_id = Some(request_id);
        // Submitting twice quickly: the second must fail while the first is
        // active (single file completes fast, so race the submissions).
        let accepted = service.start_analysis(first.clone()).await;
        let duplicate = service.start_analysis(first).await;
        assert!(accepted.is_ok());
        if let Err(e) = duplicate {
            assert_eq!(e.kind, crate::types::ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn test_single_file_happy_path_persists_ranked_suggestions() {
        let store = seeded_store(1).await;
        let service = service_with(Arc::clone(&store), Arc::new(JsonExecutor), |_| {}).await;
        let mut events = service.subscribe();

        let request_id = service
            .start_analysis(request(vec![AnalysisKind::RenameSuggestions]))
            .await
            .expect("accepted");

        let result = wait_for_complete(&mut events).await;
        assert_eq!(result.request_id, request_id);
        assert_eq!(result.total, 1);
        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 0);

        let suggestions = service.results(request_id).await.expect("read");
        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].rank_position, 1);
        assert!(suggestions[0].recommended);
        assert_eq!(suggestions[0].adjusted_confidence, 92);
        assert_eq!(suggestions[1].rank_position, 2);
        assert!(!suggestions[1].recommended);
    }

    #[tokio::test]
    async fn test_preview_updates_arrive_before_completion() {
        let store = seeded_store(2).await;
        let service = service_with(store, Arc::new(JsonExecutor), |_| {}).await;
        let mut events = service.subscribe();

        service
            .start_analysis(request(vec![AnalysisKind::RenameSuggestions]))
            .await
            .expect("accepted");

        let mut previews = 0;
        let mut processed_seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event")
                .expect("open");
            match event {
                AnalysisEvent::PreviewUpdate { progress, .. } => {
                    previews += 1;
                    processed_seen.push(progress.processed);
                }
                AnalysisEvent::Complete(_) => break,
                _ => {}
            }
        }
        assert_eq!(previews, 2);
        // Progress is monotonically non-decreasing in processed tasks.
        assert!(processed_seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_cancel_analysis_emits_cancelled_and_forgets_request() {
        struct SlowExecutor;

        #[async_trait]
        impl TaskExecutor for SlowExecutor {
            async fn execute(
                &self,
                ctx: &ExecutionContext,
            ) -> Result<ExecutionOutput, OrchestrationError> {
                ctx.cancel.cancelled().await;
                Err(OrchestrationError::unknown("cancelled"))
            }
        }

        let store = seeded_store(2).await;
        let service = service_with(store, Arc::new(SlowExecutor), |_| {}).await;
        let mut events = service.subscribe();

        let request_id = service
            .start_analysis(request(vec![AnalysisKind::RenameSuggestions]))
            .await
            .expect("accepted");

        assert!(service.cancel_analysis(request_id, "user abort").await);
        assert!(!service.cancel_analysis(request_id, "again").await);
        assert!(service.progress(request_id).await.is_none());

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event")
                .expect("open");
            if let AnalysisEvent::Cancelled {
                request_id: cancelled_id,
                ..
            } = event
            {
                assert_eq!(cancelled_id, request_id);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_metadata_extraction_is_routed_distinctly() {
        let store = seeded_store(1).await;
        let service = service_with(store, Arc::new(JsonExecutor), |c| {
            c.models.metadata = Some("qwen2.5:7b".to_owned());
        })
        .await;
        let mut events = service.subscribe();

        service
            .start_analysis(request(vec![AnalysisKind::MetadataExtraction]))
            .await
            .expect("accepted");

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event")
                .expect("open");
            if let AnalysisEvent::PreviewUpdate { kind, suggestions, .. } = event {
                assert_eq!(kind, Some(AnalysisKind::MetadataExtraction));
                assert!(suggestions
                    .iter()
                    .all(|s| s.model == "qwen2.5:7b"));
                break;
            }
        }
    }
}
