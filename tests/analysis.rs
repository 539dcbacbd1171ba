//! Analysis Service emergency-mode policy (sustained failures).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use sortinghat::agent::executor::{ExecutionContext, ExecutionOutput, TaskExecutor};
use sortinghat::agent::memory::FixedProbe;
use sortinghat::agent::AgentManager;
use sortinghat::analysis::{AnalysisRequest, AnalysisService};
use sortinghat::config::{AgentConfig, AnalysisConfig, GeneratorConfig, RecoveryConfig};
use sortinghat::events::AnalysisEvent;
use sortinghat::generator::TaskGenerator;
use sortinghat::recovery::ErrorRecoveryManager;
use sortinghat::store::sqlite::SqliteStore;
use sortinghat::store::{FileRecord, Store};
use sortinghat::types::{AnalysisKind, ErrorKind, OrchestrationError};

const GIB: u64 = 1024 * 1024 * 1024;

struct FailingExecutor;

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionOutput, OrchestrationError> {
        Err(OrchestrationError::model_unavailable("daemon gone"))
    }
}

async fn seeded_store(count: usize) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory().await.expect("open"));
    for i in 0..count {
        store
            .upsert_file(&FileRecord {
                id: 0,
                path: format!("/t/doc_{i}.pdf"),
                name: format!("doc_{i}.pdf"),
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

async fn failing_service(
    store: Arc<SqliteStore>,
    error_threshold: u32,
    cooldown_ms: u64,
) -> Arc<AnalysisService> {
    let agent = AgentManager::start(
        AgentConfig {
            safety_factor: 1.0,
            os_reserved_memory_mb: 0,
            ..AgentConfig::default()
        },
        Arc::new(FailingExecutor),
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
    AnalysisService::start(
        AnalysisConfig {
            error_threshold,
            emergency_cooldown_ms: cooldown_ms,
            retry_attempts: 0,
            ..AnalysisConfig::default()
        },
        store,
        generator,
        agent,
        recovery,
        "llama3.1:8b".to_owned(),
        4,
    )
    .await
}

fn request() -> AnalysisRequest {
    AnalysisRequest {
        root_path: Some("/t".to_owned()),
        kinds: vec![AnalysisKind::RenameSuggestions],
        interactive: false,
        ..AnalysisRequest::default()
    }
}

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<AnalysisEvent>,
) -> AnalysisEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event before timeout")
        .expect("channel open")
}

// S5: sustained failures trip emergency mode, active work is cancelled,
// new requests are rejected, and the cool-down re-opens the service.
#[tokio::test]
async fn sustained_failures_enter_and_exit_emergency_mode() {
    let store = seeded_store(6).await;
    let service = failing_service(store, 3, 400).await;
    let mut events = service.subscribe();

    let request_id = service.start_analysis(request()).await.expect("accepted");

    // The failing executor marches the consecutive-error counter up to
    // the threshold.
    let mut entered = false;
    let mut errored = false;
    for _ in 0..64 {
        match next_event(&mut events).await {
            AnalysisEvent::EmergencyMode { .. } => entered = true,
            AnalysisEvent::Error {
                request_id: errored_id,
                ..
            } => {
                assert_eq!(errored_id, request_id);
                errored = true;
            }
            _ => {}
        }
        if entered && errored {
            break;
        }
    }
    assert!(entered, "emergency mode event expected");
    assert!(errored, "active request must terminate in error");
    assert!(service.in_emergency().await);
    assert!(service.progress(request_id).await.is_none());

    // New work is rejected with the model-unavailable classification.
    let rejection = service
        .start_analysis(request())
        .await
        .expect_err("rejected during emergency");
    assert_eq!(rejection.kind, ErrorKind::AiModelUnavailable);

    // Cool-down elapses; the service announces exit and accepts again.
    let mut exited = false;
    for _ in 0..64 {
        if matches!(next_event(&mut events).await, AnalysisEvent::EmergencyModeExit) {
            exited = true;
            break;
        }
    }
    assert!(exited, "emergency exit event expected");
    assert!(!service.in_emergency().await);
    service
        .start_analysis(request())
        .await
        .expect("accepted after cool-down");
}

#[tokio::test]
async fn failures_below_threshold_finalize_with_error_summary() {
    let store = seeded_store(2).await;
    // Threshold far above the failure count: no emergency.
    let service = failing_service(store, 100, 60_000).await;
    let mut events = service.subscribe();

    service.start_analysis(request()).await.expect("accepted");

    loop {
        match next_event(&mut events).await {
            AnalysisEvent::Complete(result) => {
                assert_eq!(result.total, 2);
                assert_eq!(result.successful, 0);
                assert_eq!(result.failed, 2);
                assert!(!result.errors.is_empty());
                assert!(result.errors.len() <= 10);
                break;
            }
            AnalysisEvent::EmergencyMode { .. } => panic!("threshold must not trip"),
            _ => {}
        }
    }
}
