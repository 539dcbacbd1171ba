//! End-to-end pipeline: request → tasks → inference → scoring →
//! persistence, and the score/persist round-trip guarantee.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use sortinghat::agent::executor::{ExecutionContext, ExecutionOutput, TaskExecutor};
use sortinghat::agent::memory::FixedProbe;
use sortinghat::agent::AgentManager;
use sortinghat::analysis::{AnalysisRequest, AnalysisService};
use sortinghat::config::{AgentConfig, AnalysisConfig, GeneratorConfig, RecoveryConfig};
use sortinghat::events::AnalysisEvent;
use sortinghat::generator::TaskGenerator;
use sortinghat::recovery::ErrorRecoveryManager;
use sortinghat::scoring::{ConfidenceScorer, ScoreContext};
use sortinghat::store::sqlite::SqliteStore;
use sortinghat::store::{FileRecord, Store};
use sortinghat::types::AnalysisKind;

const GIB: u64 = 1024 * 1024 * 1024;

struct TwoCandidateExecutor;

#[async_trait]
impl TaskExecutor for TwoCandidateExecutor {
    async fn execute(
        &self,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, sortinghat::types::OrchestrationError> {
        Ok(ExecutionOutput {
            response: serde_json::json!({
                "candidates": [
                    {
                        "value": "project_report_q1_2026.pdf",
                        "confidence": 92,
                        "reasoning": "the title page names the Q1 2026 project report"
                    },
                    {
                        "value": "annual_overview.pdf",
                        "confidence": 78,
                        "reasoning": "general summary match"
                    }
                ]
            })
            .to_string(),
            execution_time_ms: 42,
        })
    }
}

// S1: one file, one kind, a two-candidate model response.
#[tokio::test]
async fn single_file_happy_path() {
    let store = Arc::new(SqliteStore::open_in_memory().await.expect("open"));
    store
        .upsert_file(&FileRecord {
            id: 0,
            path: "/t/project_report.pdf".to_owned(),
            name: "project_report.pdf".to_owned(),
            extension: "pdf".to_owned(),
            size_bytes: 1_024_000,
            modified_at: 1_700_000_000,
            parent_dir: "/t".to_owned(),
            relative_path: None,
        })
        .await
        .expect("upsert");

    let agent = AgentManager::start(
        AgentConfig::default(),
        Arc::new(TwoCandidateExecutor),
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
    let service = AnalysisService::start(
        AnalysisConfig::default(),
        Arc::clone(&store) as Arc<dyn Store>,
        generator,
        agent,
        recovery,
        "llama3.1:8b".to_owned(),
        4,
    )
    .await;
    let mut events = service.subscribe();

    let request_id = service
        .start_analysis(AnalysisRequest {
            root_path: Some("/t".to_owned()),
            kinds: vec![AnalysisKind::RenameSuggestions],
            interactive: true,
            model_override: Some("M".to_owned()),
            ..AnalysisRequest::default()
        })
        .await
        .expect("accepted");

    let mut previews = 0;
    let session = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        match event {
            AnalysisEvent::PreviewUpdate {
                suggestions,
                progress,
                ..
            } => {
                previews += 1;
                assert_eq!(progress.total, 1);
                assert_eq!(progress.completed, 1);
                assert_eq!(progress.failed, 0);
                assert_eq!(suggestions.len(), 2);
            }
            AnalysisEvent::Complete(result) => break result,
            _ => {}
        }
    };

    assert_eq!(previews, 1, "exactly one preview per file");
    assert_eq!(session.request_id, request_id);
    assert_eq!(session.total, 1);
    assert_eq!(session.successful, 1);
    assert_eq!(session.failed, 0);
    assert!(session.errors.is_empty());

    let persisted = store
        .suggestions_for_request(request_id)
        .await
        .expect("read");
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[0].rank_position, 1);
    assert_eq!(persisted[0].value, "project_report_q1_2026.pdf");
    assert_eq!(persisted[0].adjusted_confidence, 92);
    assert!(persisted[0].recommended);
    assert_eq!(persisted[0].model, "M");
    assert_eq!(persisted[1].rank_position, 2);
    assert_eq!(persisted[1].adjusted_confidence, 78);
    assert!(!persisted[1].recommended);

    // The session row survives finalization for the history view.
    let row = store
        .analysis_session(request_id)
        .await
        .expect("read")
        .expect("present");
    assert_eq!(row.successful, 1);
    assert!(row.finished_at.is_some());
}

// Invariant 8: parse → score → persist → re-read preserves adjusted
// confidences, ranks, flags, and the recommended marker.
#[tokio::test]
async fn scored_suggestions_round_trip_through_the_store() {
    let store = SqliteStore::open_in_memory().await.expect("open");
    let scorer = ConfidenceScorer::default();
    let request_id = Uuid::new_v4();

    let ctx = ScoreContext {
        file_id: 7,
        file_name: "project_report.pdf".to_owned(),
        file_extension: "pdf".to_owned(),
        request_id,
        kind: AnalysisKind::RenameSuggestions,
        model: "llama3.1:8b".to_owned(),
        execution_time_ms: 1234,
    };
    let response = serde_json::json!({
        "candidates": [
            {"value": "clean_name.pdf", "confidence": 70, "reasoning": "solid match"},
            {"value": "bad:name.pdf", "confidence": 95, "reasoning": "would rank first unflagged"},
            {"value": "other.txt", "confidence": 60, "reasoning": "changes extension"},
        ]
    })
    .to_string();

    let scored = scorer.score(&ctx, &response);
    store.save_suggestions(&scored).await.expect("save");
    let restored = store
        .suggestions_for_request(request_id)
        .await
        .expect("read");

    assert_eq!(scored.len(), restored.len());
    for (a, b) in scored.iter().zip(restored.iter()) {
        assert_eq!(a.value, b.value);
        assert_eq!(a.original_confidence, b.original_confidence);
        assert_eq!(a.adjusted_confidence, b.adjusted_confidence);
        assert_eq!(a.rank_position, b.rank_position);
        assert_eq!(a.recommended, b.recommended);
        assert_eq!(a.flags, b.flags);
        assert_eq!(a.model, b.model);
        assert_eq!(a.execution_time_ms, b.execution_time_ms);
    }

    // Illegal characters drop 95 → 75, which still outranks the clean 70;
    // the flagged rank-1 candidate is never recommended and the marker
    // falls to the best clean candidate.
    let rank_one = restored
        .iter()
        .find(|s| s.rank_position == 1)
        .expect("rank 1");
    assert_eq!(rank_one.value, "bad:name.pdf");
    assert_eq!(rank_one.adjusted_confidence, 75);
    assert!(!rank_one.recommended);
    let recommended = restored
        .iter()
        .find(|s| s.recommended)
        .expect("a clean candidate is recommended");
    assert_eq!(recommended.value, "clean_name.pdf");
    assert_eq!(recommended.rank_position, 2);
}
