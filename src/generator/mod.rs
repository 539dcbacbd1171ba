//! Task Generator: analysis requests → concrete inference tasks.
//!
//! Resolves file records from the store, filters unsupported extensions,
//! renders prompts, computes per-file timeouts and memory estimates, and
//! submits tasks to the Agent Manager in batches with a short throttling
//! pause between batches.

pub mod prompts;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::task::TaskParams;
use crate::agent::AgentManager;
use crate::config::GeneratorConfig;
use crate::events::TaskMetadata;
use crate::inference::{architecture_floor_bytes, ModelCatalog};
use crate::store::{FileRecord, Store};
use crate::types::{AnalysisKind, OrchestrationError, TaskKind, TaskPriority};

/// Per-file inference overhead cap, in MB.
const FILE_OVERHEAD_CAP_MB: u64 = 512;

/// Per-MB timeout surcharge, in milliseconds.
const SIZE_TIMEOUT_MS_PER_MB: u64 = 5_000;

/// Cap on the size-derived timeout surcharge, in milliseconds.
const SIZE_TIMEOUT_CAP_MS: u64 = 50_000;

/// What to generate tasks for: one request × one analysis kind.
#[derive(Debug, Clone)]
pub struct GenerateSpec {
    /// Request the tasks belong to.
    pub request_id: Uuid,
    /// Explicit file set, when present.
    pub file_ids: Option<Vec<i64>>,
    /// Root path to enumerate, when no explicit set is given.
    pub root_path: Option<String>,
    /// Analysis kind to generate prompts for.
    pub kind: AnalysisKind,
    /// Model the tasks should run against.
    pub model: String,
    /// Priority for the generated tasks.
    pub priority: TaskPriority,
    /// Scheduler-level retries granted to each task.
    pub max_retries: u32,
}

/// Outcome of one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    /// Tasks created and submitted.
    pub created: usize,
    /// Identifiers of the created tasks, in submission order.
    pub task_ids: Vec<Uuid>,
    /// Rough wall-clock estimate for the whole set, in seconds.
    pub estimated_duration_seconds: u64,
    /// Files considered (supported + skipped).
    pub total_files: usize,
    /// Files dropped for unsupported extensions.
    pub skipped: usize,
}

/// Translates requests into submitted tasks.
pub struct TaskGenerator {
    store: Arc<dyn Store>,
    agent: Arc<AgentManager>,
    catalog: Option<Arc<ModelCatalog>>,
    config: GeneratorConfig,
}

impl TaskGenerator {
    /// Generator over a store and scheduler.
    pub fn new(
        store: Arc<dyn Store>,
        agent: Arc<AgentManager>,
        catalog: Option<Arc<ModelCatalog>>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            store,
            agent,
            catalog,
            config,
        }
    }

    /// Resolve files, create one task per supported file, submit them.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error when neither a file set nor a root
    /// path is given, and an `IoError` when the store cannot resolve
    /// files.
    pub async fn generate(
        &self,
        spec: &GenerateSpec,
    ) -> Result<GenerationResult, OrchestrationError> {
        let files = self.resolve_files(spec).await?;
        let total_files = files.len();
        let (supported, skipped): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|f| self.is_supported(&f.extension));
        if !skipped.is_empty() {
            debug!(
                request_id = %spec.request_id,
                skipped = skipped.len(),
                "dropping files with unsupported extensions"
            );
        }

        let model_base_mb = self.model_base_mb(&spec.model).await;
        let mut task_ids = Vec::with_capacity(supported.len());
        let mut total_timeout_ms: u64 = 0;

        for (index, file) in supported.iter().enumerate() {
            if index > 0 && index % self.config.batch_size == 0 {
                // Throttle between batches so the scheduler loop keeps
                // draining its channel.
                tokio::time::sleep(Duration::from_millis(self.config.batch_pause_ms)).await;
            }

            let timeout = self.timeout_for(file);
            total_timeout_ms = total_timeout_ms
                .saturating_add(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));

            let params = TaskParams {
                kind: TaskKind::FileAnalysis,
                priority: spec.priority,
                timeout,
                max_retries: spec.max_retries,
                estimated_memory_mb: memory_estimate_mb(model_base_mb, file.size_mb()),
                metadata: TaskMetadata {
                    file_id: Some(file.id),
                    model: spec.model.clone(),
                    prompt: prompts::prompt_for(spec.kind, file),
                    analysis_kind: Some(spec.kind),
                    request_id: Some(spec.request_id),
                },
            };
            let task_id = self.agent.submit(params).await?;
            task_ids.push(task_id);
        }

        let created = task_ids.len();
        let concurrency = self.config.max_concurrent_tasks.max(1).min(created.max(1));
        let estimated_duration_seconds = total_timeout_ms
            .checked_div(u64::try_from(concurrency).unwrap_or(1).saturating_mul(1_000))
            .unwrap_or(0);

        info!(
            request_id = %spec.request_id,
            kind = %spec.kind,
            created,
            skipped = skipped.len(),
            "tasks generated"
        );
        Ok(GenerationResult {
            created,
            task_ids,
            estimated_duration_seconds,
            total_files,
            skipped: skipped.len(),
        })
    }

    /// Create one batch task covering the whole supported file set.
    ///
    /// Used for group-level questions (shared category, folder naming)
    /// where one prompt over the set beats per-file fan-out. The task's
    /// timeout is the largest per-file timeout plus a surcharge per file,
    /// and its memory estimate carries the overhead of the largest file.
    ///
    /// # Errors
    ///
    /// Same contract as [`TaskGenerator::generate`]; additionally fails
    /// with `validation` when every file was skipped.
    pub async fn generate_batch(
        &self,
        spec: &GenerateSpec,
    ) -> Result<GenerationResult, OrchestrationError> {
        let files = self.resolve_files(spec).await?;
        let total_files = files.len();
        let (supported, skipped): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|f| self.is_supported(&f.extension));
        if supported.is_empty() {
            return Err(OrchestrationError::validation(
                "no supported files for batch analysis",
            ));
        }

        let per_file_ms: u64 = 2_000;
        let widest = supported
            .iter()
            .map(|f| self.timeout_for(f))
            .max()
            .unwrap_or(Duration::from_millis(self.config.default_timeout_ms));
        let surcharge = per_file_ms.saturating_mul(u64::try_from(supported.len()).unwrap_or(0));
        let timeout = widest.saturating_add(Duration::from_millis(surcharge));

        let model_base_mb = self.model_base_mb(&spec.model).await;
        let largest_mb = supported.iter().map(FileRecord::size_mb).max().unwrap_or(0);

        let params = TaskParams {
            kind: TaskKind::BatchAnalysis,
            priority: spec.priority,
            timeout,
            max_retries: spec.max_retries,
            estimated_memory_mb: memory_estimate_mb(model_base_mb, largest_mb),
            metadata: TaskMetadata {
                file_id: None,
                model: spec.model.clone(),
                prompt: prompts::batch_prompt(&supported),
                analysis_kind: Some(spec.kind),
                request_id: Some(spec.request_id),
            },
        };
        let task_id = self.agent.submit(params).await?;

        info!(
            request_id = %spec.request_id,
            files = supported.len(),
            skipped = skipped.len(),
            "batch task generated"
        );
        Ok(GenerationResult {
            created: 1,
            task_ids: vec![task_id],
            estimated_duration_seconds: timeout.as_secs(),
            total_files,
            skipped: skipped.len(),
        })
    }

    async fn resolve_files(
        &self,
        spec: &GenerateSpec,
    ) -> Result<Vec<FileRecord>, OrchestrationError> {
        match (&spec.file_ids, &spec.root_path) {
            (Some(ids), _) if !ids.is_empty() => Ok(self.store.files_by_ids(ids).await?),
            (_, Some(root)) if !root.is_empty() => {
                Ok(self.store.files_by_root_path(root).await?)
            }
            _ => Err(OrchestrationError::validation(
                "a file set or a root path is required",
            )),
        }
    }

    fn is_supported(&self, extension: &str) -> bool {
        self.config
            .supported_extensions
            .iter()
            .any(|e| e == extension)
    }

    /// `(base + size_MB × 5s, capped at 50s) × complexity multiplier`.
    fn timeout_for(&self, file: &FileRecord) -> Duration {
        let size_ms = file
            .size_mb()
            .saturating_mul(SIZE_TIMEOUT_MS_PER_MB)
            .min(SIZE_TIMEOUT_CAP_MS);
        let base_ms = self.config.default_timeout_ms.saturating_add(size_ms);
        let (numerator, denominator) = complexity_multiplier(&file.extension);
        Duration::from_millis(
            base_ms
                .saturating_mul(numerator)
                .checked_div(denominator)
                .unwrap_or(base_ms),
        )
    }

    /// Base memory for the model, in MB, from the footprint cache when
    /// available.
    async fn model_base_mb(&self, model: &str) -> u64 {
        match &self.catalog {
            Some(catalog) => catalog.footprint_or_probe(model).await / (1024 * 1024),
            None => architecture_floor_bytes("") / (1024 * 1024),
        }
    }
}

/// Complexity multiplier by extension class, as an integer ratio.
/// Documents ×1.5, media ×1.2, archives ×1.3, everything else ×1.0.
fn complexity_multiplier(extension: &str) -> (u64, u64) {
    match extension {
        "pdf" | "doc" | "docx" | "txt" | "md" | "rtf" | "odt" | "xls" | "xlsx" | "ppt"
        | "pptx" | "csv" | "html" | "json" => (3, 2),
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "mp3" | "wav" | "flac" | "mp4"
        | "mov" | "mkv" => (6, 5),
        "zip" | "tar" | "gz" | "7z" => (13, 10),
        _ => (1, 1),
    }
}

/// Model base + `min(file_MB × 0.1, 512)` MB of per-file overhead.
fn memory_estimate_mb(model_base_mb: u64, file_mb: u64) -> u64 {
    model_base_mb.saturating_add((file_mb / 10).min(FILE_OVERHEAD_CAP_MB))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::executor::{ExecutionContext, ExecutionOutput, TaskExecutor};
    use crate::agent::memory::FixedProbe;
    use crate::config::AgentConfig;
    use crate::inference::GIB;
    use crate::store::sqlite::SqliteStore;
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
                execution_time_ms: 1,
            })
        }
    }

    async fn seeded_store(paths: &[(&str, u64)]) -> (Arc<SqliteStore>, Vec<i64>) {
        let store = Arc::new(SqliteStore::open_in_memory().await.expect("open"));
        let mut ids = Vec::new();
        for (path, size) in paths {
            let name = path.rsplit('/').next().unwrap_or(path).to_owned();
            let extension = name.rsplit('.').next().unwrap_or("").to_lowercase();
            let id = store
                .upsert_file(&FileRecord {
                    id: 0,
                    path: (*path).to_owned(),
                    name,
                    extension,
                    size_bytes: *size,
                    modified_at: 1_700_000_000,
                    parent_dir: "/t".to_owned(),
                    relative_path: None,
                })
                .await
                .expect("upsert");
            ids.push(id);
        }
        (store, ids)
    }

    fn generator(store: Arc<SqliteStore>) -> TaskGenerator {
        let agent = AgentManager::start(
            AgentConfig::default(),
            Arc::new(InstantExecutor),
            Box::new(FixedProbe::new(32 * GIB)),
            None,
        );
        TaskGenerator::new(store, agent, None, GeneratorConfig::default())
    }

    fn spec(request_id: Uuid, file_ids: Option<Vec<i64>>, root: Option<&str>) -> GenerateSpec {
        GenerateSpec {
            request_id,
            file_ids,
            root_path: root.map(str::to_owned),
            kind: AnalysisKind::RenameSuggestions,
            model: "llama3.1:8b".to_owned(),
            priority: TaskPriority::High,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn test_generate_requires_files_or_root() {
        let (store, _) = seeded_store(&[]).await;
        let generator = generator(store);
        let error = generator
            .generate(&spec(Uuid::new_v4(), None, None))
            .await
            .expect_err("validation");
        assert_eq!(error.kind, crate::types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_generate_by_ids_creates_one_task_per_file() {
        let (store, ids) =
            seeded_store(&[("/t/a.pdf", 1_000_000), ("/t/b.txt", 2_000_000)]).await;
        let generator = generator(store);

        let result = generator
            .generate(&spec(Uuid::new_v4(), Some(ids), None))
            .await
            .expect("generate");
        assert_eq!(result.created, 2);
        assert_eq!(result.task_ids.len(), 2);
        assert_eq!(result.total_files, 2);
        assert_eq!(result.skipped, 0);
    }

    #[tokio::test]
    async fn test_generate_skips_unsupported_extensions() {
        let (store, _) = seeded_store(&[
            ("/t/keep.pdf", 1_000),
            ("/t/drop.exe", 1_000),
            ("/t/also.bin", 1_000),
        ])
        .await;
        let generator = generator(store);

        let result = generator
            .generate(&spec(Uuid::new_v4(), None, Some("/t")))
            .await
            .expect("generate");
        assert_eq!(result.created, 1);
        assert_eq!(result.total_files, 3);
        assert_eq!(result.skipped, 2);
    }

    #[tokio::test]
    async fn test_timeout_formula() {
        let (store, _) = seeded_store(&[]).await;
        let generator = generator(store);

        // 4 MB pdf: (30_000 + 20_000) × 1.5 = 75s.
        let pdf = FileRecord {
            id: 1,
            path: "/t/x.pdf".to_owned(),
            name: "x.pdf".to_owned(),
            extension: "pdf".to_owned(),
            size_bytes: 4 * 1024 * 1024,
            modified_at: 0,
            parent_dir: "/t".to_owned(),
            relative_path: None,
        };
        assert_eq!(generator.timeout_for(&pdf), Duration::from_millis(75_000));

        // 100 MB mp4: surcharge capped at 50s, (30_000 + 50_000) × 1.2 = 96s.
        let mp4 = FileRecord {
            extension: "mp4".to_owned(),
            size_bytes: 100 * 1024 * 1024,
            ..pdf.clone()
        };
        assert_eq!(generator.timeout_for(&mp4), Duration::from_millis(96_000));

        // Unknown extension: no multiplier.
        let bin = FileRecord {
            extension: "dat".to_owned(),
            size_bytes: 0,
            ..pdf
        };
        assert_eq!(generator.timeout_for(&bin), Duration::from_millis(30_000));
    }

    #[test]
    fn test_memory_estimate_overhead_capped() {
        assert_eq!(memory_estimate_mb(4096, 50), 4101);
        assert_eq!(memory_estimate_mb(4096, 100_000), 4096 + 512);
        assert_eq!(memory_estimate_mb(4096, 0), 4096);
    }

    #[test]
    fn test_complexity_multiplier_classes() {
        assert_eq!(complexity_multiplier("pdf"), (3, 2));
        assert_eq!(complexity_multiplier("mp4"), (6, 5));
        assert_eq!(complexity_multiplier("zip"), (13, 10));
        assert_eq!(complexity_multiplier("rs"), (1, 1));
    }

    #[tokio::test]
    async fn test_generate_batch_creates_single_group_task() {
        let (store, ids) = seeded_store(&[
            ("/t/a.pdf", 1_000_000),
            ("/t/b.txt", 2_000_000),
            ("/t/c.exe", 500),
        ])
        .await;
        let generator = generator(store);

        let result = generator
            .generate_batch(&spec(Uuid::new_v4(), Some(ids), None))
            .await
            .expect("generate");
        assert_eq!(result.created, 1);
        assert_eq!(result.task_ids.len(), 1);
        assert_eq!(result.total_files, 3);
        assert_eq!(result.skipped, 1);
    }

    #[tokio::test]
    async fn test_generate_batch_rejects_all_unsupported() {
        let (store, ids) = seeded_store(&[("/t/a.exe", 100), ("/t/b.bin", 100)]).await;
        let generator = generator(store);
        let error = generator
            .generate_batch(&spec(Uuid::new_v4(), Some(ids), None))
            .await
            .expect_err("validation");
        assert_eq!(error.kind, crate::types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_generated_tasks_carry_request_correlation() {
        let (store, ids) = seeded_store(&[("/t/a.pdf", 1_000)]).await;
        let request_id = Uuid::new_v4();
        let agent = AgentManager::start(
            AgentConfig::default(),
            Arc::new(InstantExecutor),
            Box::new(FixedProbe::new(32 * GIB)),
            None,
        );
        let mut events = agent.subscribe();
        let generator = TaskGenerator::new(
            store,
            Arc::clone(&agent),
            None,
            GeneratorConfig::default(),
        );

        let result = generator
            .generate(&spec(request_id, Some(ids), None))
            .await
            .expect("generate");
        assert_eq!(result.created, 1);

        let event = events.recv().await.expect("completion event");
        match event {
            crate::events::AgentEvent::TaskCompleted(report) => {
                assert_eq!(report.metadata.request_id, Some(request_id));
                assert_eq!(
                    report.metadata.analysis_kind,
                    Some(AnalysisKind::RenameSuggestions)
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
