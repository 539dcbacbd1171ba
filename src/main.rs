#![allow(missing_docs)]

//! Sortinghat CLI — drive the orchestration core against a local Ollama
//! daemon: one-shot directory analysis, model listing, and health checks.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use sortinghat::agent::executor::InferenceExecutor;
use sortinghat::agent::memory::SysinfoProbe;
use sortinghat::agent::AgentManager;
use sortinghat::analysis::{AnalysisRequest, AnalysisService};
use sortinghat::config::SortinghatConfig;
use sortinghat::events::AnalysisEvent;
use sortinghat::generator::TaskGenerator;
use sortinghat::inference::ollama::OllamaClient;
use sortinghat::inference::{InferenceClient, ModelCatalog};
use sortinghat::recovery::ErrorRecoveryManager;
use sortinghat::store::sqlite::SqliteStore;
use sortinghat::store::{FileRecord, Store};
use sortinghat::types::AnalysisKind;

#[derive(Parser)]
#[command(
    name = "sortinghat",
    version,
    about = "On-device file-organization assistant driven by local LLM inference"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyse files under a directory and print ranked suggestions.
    Analyze {
        /// Directory to analyse.
        #[arg(long)]
        root: PathBuf,
        /// Comma-separated analysis kinds (rename-suggestions,
        /// classification, content-summary, metadata-extraction).
        #[arg(long, default_value = "rename-suggestions")]
        kinds: String,
        /// Model override winning over the routing table.
        #[arg(long)]
        model: Option<String>,
    },
    /// List installed models with estimated memory footprints.
    Models,
    /// Probe the inference daemon and report the derived budget.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    sortinghat::logging::init_cli();

    let cli = Cli::parse();
    let config = SortinghatConfig::load()?;

    match cli.command {
        Command::Analyze { root, kinds, model } => analyze(&config, &root, &kinds, model).await,
        Command::Models => models(&config).await,
        Command::Health => health(&config).await,
    }
}

async fn analyze(
    config: &SortinghatConfig,
    root: &Path,
    kinds: &str,
    model: Option<String>,
) -> Result<()> {
    let kinds = parse_kinds(kinds)?;
    let root = root
        .canonicalize()
        .with_context(|| format!("cannot resolve root {}", root.display()))?;

    let store: Arc<SqliteStore> = Arc::new(SqliteStore::open(&config.store.db_path).await?);
    let indexed = index_directory(store.as_ref(), &root).await?;
    info!(indexed, root = %root.display(), "directory indexed");

    let client: Arc<dyn InferenceClient> = Arc::new(OllamaClient::new(
        &config.inference.base_url,
        Duration::from_millis(config.inference.connect_timeout_ms),
    ));
    let catalog = Arc::new(ModelCatalog::new(
        Arc::clone(&client),
        config.agent.safety_factor,
    ));
    let recovery = Arc::new(ErrorRecoveryManager::new(config.recovery.clone()));
    let task_executor = Arc::new(InferenceExecutor::new(
        Arc::clone(&client),
        Arc::clone(&recovery),
    ));

    let agent = AgentManager::start(
        config.agent.clone(),
        task_executor,
        Box::new(SysinfoProbe::new()),
        Some(Arc::clone(&catalog)),
    );
    agent.recompute_slot_capacity().await;

    let generator = Arc::new(TaskGenerator::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&agent),
        Some(catalog),
        config.generator.clone(),
    ));
    let service = AnalysisService::start(
        config.analysis.clone(),
        Arc::clone(&store) as Arc<dyn Store>,
        generator,
        Arc::clone(&agent),
        recovery,
        config.inference.default_model.clone(),
        config.agent.max_concurrent_slots,
    )
    .await;

    let mut events = service.subscribe();
    let request_id = service
        .start_analysis(AnalysisRequest {
            root_path: Some(root.to_string_lossy().into_owned()),
            kinds,
            interactive: true,
            model_override: model,
            ..AnalysisRequest::default()
        })
        .await
        .map_err(|e| anyhow::anyhow!("analysis rejected: {e}"))?;

    println!("analysis {request_id} started");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(AnalysisEvent::ProgressUpdate(progress)) => {
                    println!(
                        "  progress: {}/{} processed ({} failed){}",
                        progress.processed,
                        progress.total,
                        progress.failed,
                        progress
                            .eta_seconds
                            .map(|s| format!(", ~{s}s remaining"))
                            .unwrap_or_default()
                    );
                }
                Ok(AnalysisEvent::PreviewUpdate { file_id, kind, suggestions, .. }) => {
                    for s in &suggestions {
                        let marker = if s.recommended { "*" } else { " " };
                        println!(
                            " {marker} file {} [{}] #{} {:>3}% {}",
                            file_id.unwrap_or(0),
                            kind.map(|k| k.as_str()).unwrap_or("?"),
                            s.rank_position,
                            s.adjusted_confidence,
                            s.value
                        );
                    }
                }
                Ok(AnalysisEvent::Complete(result)) => {
                    println!(
                        "done: {}/{} succeeded, {} failed, avg {}ms",
                        result.successful, result.total, result.failed,
                        result.average_execution_time_ms
                    );
                    for error in &result.errors {
                        println!("  error: {error}");
                    }
                    break;
                }
                Ok(AnalysisEvent::Error { error, .. }) => {
                    anyhow::bail!("analysis failed: {error}");
                }
                Ok(AnalysisEvent::EmergencyMode { reason }) => {
                    anyhow::bail!("emergency mode: {reason}");
                }
                Ok(_) => {}
                Err(e) => anyhow::bail!("event stream closed: {e}"),
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, cancelling analysis");
                service.cancel_analysis(request_id, "interrupted").await;
                agent.shutdown().await;
                break;
            }
        }
    }

    service.shutdown().await;
    agent.shutdown().await;
    Ok(())
}

async fn models(config: &SortinghatConfig) -> Result<()> {
    let client = OllamaClient::new(
        &config.inference.base_url,
        Duration::from_millis(config.inference.connect_timeout_ms),
    );
    let models = client
        .list_models()
        .await
        .map_err(|e| anyhow::anyhow!("cannot list models: {e}"))?;
    if models.is_empty() {
        println!("no models installed");
        return Ok(());
    }
    for model in models {
        let estimate = client
            .estimate_memory(&model.name)
            .await
            .map(|bytes| bytes / (1024 * 1024))
            .unwrap_or(0);
        println!(
            "{:<28} {:>6} MB on disk, ~{:>6} MB resident  ({}, {})",
            model.name,
            model.size_bytes / (1024 * 1024),
            estimate,
            model.parameter_size,
            model.quantization
        );
    }
    Ok(())
}

async fn health(config: &SortinghatConfig) -> Result<()> {
    let client = OllamaClient::new(
        &config.inference.base_url,
        Duration::from_millis(config.inference.connect_timeout_ms),
    );
    let health = client.health().await;
    println!("daemon: {:?} ({} models)", health.status, health.model_count);
    for message in &health.messages {
        println!("  {message}");
    }

    let probe = SysinfoProbe::new();
    let budget = sortinghat::agent::memory::MemoryBudget::new(
        Box::new(probe),
        config.agent.safety_factor,
        config.agent.os_reserved_memory_mb,
    );
    let budget_mb = budget.current_budget_mb();
    let slots = sortinghat::agent::memory::effective_slots(
        config.agent.max_concurrent_slots,
        budget_mb,
        config.agent.default_task_memory_mb,
    );
    println!("budget: {budget_mb} MB, effective slots: {slots}");
    Ok(())
}

fn parse_kinds(raw: &str) -> Result<Vec<AnalysisKind>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| AnalysisKind::parse(s).map_err(|e| anyhow::anyhow!("{e}")))
        .collect()
}

/// Minimal directory ingest so the core has file records to work on. The
/// full scan pipeline lives in the desktop worker; this walks the tree
/// with a work queue and upserts basic metadata.
async fn index_directory(store: &SqliteStore, root: &Path) -> Result<usize> {
    let mut indexed = 0_usize;
    let mut pending: VecDeque<PathBuf> = VecDeque::from([root.to_path_buf()]);

    while let Some(dir) = pending.pop_front() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("cannot read directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push_back(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let metadata = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let modified_at = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .and_then(|d| i64::try_from(d.as_secs()).ok())
                .unwrap_or(0);
            let relative_path = path
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().into_owned());

            store
                .upsert_file(&FileRecord {
                    id: 0,
                    path: path.to_string_lossy().into_owned(),
                    name,
                    extension,
                    size_bytes: metadata.len(),
                    modified_at,
                    parent_dir: dir.to_string_lossy().into_owned(),
                    relative_path,
                })
                .await?;
            indexed = indexed.saturating_add(1);
        }
    }
    Ok(indexed)
}
