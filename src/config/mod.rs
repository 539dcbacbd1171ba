//! Configuration loading and management.
//!
//! Loads configuration from `./sortinghat.toml` (or `$SORTINGHAT_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SortinghatConfig {
    /// Agent Manager scheduling settings (`[agent]`).
    pub agent: AgentConfig,
    /// Task Generator settings (`[generator]`).
    pub generator: GeneratorConfig,
    /// Analysis Service settings (`[analysis]`).
    pub analysis: AnalysisConfig,
    /// Error Recovery Manager settings (`[recovery]`).
    pub recovery: RecoveryConfig,
    /// Inference daemon settings (`[inference]`).
    pub inference: InferenceConfig,
    /// Persistence settings (`[store]`).
    pub store: StoreConfig,
    /// Filesystem paths (`[paths]`).
    pub paths: PathsConfig,
}

/// Agent Manager scheduling settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound on concurrently running tasks.
    pub max_concurrent_slots: usize,
    /// Multiplier padding memory estimates and the budget sample.
    pub safety_factor: f64,
    /// Memory held back for the OS, in MB.
    pub os_reserved_memory_mb: u64,
    /// Default per-task timeout in milliseconds.
    pub task_timeout_ms: u64,
    /// How long a signalled executor may take to acknowledge cancellation
    /// before the slot is reclaimed anyway, in milliseconds.
    pub cancel_grace_ms: u64,
    /// Fallback per-task memory estimate when no tasks are known, in MB.
    pub default_task_memory_mb: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_slots: 4,
            safety_factor: 1.5,
            os_reserved_memory_mb: 2048,
            task_timeout_ms: 300_000,
            cancel_grace_ms: 5_000,
            default_task_memory_mb: 4096,
        }
    }
}

/// Task Generator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Tasks created per batch before the throttling pause.
    pub batch_size: usize,
    /// Pause between batches, in milliseconds.
    pub batch_pause_ms: u64,
    /// Base timeout before size and complexity adjustments, in milliseconds.
    pub default_timeout_ms: u64,
    /// Advisory cap passed through to schedulers above the generator.
    pub max_concurrent_tasks: usize,
    /// File extensions eligible for analysis (lowercase, no dot).
    pub supported_extensions: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_pause_ms: 100,
            default_timeout_ms: 30_000,
            max_concurrent_tasks: 10,
            supported_extensions: [
                "pdf", "doc", "docx", "txt", "md", "rtf", "odt", "jpg", "jpeg", "png", "gif",
                "webp", "heic", "mp3", "wav", "flac", "mp4", "mov", "mkv", "zip", "tar", "gz",
                "7z", "csv", "xls", "xlsx", "ppt", "pptx", "html", "json",
            ]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
        }
    }
}

/// Analysis Service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Maximum simultaneously active requests.
    pub max_concurrent_analysis: usize,
    /// Default per-request task timeout, in milliseconds.
    pub default_timeout_ms: u64,
    /// Scheduler-level retries granted to generated tasks.
    pub retry_attempts: u32,
    /// Files processed per generator call for large requests.
    pub batch_processing_size: usize,
    /// Progress publication tick, in milliseconds.
    pub progress_update_interval_ms: u64,
    /// Consecutive failures before emergency mode.
    pub error_threshold: u32,
    /// Cool-down before emergency mode exits, in milliseconds.
    pub emergency_cooldown_ms: u64,
    /// Per-kind model routing (`[analysis.models]`).
    pub models: AnalysisModelsConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_concurrent_analysis: 5,
            default_timeout_ms: 45_000,
            retry_attempts: 2,
            batch_processing_size: 25,
            progress_update_interval_ms: 2_000,
            error_threshold: 10,
            emergency_cooldown_ms: 300_000,
            models: AnalysisModelsConfig::default(),
        }
    }
}

/// Per-kind model routing table. Unset entries fall back to the persisted
/// model preferences, then to the inference default model.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnalysisModelsConfig {
    /// Model for rename suggestions.
    pub rename: Option<String>,
    /// Model for classification.
    pub classification: Option<String>,
    /// Model for content summaries.
    pub summary: Option<String>,
    /// Model for metadata extraction.
    pub metadata: Option<String>,
}

/// Error Recovery Manager settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Service-wide consecutive failures before degraded mode.
    pub max_consecutive_failures: u32,
    /// Budget for a recovery probe, in milliseconds.
    pub recovery_timeout_ms: u64,
    /// Failures before a breaker opens.
    pub circuit_breaker_threshold: u32,
    /// Time an open breaker waits before a half-open probe, in milliseconds.
    pub circuit_breaker_reset_time_ms: u64,
    /// Attempts per operation, including the first.
    pub max_retry_attempts: u32,
    /// Exponential backoff base multiplier.
    pub retry_backoff_multiplier: u32,
    /// Hard deadline for fallback execution, in milliseconds.
    pub fallback_timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            recovery_timeout_ms: 30_000,
            circuit_breaker_threshold: 10,
            circuit_breaker_reset_time_ms: 60_000,
            max_retry_attempts: 3,
            retry_backoff_multiplier: 2,
            fallback_timeout_ms: 10_000,
        }
    }
}

/// Inference daemon settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL of the local Ollama daemon.
    pub base_url: String,
    /// Model used when neither request nor routing table names one.
    pub default_model: String,
    /// HTTP connect timeout, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_owned(),
            default_model: "llama3.1:8b".to_owned(),
            connect_timeout_ms: 5_000,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path.
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "sortinghat.db".to_owned(),
        }
    }
}

/// Filesystem paths for runtime state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for rotated JSON logs.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: "logs".to_owned(),
        }
    }
}

impl SortinghatConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$SORTINGHAT_CONFIG_PATH` or `./sortinghat.toml`.
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed,
    /// or if the resulting configuration fails validation.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from the TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: SortinghatConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(SortinghatConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve the config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("SORTINGHAT_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("sortinghat.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        fn parse_override<T: std::str::FromStr>(var: &'static str, value: &str) -> Option<T> {
            match value.parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    tracing::warn!(var, value, "ignoring invalid env override");
                    None
                }
            }
        }

        // Agent.
        if let Some(v) = env("SORTINGHAT_MAX_SLOTS") {
            if let Some(n) = parse_override("SORTINGHAT_MAX_SLOTS", &v) {
                self.agent.max_concurrent_slots = n;
            }
        }
        if let Some(v) = env("SORTINGHAT_TASK_TIMEOUT_MS") {
            if let Some(n) = parse_override("SORTINGHAT_TASK_TIMEOUT_MS", &v) {
                self.agent.task_timeout_ms = n;
            }
        }
        if let Some(v) = env("SORTINGHAT_OS_RESERVED_MB") {
            if let Some(n) = parse_override("SORTINGHAT_OS_RESERVED_MB", &v) {
                self.agent.os_reserved_memory_mb = n;
            }
        }

        // Analysis.
        if let Some(v) = env("SORTINGHAT_ERROR_THRESHOLD") {
            if let Some(n) = parse_override("SORTINGHAT_ERROR_THRESHOLD", &v) {
                self.analysis.error_threshold = n;
            }
        }

        // Inference.
        if let Some(v) = env("SORTINGHAT_OLLAMA_URL") {
            self.inference.base_url = v;
        }
        if let Some(v) = env("SORTINGHAT_DEFAULT_MODEL") {
            self.inference.default_model = v;
        }

        // Store and paths.
        if let Some(v) = env("SORTINGHAT_DB_PATH") {
            self.store.db_path = v;
        }
        if let Some(v) = env("SORTINGHAT_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
    }

    /// Reject configurations that cannot schedule any work.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_concurrent_slots == 0 {
            anyhow::bail!("agent.max_concurrent_slots must be at least 1");
        }
        if self.agent.safety_factor <= 0.0 {
            anyhow::bail!("agent.safety_factor must be positive");
        }
        if self.generator.batch_size == 0 {
            anyhow::bail!("generator.batch_size must be at least 1");
        }
        if self.recovery.max_retry_attempts == 0 {
            anyhow::bail!("recovery.max_retry_attempts must be at least 1");
        }
        if self.recovery.retry_backoff_multiplier == 0 {
            anyhow::bail!("recovery.retry_backoff_multiplier must be at least 1");
        }
        if self.analysis.error_threshold == 0 {
            anyhow::bail!("analysis.error_threshold must be at least 1");
        }
        Ok(())
    }
}
