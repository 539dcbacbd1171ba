//! Inference daemon contract and model memory estimation.
//!
//! The [`InferenceClient`] trait mediates all LLM communication. The
//! production implementation is [`ollama::OllamaClient`]; tests swap in
//! mocks. The [`ModelCatalog`] caches per-model memory footprints so the
//! scheduler can admit tasks without a network round-trip.

pub mod ollama;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::types::{ErrorKind, OrchestrationError};

/// One gibibyte, in bytes.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Inference errors, classified for the recovery layer.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Transport failure or unexpected daemon response.
    #[error("inference request failed: {0}")]
    RequestFailed(String),
    /// The requested model is not installed on the daemon.
    #[error("model not available: {0}")]
    ModelUnavailable(String),
    /// The request exceeded its deadline.
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    /// The daemon reported overload.
    #[error("daemon overloaded (HTTP {status})")]
    Overloaded {
        /// HTTP status code.
        status: u16,
    },
    /// The daemon answered with an unparseable payload.
    #[error("response parse error: {0}")]
    Parse(String),
}

impl InferenceError {
    /// Behavioral classification of this error.
    pub fn classify(&self) -> ErrorKind {
        match self {
            Self::RequestFailed(_) | Self::ModelUnavailable(_) => ErrorKind::AiModelUnavailable,
            Self::Timeout(_) => ErrorKind::AiModelTimeout,
            Self::Overloaded { .. } => ErrorKind::AiModelOverloaded,
            Self::Parse(_) => ErrorKind::AiResponseInvalid,
        }
    }
}

impl From<InferenceError> for OrchestrationError {
    fn from(e: InferenceError) -> Self {
        OrchestrationError::new(e.classify(), e.to_string())
    }
}

/// Options for one generate call.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Deadline for the whole call.
    pub timeout: Duration,
    /// Sampling temperature, when the caller wants to override the default.
    pub temperature: Option<f32>,
    /// Cap on generated tokens.
    pub max_tokens: Option<u32>,
    /// Ask the daemon to constrain output to a JSON object.
    pub format_json: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            temperature: None,
            max_tokens: None,
            format_json: false,
        }
    }
}

/// Result of one generate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateOutput {
    /// Raw model response text.
    pub response: String,
    /// Wall-clock inference time.
    pub execution_time_ms: u64,
}

/// Metadata for one installed model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name, e.g. `llama3.1:8b`.
    pub name: String,
    /// On-disk size in bytes.
    pub size_bytes: u64,
    /// Model family, e.g. `llama`.
    pub family: String,
    /// Parameter count label, e.g. `8.0B`.
    pub parameter_size: String,
    /// Quantization label, e.g. `Q4_K_M`.
    pub quantization: String,
}

/// Daemon reachability classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Daemon answered normally.
    Healthy,
    /// Daemon answered with an error status.
    Degraded,
    /// Daemon did not answer at all.
    Unreachable,
}

/// Aggregate daemon health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Reachability classification.
    pub status: HealthState,
    /// Human-readable detail lines.
    pub messages: Vec<String>,
    /// Number of installed models, when known.
    pub model_count: usize,
}

/// LLM daemon operations the core consumes.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Execute a prompt against a named model.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GenerateOutput, InferenceError>;

    /// List installed models with metadata.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError>;

    /// Estimate the resident memory a model needs, in bytes.
    async fn estimate_memory(&self, model: &str) -> Result<u64, InferenceError>;

    /// Probe daemon health. Never fails; unreachability is a status.
    async fn health(&self) -> HealthStatus;
}

// ── Memory estimation ──

/// Multiply a byte count by a non-negative factor.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
// Model and host sizes stay far below 2^52 bytes, so the f64 round-trip is exact enough.
pub fn scale_bytes(bytes: u64, factor: f64) -> u64 {
    ((bytes as f64) * factor.max(0.0)) as u64
}

/// Parse a parameter-size label like `7B`, `8.0B`, or `70B` into billions.
fn parse_parameter_billions(label: &str) -> Option<f64> {
    let trimmed = label.trim().trim_end_matches(['b', 'B']);
    trimmed.parse::<f64>().ok().filter(|n| *n > 0.0)
}

/// Minimum resident footprint for a model of the given parameter count.
///
/// Quantized weights alone understate what inference needs (KV cache,
/// activations), so admission uses these floors.
pub fn architecture_floor_bytes(parameter_size: &str) -> u64 {
    match parse_parameter_billions(parameter_size) {
        Some(billions) if billions >= 60.0 => 12 * GIB,
        Some(billions) if billions >= 10.0 => 6 * GIB,
        _ => 4 * GIB,
    }
}

/// Estimate a model's resident footprint from its metadata.
///
/// The on-disk size is padded by `safety_factor` and floored by the
/// architecture minimum.
pub fn estimate_model_footprint(info: &ModelInfo, safety_factor: f64) -> u64 {
    scale_bytes(info.size_bytes, safety_factor).max(architecture_floor_bytes(&info.parameter_size))
}

/// Cache of per-model memory footprints keyed by model name.
///
/// Entries are recomputed wholesale on [`ModelCatalog::refresh`], which is
/// the invalidation point for stale metadata. Observed task memory can
/// overwrite an entry when it diverges significantly from the estimate.
pub struct ModelCatalog {
    client: Arc<dyn InferenceClient>,
    safety_factor: f64,
    footprints: RwLock<HashMap<String, u64>>,
}

/// Relative divergence between estimate and observation that triggers a
/// cache overwrite.
const OBSERVATION_DIVERGENCE: f64 = 0.25;

impl ModelCatalog {
    /// Create an empty catalog around a client.
    pub fn new(client: Arc<dyn InferenceClient>, safety_factor: f64) -> Self {
        Self {
            client,
            safety_factor,
            footprints: RwLock::new(HashMap::new()),
        }
    }

    /// Re-read model metadata from the daemon and rebuild the cache.
    ///
    /// Returns the number of models found. Entries for models no longer
    /// installed are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot list models.
    pub async fn refresh(&self) -> Result<usize, InferenceError> {
        let models = self.client.list_models().await?;
        let mut map = HashMap::with_capacity(models.len());
        for info in &models {
            map.insert(
                info.name.clone(),
                estimate_model_footprint(info, self.safety_factor),
            );
        }
        let count = map.len();
        *self.footprints.write().await = map;
        info!(models = count, "model footprint cache refreshed");
        Ok(count)
    }

    /// Cached footprint for a model, if present.
    pub async fn footprint_bytes(&self, model: &str) -> Option<u64> {
        self.footprints.read().await.get(model).copied()
    }

    /// Footprint for a model, probing the daemon on a cache miss.
    ///
    /// Falls back to the smallest architecture floor when the daemon
    /// cannot answer, so admission always has a number to work with.
    pub async fn footprint_or_probe(&self, model: &str) -> u64 {
        if let Some(cached) = self.footprint_bytes(model).await {
            return cached;
        }
        match self.client.estimate_memory(model).await {
            Ok(bytes) => {
                let padded = scale_bytes(bytes, self.safety_factor);
                self.footprints
                    .write()
                    .await
                    .insert(model.to_owned(), padded);
                padded
            }
            Err(e) => {
                debug!(model, error = %e, "memory probe failed, using floor");
                architecture_floor_bytes("")
            }
        }
    }

    /// Record observed task memory for a model.
    ///
    /// Overwrites the cached estimate only when the observation diverges
    /// by more than 25%. Downstream consumption of observations is
    /// deferred; this is the hook.
    pub async fn record_observed(&self, model: &str, observed_bytes: u64) {
        let mut map = self.footprints.write().await;
        let Some(current) = map.get(model).copied() else {
            return;
        };
        if current == 0 {
            return;
        }
        let diff = current.abs_diff(observed_bytes);
        if scale_bytes(current, OBSERVATION_DIVERGENCE) < diff {
            debug!(
                model,
                estimated = current,
                observed = observed_bytes,
                "observed memory diverges, updating cache"
            );
            map.insert(model.to_owned(), observed_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClient {
        models: Vec<ModelInfo>,
    }

    #[async_trait]
    impl InferenceClient for FixedClient {
        async fn generate(
            &self,
            _model: &str,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<GenerateOutput, InferenceError> {
            Ok(GenerateOutput {
                response: "{}".to_owned(),
                execution_time_ms: 1,
            })
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
            Ok(self.models.clone())
        }

        async fn estimate_memory(&self, model: &str) -> Result<u64, InferenceError> {
            self.models
                .iter()
                .find(|m| m.name == model)
                .map(|m| m.size_bytes)
                .ok_or_else(|| InferenceError::ModelUnavailable(model.to_owned()))
        }

        async fn health(&self) -> HealthStatus {
            HealthStatus {
                status: HealthState::Healthy,
                messages: vec![],
                model_count: self.models.len(),
            }
        }
    }

    fn model(name: &str, size_gib: u64, params: &str) -> ModelInfo {
        ModelInfo {
            name: name.to_owned(),
            size_bytes: size_gib * GIB,
            family: "llama".to_owned(),
            parameter_size: params.to_owned(),
            quantization: "Q4_K_M".to_owned(),
        }
    }

    #[test]
    fn test_architecture_floors() {
        assert_eq!(architecture_floor_bytes("7B"), 4 * GIB);
        assert_eq!(architecture_floor_bytes("8.0B"), 4 * GIB);
        assert_eq!(architecture_floor_bytes("13B"), 6 * GIB);
        assert_eq!(architecture_floor_bytes("70B"), 12 * GIB);
        // Unparseable labels get the smallest floor.
        assert_eq!(architecture_floor_bytes(""), 4 * GIB);
        assert_eq!(architecture_floor_bytes("unknown"), 4 * GIB);
    }

    #[test]
    fn test_footprint_uses_floor_for_small_quantized_models() {
        // 2 GiB on disk, but a 7B model still needs the 4 GiB floor.
        let info = model("llama3.1:8b", 2, "8.0B");
        assert_eq!(estimate_model_footprint(&info, 1.5), 4 * GIB);
    }

    #[test]
    fn test_footprint_uses_scaled_size_for_large_models() {
        // 40 GiB on disk × 1.5 > 12 GiB floor.
        let info = model("llama3.1:70b", 40, "70B");
        assert_eq!(estimate_model_footprint(&info, 1.5), 60 * GIB);
    }

    #[test]
    fn test_scale_bytes_clamps_negative_factor() {
        assert_eq!(scale_bytes(1000, -2.0), 0);
        assert_eq!(scale_bytes(1000, 1.5), 1500);
    }

    #[tokio::test]
    async fn test_catalog_refresh_drops_stale_entries() {
        let client = Arc::new(FixedClient {
            models: vec![model("a", 2, "7B")],
        });
        let catalog = ModelCatalog::new(client, 1.5);
        catalog.footprints.write().await.insert("gone".to_owned(), GIB);

        let count = catalog.refresh().await.expect("refresh");
        assert_eq!(count, 1);
        assert!(catalog.footprint_bytes("a").await.is_some());
        assert!(catalog.footprint_bytes("gone").await.is_none());
    }

    #[tokio::test]
    async fn test_catalog_probe_falls_back_to_floor() {
        let client = Arc::new(FixedClient { models: vec![] });
        let catalog = ModelCatalog::new(client, 1.5);
        assert_eq!(catalog.footprint_or_probe("missing").await, 4 * GIB);
    }

    #[tokio::test]
    async fn test_record_observed_only_updates_on_divergence() {
        let client = Arc::new(FixedClient {
            models: vec![model("a", 8, "13B")],
        });
        let catalog = ModelCatalog::new(client, 1.0);
        catalog.refresh().await.expect("refresh");
        let before = catalog.footprint_bytes("a").await.expect("cached");

        // Within 25% — no change.
        catalog.record_observed("a", scale_bytes(before, 1.1)).await;
        assert_eq!(catalog.footprint_bytes("a").await, Some(before));

        // Past 25% — overwritten.
        let observed = scale_bytes(before, 1.5);
        catalog.record_observed("a", observed).await;
        assert_eq!(catalog.footprint_bytes("a").await, Some(observed));
    }

    #[tokio::test]
    async fn test_record_observed_ignores_unknown_model() {
        let client = Arc::new(FixedClient { models: vec![] });
        let catalog = ModelCatalog::new(client, 1.0);
        catalog.record_observed("ghost", GIB).await;
        assert!(catalog.footprint_bytes("ghost").await.is_none());
    }

    #[test]
    fn test_inference_error_classification() {
        assert_eq!(
            InferenceError::ModelUnavailable("m".to_owned()).classify(),
            ErrorKind::AiModelUnavailable
        );
        assert_eq!(
            InferenceError::Timeout(Duration::from_secs(1)).classify(),
            ErrorKind::AiModelTimeout
        );
        assert_eq!(
            InferenceError::Overloaded { status: 429 }.classify(),
            ErrorKind::AiModelOverloaded
        );
        assert_eq!(
            InferenceError::Parse("bad json".to_owned()).classify(),
            ErrorKind::AiResponseInvalid
        );
    }
}
