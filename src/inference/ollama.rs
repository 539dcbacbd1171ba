//! Ollama HTTP client implementation of [`InferenceClient`].
//!
//! Speaks the local daemon's `/api/generate` and `/api/tags` endpoints.
//! No streaming; the core consumes whole responses.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    architecture_floor_bytes, GenerateOptions, GenerateOutput, HealthState, HealthStatus,
    InferenceClient, InferenceError, ModelInfo,
};

/// Ollama generate request body.
#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    options: serde_json::Value,
}

/// Ollama generate response body (fields the core reads).
#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Ollama `/api/tags` response body.
#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelEntry>,
}

/// One model entry in `/api/tags`.
#[derive(Debug, Deserialize)]
struct OllamaModelEntry {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    details: OllamaModelDetails,
}

/// Model details in `/api/tags`.
#[derive(Debug, Default, Deserialize)]
struct OllamaModelDetails {
    #[serde(default)]
    family: String,
    #[serde(default)]
    parameter_size: String,
    #[serde(default)]
    quantization_level: String,
}

impl From<OllamaModelEntry> for ModelInfo {
    fn from(entry: OllamaModelEntry) -> Self {
        ModelInfo {
            name: entry.name,
            size_bytes: entry.size,
            family: entry.details.family,
            parameter_size: entry.details.parameter_size,
            quantization: entry.details.quantization_level,
        }
    }
}

/// HTTP client for a local Ollama daemon.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    /// Create a client for the daemon at `base_url`.
    ///
    /// `connect_timeout` bounds connection establishment; per-request
    /// deadlines come from [`GenerateOptions::timeout`].
    pub fn new(base_url: &str, connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn map_transport_error(e: reqwest::Error, timeout: Duration) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout(timeout)
        } else {
            InferenceError::RequestFailed(e.to_string())
        }
    }
}

/// Map a non-success HTTP status to the matching error.
fn status_to_error(status: u16, model: &str, body: &str) -> InferenceError {
    match status {
        404 => InferenceError::ModelUnavailable(model.to_owned()),
        429 | 503 => InferenceError::Overloaded { status },
        _ => InferenceError::RequestFailed(format!("HTTP {status}: {body}")),
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GenerateOutput, InferenceError> {
        let mut request_options = json!({});
        if let Some(temperature) = options.temperature {
            request_options["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            request_options["num_predict"] = json!(max_tokens);
        }

        let body = OllamaGenerateRequest {
            model: model.to_owned(),
            prompt: prompt.to_owned(),
            stream: false,
            format: options.format_json.then(|| "json".to_owned()),
            options: request_options,
        };

        let started = Instant::now();
        let resp = self
            .client
            .post(self.url("/api/generate"))
            .timeout(options.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_transport_error(e, options.timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("(body unreadable: {e})"));
            return Err(status_to_error(status, model, &text));
        }

        let parsed: OllamaGenerateResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::Parse(e.to_string()))?;

        let execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(GenerateOutput {
            response: parsed.response,
            execution_time_ms,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| InferenceError::RequestFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("(body unreadable: {e})"));
            return Err(status_to_error(status, "", &text));
        }

        let parsed: OllamaTagsResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::Parse(e.to_string()))?;
        Ok(parsed.models.into_iter().map(ModelInfo::from).collect())
    }

    async fn estimate_memory(&self, model: &str) -> Result<u64, InferenceError> {
        let models = self.list_models().await?;
        let info = models
            .into_iter()
            .find(|m| m.name == model)
            .ok_or_else(|| InferenceError::ModelUnavailable(model.to_owned()))?;
        // Loading takes at least the on-disk weights, floored by the
        // architecture minimum. Safety padding is the caller's concern.
        Ok(info
            .size_bytes
            .max(architecture_floor_bytes(&info.parameter_size)))
    }

    async fn health(&self) -> HealthStatus {
        match self.client.get(self.url("/api/tags")).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<OllamaTagsResponse>().await {
                    Ok(parsed) => HealthStatus {
                        status: HealthState::Healthy,
                        messages: vec![],
                        model_count: parsed.models.len(),
                    },
                    Err(e) => HealthStatus {
                        status: HealthState::Degraded,
                        messages: vec![format!("tag listing unparseable: {e}")],
                        model_count: 0,
                    },
                }
            }
            Ok(resp) => HealthStatus {
                status: HealthState::Degraded,
                messages: vec![format!("daemon answered HTTP {}", resp.status())],
                model_count: 0,
            },
            Err(e) => HealthStatus {
                status: HealthState::Unreachable,
                messages: vec![format!("daemon unreachable: {e}")],
                model_count: 0,
            },
        }
    }
}
