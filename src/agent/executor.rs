//! Task executors.
//!
//! The scheduler drives tasks through the [`TaskExecutor`] trait so tests
//! can substitute scripted executors. The production implementation,
//! [`InferenceExecutor`], sends prompts to the inference daemon through
//! the recovery layer, under a per-model circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::TaskMetadata;
use crate::inference::{GenerateOptions, InferenceClient};
use crate::recovery::ErrorRecoveryManager;
use crate::types::{OrchestrationError, TaskKind};

/// Everything an executor needs for one invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Task being executed.
    pub task_id: Uuid,
    /// Task kind.
    pub kind: TaskKind,
    /// Prompt, model, and correlation metadata.
    pub metadata: TaskMetadata,
    /// Deadline the scheduler will enforce; executors should pass it to
    /// their own I/O so inner calls fail before the outer deadline.
    pub timeout: Duration,
    /// Cooperative cancellation signal. Long calls must observe it.
    pub cancel: CancellationToken,
}

/// Successful executor result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Raw response payload.
    pub response: String,
    /// Wall-clock execution time.
    pub execution_time_ms: u64,
}

/// Executes admitted tasks.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one task to completion, observing `ctx.cancel`.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutput, OrchestrationError>;
}

/// Breaker name for a model's inference operations.
pub fn inference_breaker_name(model: &str) -> String {
    format!("inf-{model}")
}

/// Production executor: inference through the recovery layer.
pub struct InferenceExecutor {
    client: Arc<dyn InferenceClient>,
    recovery: Arc<ErrorRecoveryManager>,
}

impl InferenceExecutor {
    /// Executor around a client and recovery manager.
    pub fn new(client: Arc<dyn InferenceClient>, recovery: Arc<ErrorRecoveryManager>) -> Self {
        Self { client, recovery }
    }
}

#[async_trait]
impl TaskExecutor for InferenceExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutput, OrchestrationError> {
        match ctx.kind {
            TaskKind::HealthCheck => {
                let health = self.client.health().await;
                let response = serde_json::to_string(&health)
                    .map_err(|e| OrchestrationError::unknown(e.to_string()))?;
                Ok(ExecutionOutput {
                    response,
                    execution_time_ms: 0,
                })
            }
            TaskKind::FileAnalysis | TaskKind::BatchAnalysis => {
                let model = ctx.metadata.model.clone();
                let prompt = ctx.metadata.prompt.clone();
                if model.is_empty() || prompt.is_empty() {
                    return Err(OrchestrationError::validation(
                        "inference task requires a model and a prompt",
                    ));
                }
                let options = GenerateOptions {
                    timeout: ctx.timeout,
                    format_json: true,
                    ..GenerateOptions::default()
                };
                let breaker = inference_breaker_name(&model);
                let client = Arc::clone(&self.client);
                let output = self
                    .recovery
                    .execute_with_recovery(
                        &breaker,
                        || {
                            let client = Arc::clone(&client);
                            let model = model.clone();
                            let prompt = prompt.clone();
                            let options = options.clone();
                            async move {
                                client
                                    .generate(&model, &prompt, &options)
                                    .await
                                    .map_err(OrchestrationError::from)
                            }
                        },
                        &ctx.cancel,
                    )
                    .await?;
                Ok(ExecutionOutput {
                    response: output.response,
                    execution_time_ms: output.execution_time_ms,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::inference::{GenerateOutput, HealthState, HealthStatus, InferenceError, ModelInfo};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedClient {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn generate(
            &self,
            _model: &str,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<GenerateOutput, InferenceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            if n <= self.fail_first {
                Err(InferenceError::Overloaded { status: 503 })
            } else {
                Ok(GenerateOutput {
                    response: r#"{"candidates":[]}"#.to_owned(),
                    execution_time_ms: 10,
                })
            }
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
            Ok(vec![])
        }

        async fn estimate_memory(&self, model: &str) -> Result<u64, InferenceError> {
            Err(InferenceError::ModelUnavailable(model.to_owned()))
        }

        async fn health(&self) -> HealthStatus {
            HealthStatus {
                status: HealthState::Healthy,
                messages: vec![],
                model_count: 2,
            }
        }
    }

    fn ctx(kind: TaskKind, model: &str, prompt: &str) -> ExecutionContext {
        ExecutionContext {
            task_id: Uuid::new_v4(),
            kind,
            metadata: TaskMetadata {
                file_id: Some(1),
                model: model.to_owned(),
                prompt: prompt.to_owned(),
                analysis_kind: None,
                request_id: None,
            },
            timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_inference_retries_through_recovery_layer() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default()));
        let executor = InferenceExecutor::new(Arc::clone(&client) as _, recovery);

        let output = executor
            .execute(&ctx(TaskKind::FileAnalysis, "llama3.1:8b", "prompt"))
            .await
            .expect("third attempt succeeds");
        assert_eq!(output.response, r#"{"candidates":[]}"#);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_model_is_validation_error() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default()));
        let executor = InferenceExecutor::new(client, recovery);

        let error = executor
            .execute(&ctx(TaskKind::FileAnalysis, "", "prompt"))
            .await
            .expect_err("missing model");
        assert_eq!(error.kind, crate::types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_health_check_serialises_daemon_status() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default()));
        let executor = InferenceExecutor::new(client, recovery);

        let output = executor
            .execute(&ctx(TaskKind::HealthCheck, "", ""))
            .await
            .expect("health check");
        assert!(output.response.contains("healthy"));
        assert!(output.response.contains("2"));
    }

    #[test]
    fn test_breaker_name_embeds_model() {
        assert_eq!(inference_breaker_name("llama3.1:8b"), "inf-llama3.1:8b");
    }
}
