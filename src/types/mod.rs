// Shared data model for the orchestration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a task does when admitted to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Run one inference pass over a single file.
    FileAnalysis,
    /// Run inference over a batch of files in one prompt.
    BatchAnalysis,
    /// Probe the inference daemon without touching user files.
    HealthCheck,
}

impl TaskKind {
    /// String form stored in task metadata and SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileAnalysis => "file-analysis",
            Self::BatchAnalysis => "batch-analysis",
            Self::HealthCheck => "health-check",
        }
    }

    /// Whether this kind performs model inference (and therefore must carry
    /// a non-zero memory estimate).
    pub fn requires_inference(&self) -> bool {
        matches!(self, Self::FileAnalysis | Self::BatchAnalysis)
    }
}

/// Scheduling priority. Lower ordinal is more urgent; the derived `Ord`
/// therefore sorts `Critical` first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Must run before anything else (health probes during degradation).
    Critical,
    /// Interactive user requests.
    High,
    /// Default for background requests.
    Normal,
    /// Deferred work.
    Low,
    /// Opportunistic work, runs only when nothing else is queued.
    Background,
}

impl TaskPriority {
    /// Ordinal used as the primary heap key (0 = most urgent).
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Background => 4,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => f.write_str("critical"),
            Self::High => f.write_str("high"),
            Self::Normal => f.write_str("normal"),
            Self::Low => f.write_str("low"),
            Self::Background => f.write_str("background"),
        }
    }
}

/// Task lifecycle state.
///
/// `Queued → Running → {Completed|Failed|Cancelled|TimedOut}`, plus the
/// direct `Queued → Cancelled` edge. Terminal states never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Waiting in the ready-queue.
    Queued,
    /// Admitted to a slot, executor in flight.
    Running,
    /// Executor returned a result.
    Completed,
    /// Executor returned an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
    /// Timeout expired before the executor finished.
    TimedOut,
}

impl TaskState {
    /// Whether the state is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// String form used in events and SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed-out",
        }
    }
}

/// The kind of analysis a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisKind {
    /// Propose better filenames.
    RenameSuggestions,
    /// Assign the file to a category.
    Classification,
    /// Summarise file content.
    ContentSummary,
    /// Extract structured metadata fields.
    MetadataExtraction,
}

impl AnalysisKind {
    /// String form used in prompts, events, and SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RenameSuggestions => "rename-suggestions",
            Self::Classification => "classification",
            Self::ContentSummary => "content-summary",
            Self::MetadataExtraction => "metadata-extraction",
        }
    }

    /// Parse from the kebab-case string form.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error for unrecognised values.
    pub fn parse(s: &str) -> Result<Self, OrchestrationError> {
        match s {
            "rename-suggestions" => Ok(Self::RenameSuggestions),
            "classification" => Ok(Self::Classification),
            "content-summary" => Ok(Self::ContentSummary),
            "metadata-extraction" => Ok(Self::MetadataExtraction),
            other => Err(OrchestrationError::validation(format!(
                "unknown analysis kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of an analysis request, published with progress updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPhase {
    /// Tasks are being generated.
    Initializing,
    /// At least one task admitted; results arriving.
    Analyzing,
    /// All tasks terminal, session result emitted.
    Complete,
    /// Request aborted by emergency policy or validation.
    Error,
    /// Cancelled by the caller.
    Cancelled,
}

impl RequestPhase {
    /// Whether the phase is terminal for the request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

// ── Error taxonomy ──

/// Behavioral error classification. The recovery layer keys retry and
/// fallback decisions off this, not off concrete error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The model or daemon cannot be reached.
    AiModelUnavailable,
    /// Inference exceeded its deadline.
    AiModelTimeout,
    /// The model answered, but the payload failed to parse.
    AiResponseInvalid,
    /// The daemon reported overload (HTTP 429/503).
    AiModelOverloaded,
    /// The task cannot fit the memory budget, or the host is out of memory.
    ResourceExhaustion,
    /// Filesystem or database failure.
    IoError,
    /// Caller error; surfaced immediately, never retried.
    Validation,
    /// Anything unclassified.
    Unknown,
}

impl ErrorKind {
    /// String form used in events and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiModelUnavailable => "ai-model-unavailable",
            Self::AiModelTimeout => "ai-model-timeout",
            Self::AiResponseInvalid => "ai-response-invalid",
            Self::AiModelOverloaded => "ai-model-overloaded",
            Self::ResourceExhaustion => "resource-exhaustion",
            Self::IoError => "io-error",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the recovery layer may retry an operation failing with this
    /// kind. `Validation` and `ResourceExhaustion` are never retried;
    /// `AiResponseInvalid` yields flagged empty results instead of a retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::AiModelUnavailable
            | Self::AiModelTimeout
            | Self::AiModelOverloaded
            | Self::IoError
            | Self::Unknown => true,
            Self::Validation | Self::ResourceExhaustion | Self::AiResponseInvalid => false,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error carrying its behavioral classification.
///
/// Component boundaries exchange this type so the recovery layer and the
/// Analysis Service can act on `kind` without downcasting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct OrchestrationError {
    /// Behavioral classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl OrchestrationError {
    /// Build an error with an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Caller error; never retried.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Daemon or model unreachable.
    pub fn model_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AiModelUnavailable, message)
    }

    /// Inference deadline exceeded.
    pub fn model_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AiModelTimeout, message)
    }

    /// Unparseable model output.
    pub fn response_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AiResponseInvalid, message)
    }

    /// Memory budget exceeded.
    pub fn resource_exhaustion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhaustion, message)
    }

    /// Filesystem or database failure.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, message)
    }

    /// Unclassified failure.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Whether the recovery layer may retry this error.
    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl From<std::io::Error> for OrchestrationError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

// ── Suggestions ──

/// A validation problem detected on a suggestion candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationFlag {
    /// Candidate value is empty or whitespace.
    EmptyValue,
    /// Value contains characters illegal in filenames.
    IllegalCharacters,
    /// Value exceeds the maximum length.
    ValueTooLong,
    /// Proposed rename changes the file extension.
    ExtensionMismatch,
    /// The model response could not be parsed at all.
    ParseError,
}

impl ValidationFlag {
    /// String form persisted with the suggestion.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyValue => "empty-value",
            Self::IllegalCharacters => "illegal-characters",
            Self::ValueTooLong => "value-too-long",
            Self::ExtensionMismatch => "extension-mismatch",
            Self::ParseError => "parse-error",
        }
    }

    /// Parse from the persisted string form.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error for unrecognised values.
    pub fn parse(s: &str) -> Result<Self, OrchestrationError> {
        match s {
            "empty-value" => Ok(Self::EmptyValue),
            "illegal-characters" => Ok(Self::IllegalCharacters),
            "value-too-long" => Ok(Self::ValueTooLong),
            "extension-mismatch" => Ok(Self::ExtensionMismatch),
            "parse-error" => Ok(Self::ParseError),
            other => Err(OrchestrationError::validation(format!(
                "unknown validation flag: {other}"
            ))),
        }
    }
}

/// A scored, ranked suggestion for one (file, analysis kind) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// File the suggestion applies to.
    pub file_id: i64,
    /// Request that produced it.
    pub request_id: Uuid,
    /// What kind of analysis produced it.
    pub kind: AnalysisKind,
    /// The suggested value (new name, category, or summary text).
    pub value: String,
    /// Raw model confidence, 0–100.
    pub original_confidence: u8,
    /// Confidence after validation penalties and model prior, 0–100.
    pub adjusted_confidence: u8,
    /// Composite quality score in [0, 1], used for ranking tie-breaks.
    pub quality: f64,
    /// Model-provided reasoning for the candidate.
    pub reasoning: String,
    /// Model that produced the response.
    pub model: String,
    /// Inference wall-clock time.
    pub execution_time_ms: u64,
    /// 1-based rank within (file, kind).
    pub rank_position: u32,
    /// Whether this is the recommended candidate for its (file, kind).
    pub recommended: bool,
    /// Validation problems found on the candidate.
    pub flags: Vec<ValidationFlag>,
    /// When the suggestion was produced.
    pub created_at: DateTime<Utc>,
}
