//! Persistence contract consumed by the orchestration core.
//!
//! The [`Store`] trait covers exactly what the core needs: file records to
//! analyse, persisted suggestions, analysis sessions for the UI's history
//! view, and model preferences. [`sqlite::SqliteStore`] is the production
//! implementation; tests use its `open_in_memory()` constructor.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{OrchestrationError, RequestPhase, Suggestion};

/// A file known to the assistant, as scanned by the directory worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Row identifier.
    pub id: i64,
    /// Absolute path.
    pub path: String,
    /// File name including extension.
    pub name: String,
    /// Lowercase extension without the dot; empty when absent.
    pub extension: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Modification time, epoch seconds.
    pub modified_at: i64,
    /// Absolute path of the containing directory.
    pub parent_dir: String,
    /// Path relative to the scanned root, when known.
    pub relative_path: Option<String>,
}

impl FileRecord {
    /// Size in whole megabytes, rounded down.
    pub fn size_mb(&self) -> u64 {
        self.size_bytes / (1024 * 1024)
    }
}

/// Persisted model preferences seeding the analysis routing table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPreferences {
    /// Preferred model for rename/classification work.
    pub main_model: Option<String>,
    /// Preferred model for summary/metadata work.
    pub sub_model: Option<String>,
    /// Inference daemon endpoint override.
    pub endpoint: Option<String>,
}

/// One analysis request's persisted lifecycle row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSession {
    /// Request identifier.
    pub request_id: Uuid,
    /// Current phase.
    pub phase: RequestPhase,
    /// Total tasks generated.
    pub total: usize,
    /// Tasks completed successfully.
    pub successful: usize,
    /// Tasks failed.
    pub failed: usize,
    /// When the request was accepted.
    pub started_at: DateTime<Utc>,
    /// When the request reached a terminal phase.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored row failed to decode into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for OrchestrationError {
    fn from(e: StoreError) -> Self {
        OrchestrationError::io(e.to_string())
    }
}

/// Persistence operations the core depends on.
///
/// Implementations are expected to apply their own transactional locking;
/// multi-row writes such as [`Store::save_suggestions`] must be atomic.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch file records by identifier. Unknown identifiers are skipped.
    async fn files_by_ids(&self, ids: &[i64]) -> Result<Vec<FileRecord>, StoreError>;

    /// Fetch all file records under a root path.
    async fn files_by_root_path(&self, root: &str) -> Result<Vec<FileRecord>, StoreError>;

    /// Insert or refresh a file record, returning its identifier.
    async fn upsert_file(&self, record: &FileRecord) -> Result<i64, StoreError>;

    /// Read persisted model preferences. Missing preferences are `None`.
    async fn model_preferences(&self) -> Result<ModelPreferences, StoreError>;

    /// Persist a batch of suggestions atomically.
    async fn save_suggestions(&self, suggestions: &[Suggestion]) -> Result<(), StoreError>;

    /// Read back all suggestions for a request, ordered by file, kind, rank.
    async fn suggestions_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<Suggestion>, StoreError>;

    /// Create the session row for a newly accepted request.
    async fn create_analysis_session(&self, session: &AnalysisSession) -> Result<(), StoreError>;

    /// Update the session row with current counters and phase.
    async fn update_analysis_session(&self, session: &AnalysisSession) -> Result<(), StoreError>;
}
