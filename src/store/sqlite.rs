//! SQLite-backed [`Store`] implementation.
//!
//! The schema is bootstrapped on open so a fresh database is usable
//! immediately. Multi-row writes run inside a transaction; reads go
//! through the connection pool.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::types::{AnalysisKind, RequestPhase, Suggestion, ValidationFlag};

use super::{AnalysisSession, FileRecord, ModelPreferences, Store, StoreError};

/// SQLite store. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database for tests.
    ///
    /// A single pooled connection is used so all operations see the same
    /// memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Underlying pool, for callers composing their own queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                extension TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                parent_dir TEXT NOT NULL,
                relative_path TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS suggestions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL,
                request_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                original_confidence INTEGER NOT NULL,
                adjusted_confidence INTEGER NOT NULL,
                quality REAL NOT NULL,
                reasoning TEXT NOT NULL,
                model TEXT NOT NULL,
                execution_time_ms INTEGER NOT NULL,
                rank_position INTEGER NOT NULL,
                recommended INTEGER NOT NULL,
                flags TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_suggestions_request
             ON suggestions(request_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS analysis_sessions (
                request_id TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                total INTEGER NOT NULL,
                successful INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS model_preferences (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                main_model TEXT,
                sub_model TEXT,
                endpoint TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write model preferences (single row, replacing any existing values).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_model_preferences(
        &self,
        prefs: &ModelPreferences,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO model_preferences (id, main_model, sub_model, endpoint)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                main_model = excluded.main_model,
                sub_model = excluded.sub_model,
                endpoint = excluded.endpoint",
        )
        .bind(&prefs.main_model)
        .bind(&prefs.sub_model)
        .bind(&prefs.endpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn phase_to_str(phase: RequestPhase) -> &'static str {
    match phase {
        RequestPhase::Initializing => "initializing",
        RequestPhase::Analyzing => "analyzing",
        RequestPhase::Complete => "complete",
        RequestPhase::Error => "error",
        RequestPhase::Cancelled => "cancelled",
    }
}

fn phase_from_str(s: &str) -> Result<RequestPhase, StoreError> {
    match s {
        "initializing" => Ok(RequestPhase::Initializing),
        "analyzing" => Ok(RequestPhase::Analyzing),
        "complete" => Ok(RequestPhase::Complete),
        "error" => Ok(RequestPhase::Error),
        "cancelled" => Ok(RequestPhase::Cancelled),
        other => Err(StoreError::Corrupt(format!("unknown phase: {other}"))),
    }
}

fn decode_file_row(row: &sqlx::sqlite::SqliteRow) -> Result<FileRecord, StoreError> {
    let size_bytes: i64 = row.try_get("size_bytes")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        name: row.try_get("name")?,
        extension: row.try_get("extension")?,
        size_bytes: u64::try_from(size_bytes).unwrap_or(0),
        modified_at: row.try_get("modified_at")?,
        parent_dir: row.try_get("parent_dir")?,
        relative_path: row.try_get("relative_path")?,
    })
}

fn decode_suggestion_row(row: &sqlx::sqlite::SqliteRow) -> Result<Suggestion, StoreError> {
    let request_id: String = row.try_get("request_id")?;
    let kind: String = row.try_get("kind")?;
    let flags_json: String = row.try_get("flags")?;
    let created_at: String = row.try_get("created_at")?;
    let original: i64 = row.try_get("original_confidence")?;
    let adjusted: i64 = row.try_get("adjusted_confidence")?;
    let execution_time_ms: i64 = row.try_get("execution_time_ms")?;
    let rank_position: i64 = row.try_get("rank_position")?;

    let flag_names: Vec<String> = serde_json::from_str(&flags_json)
        .map_err(|e| StoreError::Corrupt(format!("flags column: {e}")))?;
    let flags = flag_names
        .iter()
        .map(|name| {
            ValidationFlag::parse(name)
                .map_err(|e| StoreError::Corrupt(format!("flags column: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Suggestion {
        file_id: row.try_get("file_id")?,
        request_id: Uuid::parse_str(&request_id)
            .map_err(|e| StoreError::Corrupt(format!("request_id column: {e}")))?,
        kind: AnalysisKind::parse(&kind)
            .map_err(|e| StoreError::Corrupt(format!("kind column: {e}")))?,
        value: row.try_get("value")?,
        original_confidence: u8::try_from(original).unwrap_or(0),
        adjusted_confidence: u8::try_from(adjusted).unwrap_or(0),
        quality: row.try_get("quality")?,
        reasoning: row.try_get("reasoning")?,
        model: row.try_get("model")?,
        execution_time_ms: u64::try_from(execution_time_ms).unwrap_or(0),
        rank_position: u32::try_from(rank_position).unwrap_or(u32::MAX),
        recommended: row.try_get("recommended")?,
        flags,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| StoreError::Corrupt(format!("created_at column: {e}")))?
            .with_timezone(&Utc),
    })
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn files_by_ids(&self, ids: &[i64]) -> Result<Vec<FileRecord>, StoreError> {
        // SQLite has no array binds; fetch individually. Id sets are small
        // (bounded by the generator's batch size).
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT * FROM files WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                records.push(decode_file_row(&row)?);
            }
        }
        Ok(records)
    }

    async fn files_by_root_path(&self, root: &str) -> Result<Vec<FileRecord>, StoreError> {
        let prefix = if root.ends_with('/') {
            root.to_owned()
        } else {
            format!("{root}/")
        };
        let pattern = format!("{prefix}%");
        let rows = sqlx::query("SELECT * FROM files WHERE path LIKE ?1 ORDER BY path")
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_file_row).collect()
    }

    async fn upsert_file(&self, record: &FileRecord) -> Result<i64, StoreError> {
        let size_bytes = i64::try_from(record.size_bytes).unwrap_or(i64::MAX);
        let row = sqlx::query(
            "INSERT INTO files
                (path, name, extension, size_bytes, modified_at, parent_dir, relative_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(path) DO UPDATE SET
                name = excluded.name,
                extension = excluded.extension,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                parent_dir = excluded.parent_dir,
                relative_path = excluded.relative_path
             RETURNING id",
        )
        .bind(&record.path)
        .bind(&record.name)
        .bind(&record.extension)
        .bind(size_bytes)
        .bind(record.modified_at)
        .bind(&record.parent_dir)
        .bind(&record.relative_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn model_preferences(&self) -> Result<ModelPreferences, StoreError> {
        let row = sqlx::query("SELECT main_model, sub_model, endpoint FROM model_preferences WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(ModelPreferences {
                main_model: row.try_get("main_model")?,
                sub_model: row.try_get("sub_model")?,
                endpoint: row.try_get("endpoint")?,
            }),
            None => Ok(ModelPreferences::default()),
        }
    }

    async fn save_suggestions(&self, suggestions: &[Suggestion]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for s in suggestions {
            let flag_names: Vec<&str> = s.flags.iter().map(ValidationFlag::as_str).collect();
            let flags_json = serde_json::to_string(&flag_names)
                .map_err(|e| StoreError::Corrupt(format!("flags encode: {e}")))?;
            sqlx::query(
                "INSERT INTO suggestions
                    (file_id, request_id, kind, value, original_confidence,
                     adjusted_confidence, quality, reasoning, model,
                     execution_time_ms, rank_position, recommended, flags, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )
            .bind(s.file_id)
            .bind(s.request_id.to_string())
            .bind(s.kind.as_str())
            .bind(&s.value)
            .bind(i64::from(s.original_confidence))
            .bind(i64::from(s.adjusted_confidence))
            .bind(s.quality)
            .bind(&s.reasoning)
            .bind(&s.model)
            .bind(i64::try_from(s.execution_time_ms).unwrap_or(i64::MAX))
            .bind(i64::from(s.rank_position))
            .bind(s.recommended)
            .bind(&flags_json)
            .bind(s.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn suggestions_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<Suggestion>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM suggestions WHERE request_id = ?1
             ORDER BY file_id, kind, rank_position",
        )
        .bind(request_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_suggestion_row).collect()
    }

    async fn create_analysis_session(&self, session: &AnalysisSession) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO analysis_sessions
                (request_id, phase, total, successful, failed, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(session.request_id.to_string())
        .bind(phase_to_str(session.phase))
        .bind(i64::try_from(session.total).unwrap_or(i64::MAX))
        .bind(i64::try_from(session.successful).unwrap_or(i64::MAX))
        .bind(i64::try_from(session.failed).unwrap_or(i64::MAX))
        .bind(session.started_at.to_rfc3339())
        .bind(session.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_analysis_session(&self, session: &AnalysisSession) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE analysis_sessions SET
                phase = ?2, total = ?3, successful = ?4, failed = ?5, finished_at = ?6
             WHERE request_id = ?1",
        )
        .bind(session.request_id.to_string())
        .bind(phase_to_str(session.phase))
        .bind(i64::try_from(session.total).unwrap_or(i64::MAX))
        .bind(i64::try_from(session.successful).unwrap_or(i64::MAX))
        .bind(i64::try_from(session.failed).unwrap_or(i64::MAX))
        .bind(session.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Fetch a session row by request id (used by tests and the CLI).
impl SqliteStore {
    /// Read back one analysis session row.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn analysis_session(
        &self,
        request_id: Uuid,
    ) -> Result<Option<AnalysisSession>, StoreError> {
        let row = sqlx::query("SELECT * FROM analysis_sessions WHERE request_id = ?1")
            .bind(request_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let phase: String = row.try_get("phase")?;
        let total: i64 = row.try_get("total")?;
        let successful: i64 = row.try_get("successful")?;
        let failed: i64 = row.try_get("failed")?;
        let started_at: String = row.try_get("started_at")?;
        let finished_at: Option<String> = row.try_get("finished_at")?;
        Ok(Some(AnalysisSession {
            request_id,
            phase: phase_from_str(&phase)?,
            total: usize::try_from(total).unwrap_or(0),
            successful: usize::try_from(successful).unwrap_or(0),
            failed: usize::try_from(failed).unwrap_or(0),
            started_at: DateTime::parse_from_rfc3339(&started_at)
                .map_err(|e| StoreError::Corrupt(format!("started_at column: {e}")))?
                .with_timezone(&Utc),
            finished_at: finished_at
                .map(|t| {
                    DateTime::parse_from_rfc3339(&t)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| StoreError::Corrupt(format!("finished_at column: {e}")))
                })
                .transpose()?,
        }))
    }
}
