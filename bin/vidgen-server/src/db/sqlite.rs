//! SQLite implementation of [`TaskLedger`].
//!
//! Migrations are embedded with `sqlx::migrate!("./migrations")` (resolved
//! relative to `CARGO_MANIFEST_DIR` at compile time) and run by
//! [`SqliteStore::connect`].
//!
//! Runtime-checked `sqlx::query` is used so no `DATABASE_URL` is needed at
//! compile time. Timestamps are stored as RFC 3339 strings.
//!
//! Terminal transitions carry `WHERE status = 'PROCESSING'`, so a row that
//! reached `FINISH` or `FAIL` is never rewritten, and progress is written
//! with `MAX(progress, ?)`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::warn;
use vidgen_core::{
    GenerationTask, LedgerError, TaskCompletion, TaskFailure, TaskLedger, TaskStatus,
};

const COLUMNS: &str = "task_id, request_id, scope, model_id, group_name, prompt, status, progress, \
     media_url, cover_url, error_code, error_message, created_at, finished_at, poll_count, total_time_ms";

/// SQLite-backed task ledger.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL, e.g. `"sqlite://vidgen.db"` or
    /// `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to `:memory:` opens a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    request_id: Option<String>,
    scope: String,
    model_id: String,
    group_name: String,
    prompt: String,
    status: String,
    progress: i64,
    media_url: Option<String>,
    cover_url: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    created_at: String,
    finished_at: Option<String>,
    poll_count: i64,
    total_time_ms: i64,
}

impl TaskRow {
    fn into_task(self) -> Result<GenerationTask, LedgerError> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|_| LedgerError::Backend(format!("task {}: unknown status '{}'", self.task_id, self.status).into()))?;
        let created_at = parse_time(&self.task_id, &self.created_at).unwrap_or_else(Utc::now);
        let finished_at = self
            .finished_at
            .as_deref()
            .and_then(|raw| parse_time(&self.task_id, raw));
        Ok(GenerationTask {
            task_id: self.task_id,
            request_id: self.request_id,
            scope: self.scope,
            model_id: self.model_id,
            group: self.group_name,
            prompt: self.prompt,
            status,
            progress: self.progress.clamp(0, 100) as u8,
            media_url: self.media_url,
            cover_url: self.cover_url,
            error_code: self.error_code,
            error_message: self.error_message,
            created_at,
            finished_at,
            poll_count: self.poll_count.max(0) as u32,
            total_time_ms: self.total_time_ms.max(0) as u64,
        })
    }
}

fn parse_time(task_id: &str, raw: &str) -> Option<DateTime<Utc>> {
    match raw.parse::<DateTime<Utc>>() {
        Ok(at) => Some(at),
        Err(e) => {
            warn!(task_id, raw, error = %e, "failed to parse task timestamp");
            None
        }
    }
}

fn rows_into_tasks(rows: Vec<TaskRow>) -> Result<Vec<GenerationTask>, LedgerError> {
    rows.into_iter().map(TaskRow::into_task).collect()
}

#[async_trait]
impl TaskLedger for SqliteStore {
    async fn create(&self, task: &GenerationTask) -> Result<(), LedgerError> {
        let result = sqlx::query(&format!(
            "INSERT INTO generation_tasks ({COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ))
        .bind(&task.task_id)
        .bind(&task.request_id)
        .bind(&task.scope)
        .bind(&task.model_id)
        .bind(&task.group)
        .bind(&task.prompt)
        .bind(task.status.as_ref())
        .bind(i64::from(task.progress))
        .bind(&task.media_url)
        .bind(&task.cover_url)
        .bind(&task.error_code)
        .bind(&task.error_message)
        .bind(task.created_at.to_rfc3339())
        .bind(task.finished_at.map(|at| at.to_rfc3339()))
        .bind(i64::from(task.poll_count))
        .bind(task.total_time_ms as i64)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(LedgerError::Duplicate(task.task_id.clone()))
            }
            Err(e) => Err(LedgerError::backend(e)),
        }
    }

    async fn update_progress(&self, task_id: &str, progress: u8, poll_count: u32) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE generation_tasks SET progress = MAX(progress, ?1), poll_count = MAX(poll_count, ?2) \
             WHERE task_id = ?3 AND status = 'PROCESSING'",
        )
        .bind(i64::from(progress.min(100)))
        .bind(i64::from(poll_count))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(LedgerError::backend)?;

        if result.rows_affected() == 0 && self.get(task_id).await?.is_none() {
            return Err(LedgerError::NotFound(task_id.to_owned()));
        }
        Ok(())
    }

    async fn mark_complete(&self, task_id: &str, completion: &TaskCompletion) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "UPDATE generation_tasks \
             SET status = 'FINISH', progress = 100, media_url = ?1, cover_url = ?2, \
                 poll_count = ?3, total_time_ms = ?4, finished_at = ?5 \
             WHERE task_id = ?6 AND status = 'PROCESSING'",
        )
        .bind(&completion.media_url)
        .bind(&completion.cover_url)
        .bind(i64::from(completion.poll_count))
        .bind(completion.total_time_ms as i64)
        .bind(completion.finished_at.to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(LedgerError::backend)?;
        self.transitioned(task_id, result.rows_affected()).await
    }

    async fn mark_failed(&self, task_id: &str, failure: &TaskFailure) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "UPDATE generation_tasks \
             SET status = 'FAIL', error_code = ?1, error_message = ?2, \
                 poll_count = ?3, total_time_ms = ?4, finished_at = ?5 \
             WHERE task_id = ?6 AND status = 'PROCESSING'",
        )
        .bind(&failure.error_code)
        .bind(&failure.error_message)
        .bind(i64::from(failure.poll_count))
        .bind(failure.total_time_ms as i64)
        .bind(failure.finished_at.to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(LedgerError::backend)?;
        self.transitioned(task_id, result.rows_affected()).await
    }

    async fn find_incomplete(&self, scope: &str) -> Result<Vec<GenerationTask>, LedgerError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM generation_tasks \
             WHERE scope = ?1 AND status = 'PROCESSING' ORDER BY created_at ASC"
        ))
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::backend)?;
        rows_into_tasks(rows)
    }

    async fn get(&self, task_id: &str) -> Result<Option<GenerationTask>, LedgerError> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM generation_tasks WHERE task_id = ?1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::backend)?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn list(&self, scope: Option<&str>) -> Result<Vec<GenerationTask>, LedgerError> {
        let rows: Vec<TaskRow> = if let Some(scope) = scope {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM generation_tasks WHERE scope = ?1 ORDER BY created_at DESC"
            ))
            .bind(scope)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM generation_tasks ORDER BY created_at DESC"
            ))
            .fetch_all(&self.pool)
            .await
        }
        .map_err(LedgerError::backend)?;
        rows_into_tasks(rows)
    }
}

impl SqliteStore {
    /// `Ok(true)` when the guarded update hit the row, `Ok(false)` when the
    /// row exists but is already terminal.
    async fn transitioned(&self, task_id: &str, rows_affected: u64) -> Result<bool, LedgerError> {
        if rows_affected > 0 {
            return Ok(true);
        }
        match self.get(task_id).await? {
            Some(_) => Ok(false),
            None => Err(LedgerError::NotFound(task_id.to_owned())),
        }
    }
}
