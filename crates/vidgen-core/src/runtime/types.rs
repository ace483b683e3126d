use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::config::ModelSpec;
use crate::ledger::LedgerError;
use crate::provider::ProviderError;

/// Stable error codes reported in [`GenerationResult::error_code`].
pub mod codes {
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const UNKNOWN_MODEL: &str = "UNKNOWN_MODEL";
    pub const UNKNOWN_GROUP: &str = "UNKNOWN_GROUP";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
    pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";
    pub const ALREADY_POLLING: &str = "ALREADY_POLLING";
    pub const NOT_IN_PROGRESS: &str = "NOT_IN_PROGRESS";
    pub const LEDGER_ERROR: &str = "LEDGER_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Persisted lifecycle state of a generation task.
///
/// Transitions only `Processing → Finish` or `Processing → Fail`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Processing,
    Finish,
    Fail,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finish | TaskStatus::Fail)
    }
}

/// Caller input for one generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Recovery scope, e.g. the chat or session the request belongs to.
    pub scope: String,
    pub prompt: String,
    /// Provider-specific parameters forwarded verbatim (size, duration, ...).
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(scope: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            prompt: prompt.into(),
            input: serde_json::Map::new(),
        }
    }
}

/// The durable record of one provider task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub task_id: String,
    pub request_id: Option<String>,
    pub scope: String,
    pub model_id: String,
    pub group: String,
    pub prompt: String,
    pub status: TaskStatus,
    /// 0–100, never decreasing while `Processing`.
    pub progress: u8,
    pub media_url: Option<String>,
    pub cover_url: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub poll_count: u32,
    pub total_time_ms: u64,
}

impl GenerationTask {
    /// A freshly created task, as recorded right after the provider accepted it.
    pub fn processing(
        task_id: impl Into<String>,
        request_id: Option<String>,
        request: &GenerationRequest,
        model: &ModelSpec,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            request_id,
            scope: request.scope.clone(),
            model_id: model.id.clone(),
            group: model.group.clone(),
            prompt: request.prompt.clone(),
            status: TaskStatus::Processing,
            progress: 0,
            media_url: None,
            cover_url: None,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
            finished_at: None,
            poll_count: 0,
            total_time_ms: 0,
        }
    }

    /// Milliseconds since the task was created.
    pub fn age_ms(&self) -> u64 {
        (Utc::now() - self.created_at).num_milliseconds().max(0) as u64
    }
}

/// Status change forwarded to progress callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskUpdate {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub media_url: Option<String>,
    pub error_message: Option<String>,
}

impl TaskUpdate {
    pub fn processing(task_id: &str, progress: u8) -> Self {
        Self {
            task_id: task_id.to_owned(),
            status: TaskStatus::Processing,
            progress,
            media_url: None,
            error_message: None,
        }
    }
}

/// Progress callback. Invoked synchronously; must not block.
pub type ProgressFn = Arc<dyn Fn(&TaskUpdate) + Send + Sync>;

/// Orchestration failures. Each maps to a stable [`codes`] value.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("authentication required")]
    AuthRequired,

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown provider group: {0}")]
    UnknownGroup(String),

    #[error("task creation failed: {0}")]
    Creation(#[source] ProviderError),

    #[error("generation failed [{code}]: {message}")]
    Provider { code: String, message: String },

    #[error("no terminal status after {polls} polls ({elapsed_ms} ms)")]
    Timeout { polls: u32, elapsed_ms: u64 },

    #[error("task {0} is already being polled")]
    AlreadyPolling(String),

    #[error("task {0} is not in progress")]
    NotInProgress(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("generation worker stopped: {0}")]
    Worker(String),
}

impl GenerationError {
    pub fn code(&self) -> String {
        match self {
            GenerationError::AuthRequired => codes::AUTH_REQUIRED.to_owned(),
            GenerationError::UnknownModel(_) => codes::UNKNOWN_MODEL.to_owned(),
            GenerationError::UnknownGroup(_) => codes::UNKNOWN_GROUP.to_owned(),
            GenerationError::Creation(e) => e.code(),
            GenerationError::Provider { code, .. } => code.clone(),
            GenerationError::Timeout { .. } => codes::TIMEOUT.to_owned(),
            GenerationError::AlreadyPolling(_) => codes::ALREADY_POLLING.to_owned(),
            GenerationError::NotInProgress(_) => codes::NOT_IN_PROGRESS.to_owned(),
            GenerationError::Ledger(_) => codes::LEDGER_ERROR.to_owned(),
            GenerationError::Worker(_) => codes::INTERNAL.to_owned(),
        }
    }

    /// Failures that would repeat for every item of a stream.
    pub fn aborts_stream(&self) -> bool {
        matches!(
            self,
            GenerationError::AuthRequired
                | GenerationError::UnknownModel(_)
                | GenerationError::UnknownGroup(_)
        )
    }
}

/// Terminal outcome of one generation as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    /// `None` when the request failed before the provider assigned an id.
    pub task_id: Option<String>,
    pub model_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub media_url: Option<String>,
    pub cover_url: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub poll_count: u32,
    pub total_time_ms: u64,
}

impl GenerationResult {
    /// Failure before a provider task existed (admission or creation).
    pub fn rejected(model_id: &str, error: &GenerationError) -> Self {
        Self {
            task_id: None,
            model_id: model_id.to_owned(),
            status: TaskStatus::Fail,
            progress: 0,
            media_url: None,
            cover_url: None,
            error_code: Some(error.code()),
            error_message: Some(error.to_string()),
            poll_count: 0,
            total_time_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Finish
    }

    /// The callback form of this terminal result.
    pub fn to_update(&self) -> Option<TaskUpdate> {
        Some(TaskUpdate {
            task_id: self.task_id.clone()?,
            status: self.status,
            progress: self.progress,
            media_url: self.media_url.clone(),
            error_message: self.error_message.clone(),
        })
    }
}
