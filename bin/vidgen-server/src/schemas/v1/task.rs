use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use vidgen_core::GenerationTask;

#[derive(Deserialize, ToSchema, IntoParams)]
pub struct TaskScopeQuery {
    /// Restrict the listing to one scope (chat / session id).
    pub scope: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct TaskResponse {
    pub task_id: String,
    pub request_id: Option<String>,
    pub scope: String,
    pub model_id: String,
    pub group: String,
    pub prompt: String,
    /// `PROCESSING`, `FINISH` or `FAIL`.
    pub status: String,
    pub progress: u8,
    pub media_url: Option<String>,
    pub cover_url: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
    pub poll_count: u32,
    pub total_time_ms: u64,
}

impl From<GenerationTask> for TaskResponse {
    fn from(task: GenerationTask) -> Self {
        Self {
            status: task.status.to_string(),
            created_at: task.created_at.to_rfc3339(),
            finished_at: task.finished_at.map(|at| at.to_rfc3339()),
            task_id: task.task_id,
            request_id: task.request_id,
            scope: task.scope,
            model_id: task.model_id,
            group: task.group,
            prompt: task.prompt,
            progress: task.progress,
            media_url: task.media_url,
            cover_url: task.cover_url,
            error_code: task.error_code,
            error_message: task.error_message,
            poll_count: task.poll_count,
            total_time_ms: task.total_time_ms,
        }
    }
}
