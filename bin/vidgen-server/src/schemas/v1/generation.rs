use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use vidgen_core::{GenerationRequest, GenerationResult};

pub const MAX_PROMPT_CHARS: usize = 4_000;
pub const MAX_STREAM_COUNT: usize = 10;

#[derive(Debug, Deserialize, ToSchema)]
pub struct GenerateRequest {
    /// Configured model id, e.g. `"cogvideox-flash"`.
    pub model_id: String,
    /// Recovery scope (chat / session id) the task is filed under.
    pub scope: String,
    pub prompt: String,
    /// Provider-specific parameters forwarded verbatim.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub input: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GenerateStreamRequest {
    #[serde(flatten)]
    pub request: GenerateRequest,
    /// Number of sequential generations (1–10).
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

impl GenerateRequest {
    pub fn to_core(&self) -> GenerationRequest {
        GenerationRequest {
            scope: self.scope.clone(),
            prompt: self.prompt.clone(),
            input: self.input.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GenerationResponse {
    pub task_id: Option<String>,
    pub model_id: String,
    /// `FINISH` or `FAIL`.
    pub status: String,
    pub progress: u8,
    pub media_url: Option<String>,
    pub cover_url: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub poll_count: u32,
    pub total_time_ms: u64,
}

impl From<GenerationResult> for GenerationResponse {
    fn from(result: GenerationResult) -> Self {
        Self {
            status: result.status.to_string(),
            task_id: result.task_id,
            model_id: result.model_id,
            progress: result.progress,
            media_url: result.media_url,
            cover_url: result.cover_url,
            error_code: result.error_code,
            error_message: result.error_message,
            poll_count: result.poll_count,
            total_time_ms: result.total_time_ms,
        }
    }
}
