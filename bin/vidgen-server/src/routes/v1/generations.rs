//! Generation endpoints: single-shot and streamed (Server-Sent Events).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};
use utoipa::OpenApi;
use vidgen_core::{codes, StreamEvent};

use crate::error::ServerError;
use crate::schemas::v1::generation::{
    GenerateRequest, GenerateStreamRequest, GenerationResponse, MAX_PROMPT_CHARS, MAX_STREAM_COUNT,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(generate, generate_stream),
    components(schemas(GenerateRequest, GenerateStreamRequest, GenerationResponse))
)]
pub struct GenerationsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generations", post(generate))
        .route("/generations/stream", post(generate_stream))
}

/// Run one generation and return its terminal result.
///
/// Provider-side failures (quota, content filter, timeout) are reported in
/// the body with HTTP 200; only a missing session maps to 401.
#[utoipa::path(
    post,
    path = "/v1/generations",
    tag = "generations",
    request_body = GenerateRequest,
    responses(
        (status = 200, description = "Terminal generation result", body = GenerationResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "No valid session"),
    )
)]
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerationResponse>, ServerError> {
    validate_request(&state, &req)?;

    let result = state
        .orchestrator
        .generate(&req.model_id, &req.to_core(), None)
        .await;
    if result.error_code.as_deref() == Some(codes::AUTH_REQUIRED) {
        return Err(ServerError::Unauthorized(
            result.error_message.unwrap_or_else(|| "authentication required".into()),
        ));
    }

    info!(model_id = %req.model_id, status = %result.status, "generation finished");
    Ok(Json(result.into()))
}

/// Run `count` generations sequentially, streaming `progress` events and a
/// final `complete` (or `error`) event.
#[utoipa::path(
    post,
    path = "/v1/generations/stream",
    tag = "generations",
    request_body = GenerateStreamRequest,
    responses(
        (status = 200, description = "text/event-stream of progress, complete and error events"),
        (status = 400, description = "Invalid request"),
    )
)]
pub async fn generate_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateStreamRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    validate_request(&state, &req.request)?;
    validate_count(req.count)?;

    let handle = state
        .orchestrator
        .generate_stream(&req.request.model_id, req.request.to_core(), req.count);
    let stream = UnboundedReceiverStream::new(handle).map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &StreamEvent) -> Event {
    let sse = Event::default().event(event.name());
    match sse.clone().json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!(error = %e, "failed to encode stream event");
            sse.data("{}")
        }
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

fn validate_request(state: &AppState, req: &GenerateRequest) -> Result<(), ServerError> {
    if req.model_id.trim().is_empty() {
        return Err(ServerError::BadRequest("model_id must not be empty".into()));
    }
    if state.orchestrator.config().model(&req.model_id).is_none() {
        return Err(ServerError::BadRequest(format!("unknown model '{}'", req.model_id)));
    }
    if req.scope.trim().is_empty() {
        return Err(ServerError::BadRequest("scope must not be empty".into()));
    }
    validate_prompt(&req.prompt)
}

fn validate_prompt(prompt: &str) -> Result<(), ServerError> {
    if prompt.trim().is_empty() {
        return Err(ServerError::BadRequest("prompt must not be empty".into()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ServerError::BadRequest(format!(
            "prompt exceeds {MAX_PROMPT_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_count(count: usize) -> Result<(), ServerError> {
    if !(1..=MAX_STREAM_COUNT).contains(&count) {
        return Err(ServerError::BadRequest(format!(
            "count must be between 1 and {MAX_STREAM_COUNT}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_validation() {
        assert!(validate_prompt("a red fox in snow").is_ok());
        assert!(matches!(validate_prompt("   "), Err(ServerError::BadRequest(_))));
        let long = "x".repeat(MAX_PROMPT_CHARS + 1);
        assert!(matches!(validate_prompt(&long), Err(ServerError::BadRequest(_))));
    }

    #[test]
    fn count_validation() {
        assert!(validate_count(1).is_ok());
        assert!(validate_count(MAX_STREAM_COUNT).is_ok());
        assert!(validate_count(0).is_err());
        assert!(validate_count(MAX_STREAM_COUNT + 1).is_err());
    }
}
