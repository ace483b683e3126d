use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use utoipa::OpenApi;
use vidgen_core::SessionProvider;

use crate::error::ServerError;
use crate::schemas::v1::session::{CreateSessionRequest, SessionResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(create_session, get_session, delete_session),
    components(schemas(CreateSessionRequest, SessionResponse))
)]
pub struct SessionApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/session",
        post(create_session).get(get_session).delete(delete_session),
    )
}

#[utoipa::path(
    post,
    path = "/v1/session",
    tag = "session",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session started", body = SessionResponse),
        (status = 401, description = "Invalid token"),
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionResponse>, ServerError> {
    let session = state.session.login(&req.token)?;
    Ok(Json(session.into()))
}

#[utoipa::path(
    get,
    path = "/v1/session",
    tag = "session",
    responses(
        (status = 200, description = "Current session", body = SessionResponse),
        (status = 401, description = "No valid session"),
    )
)]
pub async fn get_session(State(state): State<Arc<AppState>>) -> Result<Json<SessionResponse>, ServerError> {
    match state.session.current_session().await {
        Some(session) if !session.is_expired() => Ok(Json(session.into())),
        Some(_) => Err(ServerError::Unauthorized("session expired".into())),
        None => Err(ServerError::Unauthorized("no session".into())),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/session",
    tag = "session",
    responses(
        (status = 204, description = "Session ended"),
    )
)]
pub async fn delete_session(State(state): State<Arc<AppState>>) -> StatusCode {
    state.session.logout();
    StatusCode::NO_CONTENT
}
