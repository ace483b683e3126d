use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::recovery::{RecoveryFailure, RecoveryResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(recover_scope),
    components(schemas(RecoveryResponse, RecoveryFailure))
)]
pub struct RecoveryApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/scopes/{scope}/recover", post(recover_scope))
}

/// Re-attach polling to every task of `scope` still marked `PROCESSING`.
///
/// Returns immediately; resumed tasks keep running in the background and
/// their progress is visible through `GET /v1/tasks`.
#[utoipa::path(
    post,
    path = "/v1/scopes/{scope}/recover",
    tag = "recovery",
    params(
        ("scope" = String, Path, description = "Chat / session id to recover")
    ),
    responses(
        (status = 200, description = "Sweep finished", body = RecoveryResponse),
        (status = 500, description = "Ledger error"),
    )
)]
pub async fn recover_scope(
    State(state): State<Arc<AppState>>,
    Path(scope): Path<String>,
) -> Result<Json<RecoveryResponse>, ServerError> {
    let report = state.recovery.run(&scope, None).await?;
    info!(scope = %scope, resumed = report.resumed.len(), "recovery requested");
    Ok(Json(RecoveryResponse::new(scope, &report)))
}
