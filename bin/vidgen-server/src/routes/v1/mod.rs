pub mod generations;
pub mod recovery;
pub mod session;
pub mod tasks;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;

/// Routes nested under `/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(generations::router())
        .merge(recovery::router())
        .merge(session::router())
        .merge(tasks::router())
}

#[derive(OpenApi)]
#[openapi()]
pub struct V1Api;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut doc = V1Api::openapi();
    doc.merge(generations::GenerationsApi::openapi());
    doc.merge(recovery::RecoveryApi::openapi());
    doc.merge(session::SessionApi::openapi());
    doc.merge(tasks::TasksApi::openapi());
    doc
}
