//! Read-only views of the task ledger.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;
use vidgen_core::TaskLedger;

use crate::error::ServerError;
use crate::schemas::v1::task::{TaskResponse, TaskScopeQuery};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(list_tasks, get_task),
    components(schemas(TaskResponse, TaskScopeQuery))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
}

#[utoipa::path(
    get,
    path = "/v1/tasks",
    tag = "tasks",
    params(TaskScopeQuery),
    responses(
        (status = 200, description = "Tasks listed, newest first", body = [TaskResponse]),
        (status = 500, description = "Ledger error"),
    )
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TaskScopeQuery>,
) -> Result<Json<Vec<TaskResponse>>, ServerError> {
    let tasks = state.store.list(q.scope.as_deref()).await?;
    Ok(Json(tasks.into_iter().map(TaskResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(
        ("id" = String, Path, description = "Provider task id")
    ),
    responses(
        (status = 200, description = "Task retrieved", body = TaskResponse),
        (status = 404, description = "Task not found"),
        (status = 500, description = "Ledger error"),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ServerError> {
    let task = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    Ok(Json(task.into()))
}
