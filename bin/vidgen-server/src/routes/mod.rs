//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - middleware layers (CORS, per-request trace id)
//! - optional Swagger UI / OpenAPI document (`VIDGEN_ENABLE_SWAGGER=false` disables it)
//! - health route
//! - `/v1` generation, task, session and recovery routes
//! - `/media` static files when relocated media is stored locally

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::{middleware, Router};
use tower::ServiceBuilder;
use tower_http::services::ServeDir;
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .nest("/v1", v1::router());

    if state.config.enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()));
    }

    if state.config.storage_url.is_none() {
        app = app.nest_service("/media", ServeDir::new(&state.config.storage_dir));
    }

    app
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(state.clone())))
        .layer(middleware::from_fn_with_state(state.clone(), trace::trace_middleware))
        .with_state(state)
}
