//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use vidgen_core::{Orchestrator, RecoverySweep};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::session::TokenSessionProvider;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Durable task ledger; also handed to the orchestrator.
    pub store: Arc<SqliteStore>,
    /// The process-wide generation orchestrator.
    pub orchestrator: Orchestrator,
    pub recovery: RecoverySweep,
    pub session: Arc<TokenSessionProvider>,
}
