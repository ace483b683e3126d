//! vidgen-server – entry point.
//!
//! Startup order:
//! 1. Parse server configuration from environment variables.
//! 2. Initialise structured tracing (JSON or pretty).
//! 3. Load the generation config (groups, models, relocation).
//! 4. Open the SQLite task ledger and run pending migrations.
//! 5. Wire provider client, relocator, session and orchestrator.
//! 6. Build the Axum router and serve with graceful shutdown.

mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod schemas;
mod session;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use vidgen_core::{
    GenerationConfig, HttpObjectStorage, HttpProviderClient, LocalDirStorage, MediaRelocator,
    ObjectStorage, Orchestrator, RecoverySweep,
};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::session::TokenSessionProvider;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: VIDGEN_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "vidgen-server starting");

    // ── 3. Generation config ───────────────────────────────────────────────────
    let generation = GenerationConfig::load(&cfg.generation_config_path)?;
    info!(
        path = %cfg.generation_config_path,
        groups = generation.groups.len(),
        models = generation.models.len(),
        "generation config loaded"
    );

    // ── 4. Database ────────────────────────────────────────────────────────────
    let store = SqliteStore::connect(&cfg.database_url).await?;
    info!(database_url = %cfg.database_url, "task ledger ready");

    if cfg.storage_url.is_none() {
        tokio::fs::create_dir_all(&cfg.storage_dir).await?;
    }

    // ── 5. Orchestrator ────────────────────────────────────────────────────────
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let state = build_state(cfg, generation, Arc::new(store));

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("vidgen-server stopped");
    Ok(())
}

/// Wire every collaborator of the orchestrator from configuration.
pub(crate) fn build_state(cfg: Config, generation: GenerationConfig, store: Arc<SqliteStore>) -> Arc<AppState> {
    let generation = Arc::new(generation);

    let storage: Arc<dyn ObjectStorage> = match &cfg.storage_url {
        Some(url) => {
            info!(url = %url, bucket = %cfg.storage_bucket, "using hosted object storage");
            Arc::new(HttpObjectStorage::new(
                url,
                &cfg.storage_bucket,
                cfg.storage_key.clone().unwrap_or_default(),
            ))
        }
        None => {
            let public_base = format!("{}/media", cfg.public_base_url.trim_end_matches('/'));
            info!(dir = %cfg.storage_dir, public_base = %public_base, "using local media storage");
            Arc::new(LocalDirStorage::new(&cfg.storage_dir, public_base))
        }
    };

    let session = Arc::new(TokenSessionProvider::new(cfg.api_token.clone(), cfg.session_ttl_secs));
    if session.is_open() {
        warn!("VIDGEN_API_TOKEN not set; every request runs under an anonymous session");
    }

    let relocator = Arc::new(MediaRelocator::new(generation.relocation.clone(), storage));
    let provider = Arc::new(HttpProviderClient::new(&generation));
    let orchestrator = Orchestrator::new(generation, provider, relocator, store.clone(), session.clone());
    let recovery = RecoverySweep::new(orchestrator.clone());

    Arc::new(AppState {
        config: Arc::new(cfg),
        store,
        orchestrator,
        recovery,
        session,
    })
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; polling tasks stay recoverable from the ledger");
}
