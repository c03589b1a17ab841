use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::agent::DevinClient;
use super::api::{self, AppState, SharedState};
use super::code_jobs::CodeJobCoordinator;
use super::db::{DbHandle, FactoryDb};
use super::gateway::LlmGateway;
use super::git::{GitRepo, RepoDriver};
use super::spec_jobs::SpecJobCoordinator;
use super::state::StateTracker;
use super::ws;
use crate::config::AppConfig;

/// Build the full application router: REST API, WebSocket, request tracing.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the factory server and run until Ctrl-C.
pub async fn start_server(config: AppConfig) -> Result<()> {
    let db = FactoryDb::new(&config.db_path).context("Failed to initialize factory database")?;
    let db = DbHandle::new(db);
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let cancel = CancellationToken::new();

    let gateway = Arc::new(LlmGateway::new(&config.gateway)?);
    let repo: Arc<dyn RepoDriver> = Arc::new(GitRepo::new(config.git.clone()));
    let agent = Arc::new(DevinClient::new(config.agent.clone(), &config.git.repo_url)?);

    if repo.is_configured() {
        if let Err(e) = repo.initialize_repo().await {
            tracing::warn!(error = %e, "Git repository initialization failed; will retry per job");
        }
    } else {
        tracing::info!("Git integration not configured; code jobs will fail at repository setup");
    }

    let tracker = StateTracker::new(db.clone(), ws_tx.clone());
    let (code_jobs, queue_rx) = CodeJobCoordinator::new(
        db.clone(),
        tracker.clone(),
        repo.clone(),
        agent.clone(),
        ws_tx.clone(),
        config.worker.clone(),
        cancel.clone(),
    );
    code_jobs
        .recover()
        .await
        .context("Failed to recover code jobs from a previous run")?;
    let dispatcher = code_jobs.spawn_workers(queue_rx);
    let reaper = code_jobs.spawn_reaper();

    let spec_jobs = SpecJobCoordinator::new(
        db.clone(),
        gateway.clone(),
        gateway.clone(),
        code_jobs.clone(),
        ws_tx.clone(),
        &config.gateway,
    );

    let workers = code_jobs.clone();
    let state = Arc::new(AppState {
        db,
        ws_tx,
        tracker,
        spec_jobs,
        code_jobs,
        index: gateway,
        repo,
        agent,
    });
    let app = build_router(state, config.dev_mode);

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "Gamesmith listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .context("Server error")?;

    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "Code job dispatcher panicked");
    }
    reaper.abort();
    workers
        .shutdown()
        .await
        .context("Failed to stop code job workers")?;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
    cancel.cancel();
}
