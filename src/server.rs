use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::analyzer::GitHubAnalyzer;
use crate::api::{self, AppState, SharedState};
use crate::config::Config;
use crate::connections::ConnectionRegistry;
use crate::db::{DbHandle, StorytellerDb};
use crate::github::GitHubClient;
use crate::jobs::{JobContext, JobQueue};
use crate::narrative::GeminiNarrator;
use crate::ratelimit::ConnectAdmissionLimiter;
use crate::ws;

/// How often idle rate-limiter windows are swept out.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Build the full application router: API routes plus the status push
/// channel at both its plain and versioned paths.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/status", get(ws::ws_handler))
        .route("/api/v1/ws/status", get(ws::ws_handler))
        .with_state(state)
}

/// Assemble the shared state from a config. The job worker is spawned
/// here; the returned state is ready to serve.
pub fn build_state(config: Config, db: DbHandle) -> SharedState {
    let registry = Arc::new(ConnectionRegistry::new(
        config.max_total_connections,
        config.max_connections_per_user,
    ));
    let limiter = Arc::new(ConnectAdmissionLimiter::new(
        config.ws_rate_limit_window,
        config.ws_rate_limit_count,
    ));

    let github = Arc::new(GitHubClient::new(
        config.github_token.clone().unwrap_or_default(),
    ));
    let narrator = GeminiNarrator::new(config.gemini_api_key.clone().unwrap_or_default());
    let ctx = Arc::new(JobContext {
        db: db.clone(),
        registry: Arc::clone(&registry),
        analyzer: Arc::new(GitHubAnalyzer::new(github)),
        narrator: Arc::new(narrator),
    });
    let jobs = JobQueue::start(ctx);

    Arc::new(AppState {
        db,
        registry,
        limiter,
        jobs,
        config,
    })
}

/// Start the server and run until interrupted.
pub async fn start_server(config: Config) -> Result<()> {
    if config.github_token.is_none() {
        anyhow::bail!("GITHUB_TOKEN environment variable is not set");
    }
    if config.gemini_api_key.is_none() {
        anyhow::bail!("GEMINI_API_KEY environment variable is not set");
    }

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(
        StorytellerDb::new(&config.db_path).context("Failed to initialize database")?,
    );

    let dev_mode = config.dev_mode;
    let addr = config.bind_addr();
    let state = build_state(config, db);

    spawn_limiter_sweep(Arc::clone(&state.limiter));

    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("storyteller listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

/// Periodically evict idle rate-limiter windows so the per-identity map
/// stays bounded by the set of recently active users.
fn spawn_limiter_sweep(limiter: Arc<ConnectAdmissionLimiter>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            limiter.evict_stale();
        }
    });
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutting down...");
}
