use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::path::Path;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tracing::info;

use crate::AppState;
use crate::config::AppConfig;
use crate::uar::{
    self,
    defaults::{load_workflows, register_default_agents},
    persistence,
    runtime::{
        cancellation::CancellationRegistry,
        expression::ExpressionEngine,
        manager::{RunManager, RuntimeSettings},
    },
};

/// Wire the run store, the cancellation registry and the built-in agents
/// and workflows into a run manager.
pub async fn build_run_manager(config: &AppConfig) -> anyhow::Result<Arc<RunManager>> {
    let store = persistence::connect(&config.persistence).await?;
    let cancellation = CancellationRegistry::from_config(&config.cancellation).await?;

    let manager = RunManager::new(cancellation, store, RuntimeSettings::from(&config.runtime))
        .with_expressions(ExpressionEngine::new(config.runtime.fuel()));
    register_default_agents(&manager);

    if let Some(dir) = &config.runtime.workflows_dir {
        let loaded = load_workflows(&manager, Path::new(dir)).await?;
        info!(dir = %dir, workflows = loaded, "Workflow definitions loaded");
    }

    Ok(Arc::new(manager))
}

/// The full HTTP surface, without binding a listener.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(render_metrics))
        .nest(
            "/api/uar",
            uar::api::router().with_state(Arc::clone(&state.run_manager)),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(
    config: Arc<AppConfig>,
    metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
) -> anyhow::Result<()> {
    info!(
        name: "uar.config.loaded",
        persistence = %config.persistence.provider,
        cancellation = %config.cancellation.backend,
        default_timeout_secs = config.runtime.default_timeout_secs,
        "Configuration loaded"
    );

    let run_manager = build_run_manager(&config).await?;
    let state = AppState {
        run_manager,
        config: Arc::clone(&config),
        metrics,
    };
    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
