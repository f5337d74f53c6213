//! Daemon startup.
//!
//! Builds the conversation store, the inference transport and the shared
//! [`AssistantService`], then serves the bus over HTTP until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::{
    config::Config,
    conversation::{ConversationStore, InMemoryConversationStore, SqliteConversationStore},
    inference::HttpTransport,
    shared_state::{AppState, AssistantService},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub async fn run_daemon(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics()?;
    cfg.print_config();

    info!("Starting assistant daemon");

    let store: Arc<dyn ConversationStore> = match SqliteConversationStore::new(&cfg.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("Failed to open conversation database: {}. Falling back to in-memory.", e);
            Arc::new(InMemoryConversationStore::new())
        }
    };

    let transport = Arc::new(HttpTransport::from_config(&cfg)?);
    let service = Arc::new(AssistantService::new(cfg.clone(), transport, store));
    let app = build_router(AppState::new(service.clone()));

    let listener = tokio::net::TcpListener::bind(cfg.api_addr()).await?;
    info!("Bus listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service))
        .await?;

    info!("Assistant daemon stopped");
    Ok(())
}

async fn shutdown_signal(service: Arc<AssistantService>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    service.shutdown(SHUTDOWN_GRACE).await;
}

pub fn build_router(state: AppState) -> axum::Router {
    use axum::{
        routing::{get, post},
        Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/streaming/start", post(crate::api::start_streaming))
        .route("/generation/stop", post(crate::api::stop_generation))
        .route("/history/clear", post(crate::api::clear_history))
        .route("/settings/reasoning", post(crate::api::set_reasoning_enabled))
        .route("/status", get(crate::api::get_status))
        .route("/signals", get(crate::api::signals))
        .route("/metrics", get(crate::metrics::get_metrics))
        .route("/healthz", get(|| async { "OK" }))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
