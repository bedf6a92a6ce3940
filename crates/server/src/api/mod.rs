use crate::config::AppState;
use crate::error::RelayError;
use crate::websocket;
use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

pub mod handlers;

pub type ApiResult<T> = Result<T, RelayError>;

/// Start the relay server
pub async fn serve(addr: &str, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Relay listening on {}", addr);

    serve_with_listener(listener, state).await
}

/// Serve on an already bound listener
pub async fn serve_with_listener(listener: TcpListener, state: AppState) -> Result<()> {
    let state = Arc::new(state);
    spawn_lease_pruner(state.clone());

    axum::serve(listener, create_router(state)).await?;

    Ok(())
}

/// Create the relay router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Relay host
        .route("/health", get(handlers::health))
        .route("/connect", get(websocket::ws_handler))
        // Tenant hosts
        .route("/sse", get(handlers::sse))
        .route("/message", post(handlers::message))
        .route("/mcp", post(handlers::mcp_post).delete(handlers::mcp_delete))
        .route("/ws", get(handlers::ws))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false))
                .on_response(DefaultOnResponse::new()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn spawn_lease_pruner(state: Arc<AppState>) {
    let every = Duration::from_secs((state.config.lease_secs / 2).max(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            let pruned = state.routes.prune_expired();
            if pruned > 0 {
                tracing::debug!(pruned, "Expired subdomain leases released");
            }
        }
    });
}
