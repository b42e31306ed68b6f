use anyhow::Result;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use log::{error, info};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::smtp::SessionRegistry;

/// Handler for the health check endpoint: reports liveness plus the number
/// of SMTP sessions currently admitted.
async fn health_check_handler(State(sessions): State<SessionRegistry>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": sessions.count(),
    }))
}

/// Runs the health check HTTP server.
///
/// Binds to the address specified in the config and serves the `/health`
/// endpoint until the process exits.
pub async fn run_health_server(config: Config, sessions: SessionRegistry) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_check_handler))
        .with_state(sessions);

    let addr_str = format!("{}:{}", config.health_bind_address, config.health_port);

    let listener = TcpListener::bind(&addr_str).await.map_err(|e| {
        error!("Failed to bind health check server to {}: {}", addr_str, e);
        anyhow::anyhow!("Failed to bind health check server: {}", e)
    })?;

    info!("Health check server listening on {}", addr_str);

    axum::serve(listener, app).await.map_err(|e| {
        error!("Health check server error: {}", e);
        anyhow::anyhow!("Health check server failed: {}", e)
    })?;

    Ok(())
}
