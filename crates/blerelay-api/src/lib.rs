pub mod handlers;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// All routes, nested under `/api`.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/devices", get(handlers::handle_devices))
        .route("/devices/stream", get(handlers::handle_device_stream))
        .route("/proxies", get(handlers::handle_proxies))
        .route("/sessions", get(handlers::handle_sessions))
        .route("/connect", post(handlers::handle_connect))
        .route("/ws", get(ws::handle_ws))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, bind: &str, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((bind, port)).await?;
    tracing::info!(bind, port, "API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
