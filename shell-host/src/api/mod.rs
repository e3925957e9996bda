//! HTTP surface of the shell host: a health check and the shell channel.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

pub mod shell;

use crate::actors::ShellInfo;
use crate::app_state::AppState;

/// Every path other than `/health` is the shell channel.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .fallback(shell::shell_websocket)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    shell: Option<ShellInfo>,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.shell().info().await {
        Some(info) if info.is_running => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                shell: Some(info),
            }),
        ),
        info => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "exited",
                shell: info,
            }),
        ),
    }
}
