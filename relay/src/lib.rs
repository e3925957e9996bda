//! Relay router
//!
//! Every client channel arrives at `/<sandbox-port>` and is paired with a
//! fresh channel to the shell host published on that port. The relay holds
//! no session registry; each pair lives in its own task.

pub mod config;
pub mod gateway;
pub mod proxy;
pub mod route;
pub mod state;

use axum::{extract::State, routing::get, Json, Router};
use tower_http::trace::TraceLayer;

pub use state::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(route::relay_connection)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "upstream_host": state.upstream_host.to_string(),
    }))
}
