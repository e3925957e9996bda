//! Client channel admission: path → sandbox port → bridge.

use axum::{
    extract::{FromRequest, Request, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use shared_types::parse_sandbox_route;
use tracing::{debug, error, warn};

use crate::proxy;
use crate::state::RelayState;

/// Admit a client channel at `/<sandbox-port>[/<path>]`.
///
/// A path whose first segment is not a port is refused with 400 before the
/// upgrade, so no upstream channel is ever opened for it.
pub async fn relay_connection(State(state): State<RelayState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let route = match parse_sandbox_route(&path) {
        Ok(route) => route,
        Err(e) => {
            warn!(%path, "refusing channel: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let ws = match WebSocketUpgrade::from_request(req, &()).await {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(%path, "not a websocket upgrade: {rejection}");
            return rejection.into_response();
        }
    };

    let url = proxy::upstream_url(state.upstream_host, route.port, &route.rest);
    let connect_timeout = state.upstream_connect_timeout;
    ws.on_upgrade(move |socket| async move {
        match proxy::bridge(socket, url, connect_timeout).await {
            Ok(stats) => debug!(%path, ?stats, "client channel finished"),
            Err(e) => error!(%path, "client channel refused by sandbox: {e}"),
        }
    })
}
