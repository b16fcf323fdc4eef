use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};

use crate::{
    Gateway,
    hooks::StatusLine,
    net::{client_ip, is_private_ip},
};

/// Name reported by the info endpoint.
pub const SERVICE_NAME: &str = "webircgateway";

// ── Routes ───────────────────────────────────────────────────────────────────

/// Built-in routes mounted next to the transport adapters.
pub fn routes(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/webirc/info", get(info_handler))
        .route("/webirc/_status", get(status_handler))
        .with_state(gateway)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn info_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status_handler(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    // Unix socket listeners carry no peer address.
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(peer, request.headers(), &gateway.config().reverse_proxies);

    if !is_private_ip(ip) {
        return StatusCode::FORBIDDEN.into_response();
    }

    status_report(&gateway).into_response()
}

/// One line per registered session, each offered to `status.client`
/// observers first.
pub fn status_report(gateway: &Gateway) -> String {
    let mut out = String::new();
    for session in gateway.sessions().snapshot() {
        let mut event = StatusLine {
            line: session.status_line(),
            session,
            halt: false,
        };
        gateway.hooks().dispatch(&mut event);
        if !event.halt {
            out.push_str(&event.line);
            out.push('\n');
        }
    }
    out
}
