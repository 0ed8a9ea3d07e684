//! Any-method HTTP proxy under a tunnel id.
//!
//! `/{method} /api/proxy/{id}/{path...}` relays to the tunnel's loopback
//! port. Remote paths under the configured WebSocket prefix are never
//! proxied as plain HTTP — the target speaks the upgrade protocol there, so
//! the request is dispatched into the WebSocket relay instead.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path as AxumPath, Request, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    Extension,
};

use crate::error::GatewayError;
use crate::proxy::{http as http_relay, ws as ws_relay};
use crate::session::Session;
use crate::AppState;

/// `ANY /api/proxy/{id}` — relay with an empty remote path.
pub async fn proxy_root(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<u64>,
    Extension(session): Extension<Arc<Session>>,
    request: Request,
) -> Response {
    relay_request(state, session, id, String::new(), request).await
}

/// `ANY /api/proxy/{id}/{path...}` — relay an arbitrary exchange.
pub async fn proxy(
    State(state): State<AppState>,
    AxumPath((id, path)): AxumPath<(u64, String)>,
    Extension(session): Extension<Arc<Session>>,
    request: Request,
) -> Response {
    relay_request(state, session, id, path, request).await
}

async fn relay_request(
    state: AppState,
    session: Arc<Session>,
    id: u64,
    path: String,
    request: Request,
) -> Response {
    // Interactive kernel channels only ever speak the upgrade protocol on
    // this prefix; hand the request to the WebSocket relay.
    if path.starts_with(&state.config.proxy.ws_prefix) {
        let (mut parts, _body) = request.into_parts();
        let headers = parts.headers.clone();
        let query = parts.uri.query().map(ToString::to_string);
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws_relay::upgrade(state, session, id, path, query, headers, ws).await,
            Err(rejection) => rejection.into_response(),
        };
    }

    let set = match state.sessions.resolve_set(&session).await {
        Ok(set) => set,
        Err(e) => return e.into_response(),
    };
    let Some(dependency) = set.get(id).filter(|d| d.is_http() && d.tunnel().is_running()) else {
        return GatewayError::NoSuchTunnel.into_response();
    };

    match http_relay::relay(&state.http_client, &dependency, &path, request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            tracing::warn!(id, "HTTP relay failed: {e}");
            e.into_response()
        }
    }
}
