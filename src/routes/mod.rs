//! HTTP route handlers and router assembly.
//!
//! Each sub-module corresponds to an API endpoint group. Everything except
//! [`health`] runs behind the session middleware; tunnel and proxy routes
//! additionally require an attached identity.

pub mod health;
pub mod proxy;
pub mod session;
pub mod tunnels;

use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::proxy::ws;
use crate::AppState;

/// Assemble the full application router.
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/api/health", get(health::health));

    let identity_routes = Router::new()
        .route(
            "/api/session",
            get(session::info_session).delete(session::end_session),
        )
        .route(
            "/api/tunnels/http",
            post(tunnels::start_http).get(tunnels::list_http),
        )
        .route(
            "/api/tunnels/http/{id}",
            axum::routing::delete(tunnels::stop_http),
        )
        .route(
            "/api/tunnels/desktop",
            post(tunnels::start_desktop).get(tunnels::list_desktop),
        )
        .route(
            "/api/tunnels/desktop/{id}",
            axum::routing::delete(tunnels::stop_desktop),
        )
        .route("/api/proxy/{id}", any(proxy::proxy_root))
        .route("/api/proxy/{id}/{*path}", any(proxy::proxy))
        .route("/api/ws/{id}", get(ws::ws_proxy_root))
        .route("/api/ws/{id}/{*path}", get(ws::ws_proxy))
        .layer(middleware::from_fn(auth::require_identity));

    let session_routes =
        Router::new().route("/api/session/identity", post(session::attach_identity));

    let with_session = Router::new()
        .merge(identity_routes)
        .merge(session_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::with_session,
        ));

    Router::new()
        .merge(public)
        .merge(with_session)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
