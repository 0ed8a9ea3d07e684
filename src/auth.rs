//! Session-cookie middleware and identity guard.
//!
//! Every request under the API gets a session: the `with_session` layer
//! resolves the HttpOnly cookie (minting a fresh session when it is absent
//! or stale) and injects the [`Session`] as a request extension. Routes that
//! act on tunnels additionally sit behind `require_identity`, which rejects
//! sessions the external auth flow has not yet populated.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::GatewayError;
use crate::session::Session;
use crate::util;
use crate::AppState;

/// Resolve (or mint) the caller's session and expose it as an extension.
/// Fresh sessions get a `Set-Cookie` on the way out.
pub async fn with_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let cookie_name = &state.config.server.session_cookie;
    let sid = util::cookie_value(request.headers(), cookie_name);
    let (session, created) = state.sessions.get_or_create(sid.as_deref());
    request.extensions_mut().insert(session.clone());

    let mut response = next.run(request).await;
    if created {
        let cookie = format!("{cookie_name}={}; Path=/; HttpOnly", session.id());
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

/// Reject requests whose session has no attached identity.
pub async fn require_identity(request: Request, next: Next) -> Response {
    let has_identity = request
        .extensions()
        .get::<Arc<Session>>()
        .is_some_and(|s| s.identity().is_some());
    if !has_identity {
        return GatewayError::Unauthorized.into_response();
    }
    next.run(request).await
}
