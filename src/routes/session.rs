//! REST endpoints for session and identity management.
//!
//! - `POST   /api/session/identity` — attach an authenticated identity
//! - `GET    /api/session`          — current session and identity info
//! - `DELETE /api/session`          — end the session, stopping its tunnels
//!
//! Identity attachment is the hand-off point from the external auth flow:
//! passage trusts the deposited username and pairs it with the gateway's
//! configured SSH credential.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::session::{Identity, Session};
use crate::AppState;

#[derive(Deserialize)]
pub struct AttachIdentityRequest {
    pub username: String,
}

/// `POST /api/session/identity` — attach the authenticated username to the
/// caller's session.
pub async fn attach_identity(
    State(_state): State<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Json(payload): Json<AttachIdentityRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if payload.username.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "username is required", "code": "INVALID_REQUEST"})),
        ));
    }
    let username = payload.username.trim().to_string();
    session.set_identity(Identity {
        username: username.clone(),
    });
    info!(session_id = %session.id(), username = %username, "Identity attached");
    Ok(Json(json!({"username": username})))
}

/// `GET /api/session` — current session info.
pub async fn info_session(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<Session>>,
) -> Json<Value> {
    let username = session.identity().map(|i| i.username);
    let tunnels = match state.sessions.resolve_set(&session).await {
        Ok(set) => set.len(),
        Err(_) => 0,
    };
    Json(json!({
        "session_id": session.id(),
        "username": username,
        "tunnels": tunnels,
    }))
}

/// `DELETE /api/session` — end the caller's session.
///
/// Every tunnel dependency in the session's set is stopped, mirroring what
/// happens when a session expires server-side.
pub async fn end_session(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<Session>>,
) -> Json<Value> {
    let mut stopped = 0usize;
    if let Some(set) = session.attached_set() {
        for dependency in set.members() {
            state.registry.stop(&dependency);
            stopped += 1;
        }
    }
    state.sessions.remove(session.id());
    info!(session_id = %session.id(), stopped, "Session ended");
    Json(json!({"message": "session ended", "tunnels_stopped": stopped}))
}
